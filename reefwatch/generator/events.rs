use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::broadcast};
use uuid::Uuid;

use crate::model::{GroupId, SensorId};

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratorEventKind {
    /// A group and its sensors were persisted at bootstrap.
    GroupCreated {
        /// Group id.
        group_id: GroupId,
        /// Group name.
        name: String,
        /// Number of sensors created with it.
        sensors: usize,
    },
    /// A group could not be persisted and was left out.
    GroupSkipped {
        /// Group name.
        name: String,
        /// Failure description.
        reason: String,
    },
    /// A sensor entered the schedule.
    SensorTracked {
        /// Sensor id.
        sensor_id: SensorId,
    },
    /// A due sensor was handed to the worker queue.
    Dispatched {
        /// Sensor id.
        sensor_id: SensorId,
        /// Dispatches outstanding after this one.
        in_flight: usize,
    },
    /// A reading bundle was persisted.
    UpdateSucceeded {
        /// Sensor id.
        sensor_id: SensorId,
        /// Transparency written.
        transparency: u8,
        /// Temperature written.
        temperature: f64,
    },
    /// Persisting a reading bundle failed.
    UpdateFailed {
        /// Sensor id.
        sensor_id: SensorId,
        /// Failure description.
        error: String,
    },
    /// The scheduler loop exited.
    SchedulerStopped {
        /// Total dispatches.
        dispatched: u64,
        /// Total successful updates.
        succeeded: u64,
        /// Total failed updates.
        failed: u64,
    },
}

/// Event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorEvent {
    /// Unique identifier.
    pub id: Uuid,
    /// Emitting module.
    pub source: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    #[serde(flatten)]
    pub kind: GeneratorEventKind,
}

impl GeneratorEvent {
    /// Wraps a payload with a fresh id and timestamp.
    #[must_use]
    pub fn new(source: impl Into<String>, kind: GeneratorEventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Event publisher interface.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes an event.
    async fn publish(&self, event: GeneratorEvent) -> Result<()>;
}

/// In-memory broadcast bus with a bounded backlog.
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    sender: broadcast::Sender<GeneratorEvent>,
    backlog: Arc<Mutex<VecDeque<GeneratorEvent>>>,
    capacity: usize,
}

impl MemoryEventBus {
    /// Creates a bus retaining at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Subscribes to live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GeneratorEvent> {
        self.sender.subscribe()
    }

    /// Recent events, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<GeneratorEvent> {
        self.backlog.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn publish(&self, event: GeneratorEvent) -> Result<()> {
        {
            let mut backlog = self.backlog.lock();
            if backlog.len() == self.capacity {
                backlog.pop_front();
            }
            backlog.push_back(event.clone());
        }
        // no live subscribers is not an error
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Appends events as JSON lines to a file.
#[derive(Debug, Clone)]
pub struct FileEventPublisher {
    path: PathBuf,
}

impl FileEventPublisher {
    /// Creates a publisher writing to `path`, creating parent directories.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }
}

#[async_trait]
impl EventPublisher for FileEventPublisher {
    async fn publish(&self, event: GeneratorEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut data = serde_json::to_vec(&event)?;
        data.push(b'\n');
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tracked() -> GeneratorEvent {
        GeneratorEvent::new(
            "tests",
            GeneratorEventKind::SensorTracked {
                sensor_id: Uuid::new_v4(),
            },
        )
    }

    #[tokio::test]
    async fn memory_bus_delivers_and_retains() {
        let bus = MemoryEventBus::new(2);
        let mut rx = bus.subscribe();
        bus.publish(tracked()).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert!(matches!(first.kind, GeneratorEventKind::SensorTracked { .. }));
        bus.publish(tracked()).await.unwrap();
        bus.publish(tracked()).await.unwrap();
        let snapshot = bus.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_ne!(snapshot[0].id, first.id);
    }

    #[tokio::test]
    async fn file_publisher_writes_tagged_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events/reef.jsonl");
        let publisher = FileEventPublisher::new(&path).unwrap();
        publisher.publish(tracked()).await.unwrap();
        publisher.publish(tracked()).await.unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"kind\":\"sensor_tracked\""));
    }
}
