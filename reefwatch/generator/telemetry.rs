//! Generator activity reporting.
//!
//! Every call is mirrored to `tracing` on the caller's task. The optional
//! journal file and event publisher are fed through a bounded channel and
//! drained by a background task, so the scheduler and workers never wait
//! on a slow sink. When the channel is full the entry is dropped and
//! counted.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
    runtime::Handle,
    sync::{mpsc, oneshot},
};

pub use tracing::Level;

use crate::events::{EventPublisher, GeneratorEvent, GeneratorEventKind};

const DEFAULT_SOURCE: &str = "reef-generator";
const DEFAULT_BACKLOG: usize = 1024;

#[derive(Debug, Serialize)]
struct JournalLine {
    at: DateTime<Utc>,
    level: &'static str,
    source: Arc<str>,
    op: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    fields: Value,
}

enum Entry {
    Line(JournalLine),
    Event(GeneratorEvent),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
struct Sink {
    tx: mpsc::Sender<Entry>,
    journal: Option<Arc<Path>>,
    events: bool,
}

/// Configures the optional sinks of a [`GeneratorTelemetry`].
pub struct GeneratorTelemetryBuilder {
    source: String,
    journal: Option<PathBuf>,
    publisher: Option<Arc<dyn EventPublisher>>,
    backlog: usize,
}

impl GeneratorTelemetryBuilder {
    /// Starts a builder whose entries carry `source`.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            journal: None,
            publisher: None,
            backlog: DEFAULT_BACKLOG,
        }
    }

    /// Appends every log call as a JSON line to `path`.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal = Some(path.into());
        self
    }

    /// Forwards lifecycle events to `publisher`.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Entries buffered before new ones are dropped (at least one).
    #[must_use]
    pub fn backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog.max(1);
        self
    }

    /// Opens the journal and starts the drain task on the current runtime.
    ///
    /// # Errors
    ///
    /// Fails when the journal cannot be opened, or when a sink is configured
    /// outside a tokio runtime.
    pub fn build(self) -> Result<GeneratorTelemetry> {
        let source: Arc<str> = self.source.into();
        if self.journal.is_none() && self.publisher.is_none() {
            return Ok(GeneratorTelemetry::bare(source));
        }
        let runtime = Handle::try_current().context("telemetry sinks need a tokio runtime")?;
        let writer = self.journal.as_deref().map(open_journal).transpose()?;
        let (tx, rx) = mpsc::channel(self.backlog);
        runtime.spawn(drain(rx, writer, self.publisher.clone()));
        Ok(GeneratorTelemetry {
            source,
            sink: Some(Sink {
                tx,
                journal: self.journal.map(Arc::from),
                events: self.publisher.is_some(),
            }),
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }
}

fn open_journal(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening journal {}", path.display()))?;
    Ok(BufWriter::new(File::from_std(file)))
}

async fn drain(
    mut rx: mpsc::Receiver<Entry>,
    mut journal: Option<BufWriter<File>>,
    publisher: Option<Arc<dyn EventPublisher>>,
) {
    while let Some(entry) = rx.recv().await {
        match entry {
            Entry::Line(line) => {
                if let Some(writer) = journal.as_mut() {
                    if let Err(err) = append_line(writer, &line).await {
                        tracing::warn!(%err, "journal write failed");
                    }
                }
            }
            Entry::Event(event) => {
                if let Some(publisher) = &publisher {
                    if let Err(err) = publisher.publish(event).await {
                        tracing::warn!(%err, "event publish failed");
                    }
                }
            }
            Entry::Flush(ack) => {
                if let Some(writer) = journal.as_mut() {
                    if let Err(err) = writer.flush().await {
                        tracing::warn!(%err, "journal flush failed");
                    }
                }
                let _ = ack.send(());
            }
        }
    }
    if let Some(writer) = journal.as_mut() {
        let _ = writer.flush().await;
    }
}

async fn append_line(writer: &mut BufWriter<File>, line: &JournalLine) -> Result<()> {
    let mut data = serde_json::to_vec(line)?;
    data.push(b'\n');
    writer.write_all(&data).await?;
    Ok(())
}

/// Reporting handle shared by bootstrap, scheduler and workers.
#[derive(Clone)]
pub struct GeneratorTelemetry {
    source: Arc<str>,
    sink: Option<Sink>,
    dropped: Arc<AtomicU64>,
}

impl fmt::Debug for GeneratorTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorTelemetry")
            .field("source", &self.source)
            .field("journal", &self.sink.as_ref().and_then(|s| s.journal.as_deref()))
            .field("events", &self.sink.as_ref().is_some_and(|s| s.events))
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl Default for GeneratorTelemetry {
    fn default() -> Self {
        Self::bare(DEFAULT_SOURCE.into())
    }
}

impl GeneratorTelemetry {
    fn bare(source: Arc<str>) -> Self {
        Self {
            source,
            sink: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a builder.
    #[must_use]
    pub fn builder(source: impl Into<String>) -> GeneratorTelemetryBuilder {
        GeneratorTelemetryBuilder::new(source)
    }

    /// Label attached to every entry.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Entries discarded because the sink backlog was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records `op` with structured fields.
    pub fn log(&self, level: Level, op: &str, fields: Value) {
        let source = &*self.source;
        match level {
            Level::ERROR => tracing::error!(source, %fields, "{op}"),
            Level::WARN => tracing::warn!(source, %fields, "{op}"),
            Level::INFO => tracing::info!(source, %fields, "{op}"),
            Level::DEBUG => tracing::debug!(source, %fields, "{op}"),
            _ => tracing::trace!(source, %fields, "{op}"),
        }
        if self.sink.as_ref().is_some_and(|s| s.journal.is_some()) {
            self.enqueue(Entry::Line(JournalLine {
                at: Utc::now(),
                level: level.as_str(),
                source: Arc::clone(&self.source),
                op: op.to_owned(),
                fields,
            }));
        }
    }

    /// Queues an event for the attached publisher. Never waits.
    pub fn event(&self, kind: GeneratorEventKind) {
        if self.sink.as_ref().is_some_and(|s| s.events) {
            self.enqueue(Entry::Event(GeneratorEvent::new(&*self.source, kind)));
        }
    }

    /// Waits until everything queued so far has reached the sinks.
    pub async fn flush(&self) {
        let Some(sink) = &self.sink else { return };
        let (ack, done) = oneshot::channel();
        if sink.tx.send(Entry::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    fn enqueue(&self, entry: Entry) {
        let Some(sink) = &self.sink else { return };
        if let Err(mpsc::error::TrySendError::Full(_)) = sink.tx.try_send(entry) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
