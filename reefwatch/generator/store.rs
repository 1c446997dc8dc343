//! Persistence gateway consumed by bootstrap and the worker pool.

use std::path::Path;

use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Group, GroupId, ReadingBundle, Sensor, SensorId};

/// Errors emitted by a persistence backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A group with the same name already exists.
    #[error("group {0} already exists")]
    DuplicateGroup(String),
    /// The referenced sensor was never created.
    #[error("unknown sensor {0}")]
    UnknownSensor(SensorId),
    /// The write was rejected before anything was stored.
    #[error("invalid write: {0}")]
    Invalid(String),
    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// Snapshot I/O or encoding failure.
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

/// Narrow create/read/update contract. Every write is all-or-nothing.
#[async_trait]
pub trait SensorStore: Send + Sync {
    /// All persisted groups.
    async fn list_groups(&self) -> Result<Vec<Group>, StoreError>;

    /// All persisted sensors.
    async fn list_sensors(&self) -> Result<Vec<Sensor>, StoreError>;

    /// Persists a group together with its sensors.
    async fn create_group_with_sensors(
        &self,
        group: &Group,
        sensors: &[Sensor],
    ) -> Result<(), StoreError>;

    /// Persists one reading bundle for `sensor_id`.
    async fn update_sensor_reading(
        &self,
        sensor_id: SensorId,
        bundle: &ReadingBundle,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct StoreState {
    groups: IndexMap<GroupId, Group>,
    sensors: IndexMap<SensorId, Sensor>,
    latest: IndexMap<SensorId, ReadingBundle>,
    updates: IndexMap<SensorId, u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    groups: Vec<Group>,
    sensors: Vec<Sensor>,
    latest: Vec<ReadingBundle>,
}

/// In-process store keeping every group, sensor and the latest bundle per sensor.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest bundle written for a sensor.
    #[must_use]
    pub fn latest_reading(&self, sensor_id: SensorId) -> Option<ReadingBundle> {
        self.state.lock().latest.get(&sensor_id).cloned()
    }

    /// Successful updates recorded for a sensor since the store was created.
    #[must_use]
    pub fn update_count(&self, sensor_id: SensorId) -> u64 {
        self.state
            .lock()
            .updates
            .get(&sensor_id)
            .copied()
            .unwrap_or_default()
    }

    /// Successful updates across all sensors.
    #[must_use]
    pub fn total_updates(&self) -> u64 {
        self.state.lock().updates.values().sum()
    }

    /// Writes groups, sensors and latest readings as JSON.
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        let snapshot = {
            let state = self.state.lock();
            Snapshot {
                groups: state.groups.values().cloned().collect(),
                sensors: state.sensors.values().cloned().collect(),
                latest: state.latest.values().cloned().collect(),
            }
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StoreError::Snapshot(err.to_string()))?;
        }
        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| StoreError::Snapshot(err.to_string()))?;
        std::fs::write(path, data).map_err(|err| StoreError::Snapshot(err.to_string()))
    }

    /// Restores a store from [`MemoryStore::save_snapshot`] output.
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let raw =
            std::fs::read(path.as_ref()).map_err(|err| StoreError::Snapshot(err.to_string()))?;
        let snapshot: Snapshot =
            serde_json::from_slice(&raw).map_err(|err| StoreError::Snapshot(err.to_string()))?;
        let state = StoreState {
            groups: snapshot.groups.into_iter().map(|g| (g.id, g)).collect(),
            sensors: snapshot.sensors.into_iter().map(|s| (s.id, s)).collect(),
            latest: snapshot
                .latest
                .into_iter()
                .map(|b| (b.sensor_id(), b))
                .collect(),
            updates: IndexMap::new(),
        };
        Ok(Self {
            state: Mutex::new(state),
        })
    }
}

#[async_trait]
impl SensorStore for MemoryStore {
    async fn list_groups(&self) -> Result<Vec<Group>, StoreError> {
        Ok(self.state.lock().groups.values().cloned().collect())
    }

    async fn list_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        Ok(self.state.lock().sensors.values().cloned().collect())
    }

    async fn create_group_with_sensors(
        &self,
        group: &Group,
        sensors: &[Sensor],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.groups.values().any(|existing| existing.name == group.name) {
            return Err(StoreError::DuplicateGroup(group.name.clone()));
        }
        let mut seen = IndexSet::new();
        for sensor in sensors {
            if sensor.group_id != group.id {
                return Err(StoreError::Invalid(format!(
                    "sensor {} does not belong to group {}",
                    sensor.id, group.name
                )));
            }
            if !seen.insert(sensor.id) || state.sensors.contains_key(&sensor.id) {
                return Err(StoreError::Invalid(format!("duplicate sensor {}", sensor.id)));
            }
        }
        state.groups.insert(group.id, group.clone());
        for sensor in sensors {
            state.sensors.insert(sensor.id, sensor.clone());
        }
        Ok(())
    }

    async fn update_sensor_reading(
        &self,
        sensor_id: SensorId,
        bundle: &ReadingBundle,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if !state.sensors.contains_key(&sensor_id) {
            return Err(StoreError::UnknownSensor(sensor_id));
        }
        validate_bundle(sensor_id, bundle)?;
        state.latest.insert(sensor_id, bundle.clone());
        *state.updates.entry(sensor_id).or_default() += 1;
        Ok(())
    }
}

fn validate_bundle(sensor_id: SensorId, bundle: &ReadingBundle) -> Result<(), StoreError> {
    let foreign = bundle.temperature.sensor_id != sensor_id
        || bundle.transparency.sensor_id != sensor_id
        || bundle.fish.iter().any(|fish| fish.sensor_id != sensor_id);
    if foreign {
        return Err(StoreError::Invalid(format!(
            "bundle rows do not all belong to sensor {sensor_id}"
        )));
    }
    if bundle.transparency.value > 100 {
        return Err(StoreError::Invalid(format!(
            "transparency {} out of range",
            bundle.transparency.value
        )));
    }
    let mut names = IndexSet::new();
    if !bundle.fish.iter().all(|fish| names.insert(fish.name.as_str())) {
        return Err(StoreError::Invalid("duplicate species in bundle".into()));
    }
    Ok(())
}

/// Store wrappers used to exercise failure and concurrency paths.
#[cfg(test)]
pub(crate) mod testing {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::*;

    /// Wraps a [`MemoryStore`], injecting failures and measuring write concurrency.
    #[derive(Debug, Default)]
    pub struct InstrumentedStore {
        pub inner: Arc<MemoryStore>,
        pub write_delay: Duration,
        pub fail_groups: Mutex<IndexSet<String>>,
        pub fail_updates: Mutex<IndexMap<SensorId, usize>>,
        pub panic_updates: Mutex<IndexMap<SensorId, usize>>,
        pub group_creations: AtomicUsize,
        pub executing: AtomicUsize,
        pub max_executing: AtomicUsize,
        pub attempts: Mutex<Vec<(SensorId, tokio::time::Instant, bool)>>,
    }

    impl InstrumentedStore {
        pub fn new(write_delay: Duration) -> Self {
            Self {
                write_delay,
                ..Self::default()
            }
        }

        pub fn fail_next_updates(&self, sensor_id: SensorId, count: usize) {
            self.fail_updates.lock().insert(sensor_id, count);
        }

        pub fn panic_next_updates(&self, sensor_id: SensorId, count: usize) {
            self.panic_updates.lock().insert(sensor_id, count);
        }

        pub fn attempts_for(&self, sensor_id: SensorId) -> Vec<(tokio::time::Instant, bool)> {
            self.attempts
                .lock()
                .iter()
                .filter(|(id, _, _)| *id == sensor_id)
                .map(|(_, at, ok)| (*at, *ok))
                .collect()
        }
    }

    #[async_trait]
    impl SensorStore for InstrumentedStore {
        async fn list_groups(&self) -> Result<Vec<Group>, StoreError> {
            self.inner.list_groups().await
        }

        async fn list_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
            self.inner.list_sensors().await
        }

        async fn create_group_with_sensors(
            &self,
            group: &Group,
            sensors: &[Sensor],
        ) -> Result<(), StoreError> {
            self.group_creations.fetch_add(1, Ordering::SeqCst);
            let blocked = self.fail_groups.lock().contains(&group.name);
            if blocked {
                return Err(StoreError::Unavailable(format!("injected for {}", group.name)));
            }
            self.inner.create_group_with_sensors(group, sensors).await
        }

        async fn update_sensor_reading(
            &self,
            sensor_id: SensorId,
            bundle: &ReadingBundle,
        ) -> Result<(), StoreError> {
            if take_one(&self.panic_updates, sensor_id) {
                panic!("injected panic for {sensor_id}");
            }
            let now = self.executing.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_executing.fetch_max(now, Ordering::SeqCst);
            if !self.write_delay.is_zero() {
                tokio::time::sleep(self.write_delay).await;
            }
            let result = if take_one(&self.fail_updates, sensor_id) {
                Err(StoreError::Unavailable("injected".into()))
            } else {
                self.inner.update_sensor_reading(sensor_id, bundle).await
            };
            self.attempts
                .lock()
                .push((sensor_id, tokio::time::Instant::now(), result.is_ok()));
            self.executing.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn take_one(budget: &Mutex<IndexMap<SensorId, usize>>, sensor_id: SensorId) -> bool {
        let mut budget = budget.lock();
        match budget.get_mut(&sensor_id) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::model::{Coordinate, FishObservation, Temperature, Transparency};

    fn group_with_sensors(name: &str, count: u64) -> (Group, Vec<Sensor>) {
        let group = Group::new(name);
        let sensors = (0..count)
            .map(|idx| {
                Sensor::new(
                    group.id,
                    idx,
                    Coordinate::default(),
                    Duration::from_secs(10),
                )
            })
            .collect();
        (group, sensors)
    }

    fn bundle(sensor_id: SensorId, transparency: u8, fish: &[&str]) -> ReadingBundle {
        let recorded_at = Utc::now();
        ReadingBundle {
            temperature: Temperature {
                sensor_id,
                value: 12.5,
                recorded_at,
            },
            transparency: Transparency {
                sensor_id,
                value: transparency,
                recorded_at,
            },
            fish: fish
                .iter()
                .map(|name| FishObservation {
                    sensor_id,
                    name: (*name).to_string(),
                    count: 1,
                    recorded_at,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn creates_group_with_sensors() {
        let store = MemoryStore::new();
        let (group, sensors) = group_with_sensors("Alpha", 3);
        store
            .create_group_with_sensors(&group, &sensors)
            .await
            .unwrap();
        assert_eq!(store.list_groups().await.unwrap(), vec![group]);
        assert_eq!(store.list_sensors().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rejected_group_writes_nothing() {
        let store = MemoryStore::new();
        let (group, mut sensors) = group_with_sensors("Beta", 2);
        sensors[1].group_id = uuid::Uuid::new_v4();
        let err = store
            .create_group_with_sensors(&group, &sensors)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert!(store.list_groups().await.unwrap().is_empty());
        assert!(store.list_sensors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_group_name_is_rejected() {
        let store = MemoryStore::new();
        let (group, sensors) = group_with_sensors("Gamma", 1);
        store
            .create_group_with_sensors(&group, &sensors)
            .await
            .unwrap();
        let (again, more) = group_with_sensors("Gamma", 1);
        assert_eq!(
            store.create_group_with_sensors(&again, &more).await,
            Err(StoreError::DuplicateGroup("Gamma".into()))
        );
    }

    #[tokio::test]
    async fn update_is_all_or_nothing() {
        let store = MemoryStore::new();
        let (group, sensors) = group_with_sensors("Delta", 1);
        store
            .create_group_with_sensors(&group, &sensors)
            .await
            .unwrap();
        let id = sensors[0].id;

        store
            .update_sensor_reading(id, &bundle(id, 40, &["Grouper", "Lionfish"]))
            .await
            .unwrap();
        let rejected = store
            .update_sensor_reading(id, &bundle(id, 41, &["Grouper", "Grouper"]))
            .await;
        assert!(matches!(rejected, Err(StoreError::Invalid(_))));
        assert_eq!(store.latest_reading(id).unwrap().transparency.value, 40);
        assert_eq!(store.update_count(id), 1);

        let stranger = uuid::Uuid::new_v4();
        assert_eq!(
            store
                .update_sensor_reading(stranger, &bundle(stranger, 1, &[]))
                .await,
            Err(StoreError::UnknownSensor(stranger))
        );
    }

    #[tokio::test]
    async fn snapshot_restores_topology() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/reef.json");
        let store = MemoryStore::new();
        let (group, sensors) = group_with_sensors("Eta", 2);
        store
            .create_group_with_sensors(&group, &sensors)
            .await
            .unwrap();
        store
            .update_sensor_reading(sensors[0].id, &bundle(sensors[0].id, 7, &["Grouper"]))
            .await
            .unwrap();
        store.save_snapshot(&path).unwrap();

        let restored = MemoryStore::load_snapshot(&path).unwrap();
        assert_eq!(restored.list_groups().await.unwrap(), vec![group]);
        assert_eq!(restored.list_sensors().await.unwrap(), sensors);
        assert_eq!(
            restored.latest_reading(sensors[0].id).unwrap().transparency.value,
            7
        );
        assert_eq!(restored.total_updates(), 0);
    }
}
