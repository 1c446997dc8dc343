//! First-run creation of groups and sensors, or reload of what already exists.

use std::{sync::Arc, thread};

use rand::{seq::SliceRandom, Rng};
use serde_json::json;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::instrument;

use crate::{
    events::GeneratorEventKind,
    model::{Coordinate, Group, Sensor},
    rules::{RuleSet, GROUP_NAMES},
    store::{SensorStore, StoreError},
    telemetry::{GeneratorTelemetry, Level},
};

/// Outcome of a bootstrap run.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// Every sensor to track, from all persisted groups.
    pub sensors: Vec<Sensor>,
    /// Groups persisted by this run.
    pub groups_created: usize,
    /// Groups whose creation failed and were left out.
    pub groups_skipped: usize,
    /// True when existing groups were found and nothing was created.
    pub reloaded: bool,
}

/// A group and its sensors before persistence.
#[derive(Debug, Clone)]
pub struct GroupDraft {
    /// Group to create.
    pub group: Group,
    /// Its sensors.
    pub sensors: Vec<Sensor>,
}

/// Builds the sensor population, creating groups in parallel on first run.
#[derive(Clone)]
pub struct TopologyBuilder {
    rules: Arc<RuleSet>,
    store: Arc<dyn SensorStore>,
    telemetry: GeneratorTelemetry,
    max_parallel: usize,
}

impl std::fmt::Debug for TopologyBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyBuilder")
            .field("rules", &self.rules)
            .field("max_parallel", &self.max_parallel)
            .finish_non_exhaustive()
    }
}

impl TopologyBuilder {
    /// Creates a builder bounded by the available parallelism.
    #[must_use]
    pub fn new(
        rules: Arc<RuleSet>,
        store: Arc<dyn SensorStore>,
        telemetry: GeneratorTelemetry,
    ) -> Self {
        let max_parallel = thread::available_parallelism().map_or(1, usize::from);
        Self {
            rules,
            store,
            telemetry,
            max_parallel,
        }
    }

    /// Overrides the cap on concurrent group creations.
    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Reloads existing sensors, or creates `groups_count` groups when the
    /// store holds none. Creating twice against the same store never happens.
    #[instrument(skip_all, name = "bootstrap")]
    pub async fn bootstrap<R: Rng + Send + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<Topology, StoreError> {
        let existing = self.store.list_groups().await?;
        if !existing.is_empty() {
            let sensors = self.store.list_sensors().await?;
            self.log(
                Level::INFO,
                "bootstrap.reload",
                json!({ "groups": existing.len(), "sensors": sensors.len() }),
            );
            return Ok(Topology {
                sensors,
                reloaded: true,
                ..Topology::default()
            });
        }

        let drafts = self.draft_groups(rng);
        self.log(
            Level::INFO,
            "bootstrap.create",
            json!({ "groups": drafts.len(), "max_parallel": self.max_parallel }),
        );
        Ok(self.persist(drafts).await)
    }

    /// Picks distinct group names and drafts every group.
    pub fn draft_groups<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<GroupDraft> {
        let mut names = GROUP_NAMES.to_vec();
        names.shuffle(rng);
        names.truncate(usize::from(self.rules.groups_count));
        names
            .into_iter()
            .map(|name| self.draft_group(rng, name))
            .collect()
    }

    /// Drafts one group with a random number of randomly placed sensors.
    pub fn draft_group<R: Rng + ?Sized>(&self, rng: &mut R, name: &str) -> GroupDraft {
        let group = Group::new(name);
        let per_group = self.rules.sensors_per_group;
        let count = rng.gen_range(per_group.min..=per_group.max);
        let region = self.rules.region;
        let intervals = self.rules.interval_range();
        let sensors = (0..count)
            .map(|index| {
                let position = Coordinate::new(
                    rng.gen_range(region.x.min..=region.x.max),
                    rng.gen_range(region.y.min..=region.y.max),
                    rng.gen_range(region.z.min..=region.z.max),
                );
                let secs = rng.gen_range(intervals.min.as_secs()..=intervals.max.as_secs());
                Sensor::new(
                    group.id,
                    u64::from(index),
                    position,
                    std::time::Duration::from_secs(secs),
                )
            })
            .collect();
        GroupDraft { group, sensors }
    }

    async fn persist(&self, drafts: Vec<GroupDraft>) -> Topology {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut set = JoinSet::new();
        let total = drafts.len();
        for (position, draft) in drafts.into_iter().enumerate() {
            let store = Arc::clone(&self.store);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        store
                            .create_group_with_sensors(&draft.group, &draft.sensors)
                            .await
                    }
                    Err(err) => Err(StoreError::Unavailable(err.to_string())),
                };
                (position, draft, result)
            });
        }

        let mut created: Vec<Option<GroupDraft>> = vec![None; total];
        let mut skipped = 0;
        while let Some(joined) = set.join_next().await {
            let (name, reason) = match joined {
                Ok((position, draft, Ok(()))) => {
                    created[position] = Some(draft);
                    continue;
                }
                Ok((_, draft, Err(err))) => (draft.group.name, err.to_string()),
                Err(err) => ("<unknown>".to_string(), err.to_string()),
            };
            skipped += 1;
            self.log(
                Level::WARN,
                "bootstrap.group.skipped",
                json!({ "group": name, "reason": reason }),
            );
            self.telemetry
                .event(GeneratorEventKind::GroupSkipped { name, reason });
        }

        let mut topology = Topology {
            groups_skipped: skipped,
            ..Topology::default()
        };
        for draft in created.into_iter().flatten() {
            topology.groups_created += 1;
            self.telemetry.event(GeneratorEventKind::GroupCreated {
                group_id: draft.group.id,
                name: draft.group.name.clone(),
                sensors: draft.sensors.len(),
            });
            topology.sensors.extend(draft.sensors);
        }
        self.log(
            Level::INFO,
            "bootstrap.done",
            json!({
                "created": topology.groups_created,
                "skipped": topology.groups_skipped,
                "sensors": topology.sensors.len(),
            }),
        );
        topology
    }

    fn log(&self, level: Level, message: &str, metadata: serde_json::Value) {
        self.telemetry.log(level, message, metadata);
    }
}
