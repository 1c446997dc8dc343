use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    names::{NameProvider, NameSourceError},
    placement::arrange,
    rules::{ReefConfig, RuleSet, RuntimeSettings},
    scheduler::{RegenerationScheduler, SchedulerHandle, SchedulerStats},
    store::{SensorStore, StoreError},
    synthesis::{random_seed, seeded_rng, ReadingSynthesizer},
    telemetry::{GeneratorTelemetry, Level},
    topology::TopologyBuilder,
    worker::{WorkerContext, WorkerPool, WorkerReport},
};

/// Errors that abort [`Generator::start`].
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// The species catalogue could not be loaded.
    #[error("name source failed: {0}")]
    NameSource(#[from] NameSourceError),
    /// The species catalogue loaded but was empty.
    #[error("name source returned no species")]
    EmptyNamePool,
    /// Listing existing groups or sensors failed.
    #[error("bootstrap failed: {0}")]
    Store(#[from] StoreError),
    /// `start` was already called on this generator.
    #[error("generator already started")]
    AlreadyStarted,
}

/// What `start` set up.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StartReport {
    /// Seed every random generator was derived from.
    pub seed: u64,
    /// Sensors handed to the scheduler.
    pub tracked: usize,
    /// Groups created by this start.
    pub groups_created: usize,
    /// Groups that failed to persist.
    pub groups_skipped: usize,
    /// True when an existing topology was reloaded.
    pub reloaded: bool,
    /// Species available to readings.
    pub species: usize,
    /// Worker count.
    pub pool_size: usize,
}

/// Final counters once everything drained.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Scheduler counters at exit.
    pub scheduler: SchedulerStats,
    /// Per-worker totals.
    pub workers: Vec<WorkerReport>,
}

struct Running {
    cancel: CancellationToken,
    scheduler: SchedulerHandle,
    supervisor: Option<JoinHandle<RunSummary>>,
}

/// Sensor data generator: bootstrap, then regenerate readings until stopped.
pub struct Generator {
    rules: Arc<RuleSet>,
    settings: RuntimeSettings,
    store: Arc<dyn SensorStore>,
    names: Arc<dyn NameProvider>,
    telemetry: GeneratorTelemetry,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("rules", &self.rules)
            .field("settings", &self.settings)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Generator {
    /// Returns a builder.
    #[must_use]
    pub fn builder(store: Arc<dyn SensorStore>, names: Arc<dyn NameProvider>) -> GeneratorBuilder {
        GeneratorBuilder::new(store, names)
    }

    /// Effective rules.
    #[must_use]
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Telemetry handle.
    #[must_use]
    pub fn telemetry(&self) -> &GeneratorTelemetry {
        &self.telemetry
    }

    /// Loads names, bootstraps the topology, and launches the scheduler and
    /// workers. Returns once regeneration is running.
    ///
    /// Cancelling `parent` stops the generator just like [`Generator::stop`].
    pub async fn start(&self, parent: &CancellationToken) -> Result<StartReport, GeneratorError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(GeneratorError::AlreadyStarted);
        }
        match self.launch(parent).await {
            Ok(report) => Ok(report),
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                self.log(
                    Level::ERROR,
                    "generator.start.failed",
                    json!({ "error": err.to_string() }),
                );
                Err(err)
            }
        }
    }

    async fn launch(&self, parent: &CancellationToken) -> Result<StartReport, GeneratorError> {
        let species = self.names.names().await?;
        if species.is_empty() {
            return Err(GeneratorError::EmptyNamePool);
        }

        let seed = self.settings.seed.unwrap_or_else(random_seed);
        let mut rng = seeded_rng(seed);
        let topology = TopologyBuilder::new(
            Arc::clone(&self.rules),
            Arc::clone(&self.store),
            self.telemetry.clone(),
        )
        .bootstrap(&mut rng)
        .await?;
        let placed = arrange(topology.sensors);

        let pool = WorkerPool::new(self.settings.pool_size(), seed.wrapping_add(1));
        let (dispatch_tx, dispatch_rx) = mpsc::channel(self.settings.queue_capacity());
        let tracked = placed.len();
        let (scheduler, handle) = RegenerationScheduler::new(
            placed,
            dispatch_tx,
            self.settings.retry,
            self.telemetry.clone(),
        );
        let species_count = species.len();
        let context = WorkerContext::new(
            Arc::clone(&self.store),
            ReadingSynthesizer::new(Arc::clone(&self.rules), species.into()),
            handle.clone(),
            self.telemetry.clone(),
        );
        let workers = pool.spawn(dispatch_rx, context);

        let cancel = parent.child_token();
        let supervisor = tokio::spawn(supervise(
            scheduler,
            workers,
            cancel.clone(),
            self.telemetry.clone(),
        ));
        *self.running.lock() = Some(Running {
            cancel,
            scheduler: handle,
            supervisor: Some(supervisor),
        });

        let report = StartReport {
            seed,
            tracked,
            groups_created: topology.groups_created,
            groups_skipped: topology.groups_skipped,
            reloaded: topology.reloaded,
            species: species_count,
            pool_size: pool.size(),
        };
        self.log(Level::INFO, "generator.started", json!(report));
        Ok(report)
    }

    /// Requests a cooperative stop. Returns immediately.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().as_ref() {
            running.cancel.cancel();
            self.log(Level::INFO, "generator.stop", json!({}));
        }
    }

    /// Waits until the scheduler exited and every worker drained. Only the
    /// first caller receives the summary.
    pub async fn wait(&self) -> Option<RunSummary> {
        let supervisor = self
            .running
            .lock()
            .as_mut()
            .and_then(|running| running.supervisor.take())?;
        match supervisor.await {
            Ok(summary) => Some(summary),
            Err(err) => {
                self.log(
                    Level::ERROR,
                    "generator.supervisor.failed",
                    json!({ "error": err.to_string() }),
                );
                None
            }
        }
    }

    /// [`Generator::stop`] followed by [`Generator::wait`].
    pub async fn shutdown(&self) -> Option<RunSummary> {
        self.stop();
        self.wait().await
    }

    /// Live scheduler counters, once started.
    #[must_use]
    pub fn stats(&self) -> Option<SchedulerStats> {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.scheduler.stats())
    }

    /// Handle for tracking extra sensors, once started.
    #[must_use]
    pub fn scheduler(&self) -> Option<SchedulerHandle> {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.scheduler.clone())
    }

    fn log(&self, level: Level, message: &str, metadata: serde_json::Value) {
        self.telemetry.log(level, message, metadata);
    }
}

async fn supervise(
    scheduler: RegenerationScheduler,
    mut workers: tokio::task::JoinSet<WorkerReport>,
    cancel: CancellationToken,
    telemetry: GeneratorTelemetry,
) -> RunSummary {
    let stats = scheduler.run(cancel).await;
    let mut summary = RunSummary {
        scheduler: stats,
        workers: Vec::new(),
    };
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(report) => summary.workers.push(report),
            Err(err) => {
                telemetry.log(
                    Level::ERROR,
                    "worker.join.failed",
                    json!({ "error": err.to_string() }),
                );
            }
        }
    }
    summary.workers.sort_by_key(|report| report.worker);
    telemetry.flush().await;
    summary
}

/// Builder for [`Generator`].
pub struct GeneratorBuilder {
    store: Arc<dyn SensorStore>,
    names: Arc<dyn NameProvider>,
    rules: RuleSet,
    settings: RuntimeSettings,
    telemetry: Option<GeneratorTelemetry>,
}

impl GeneratorBuilder {
    /// Creates a builder with default rules and settings.
    #[must_use]
    pub fn new(store: Arc<dyn SensorStore>, names: Arc<dyn NameProvider>) -> Self {
        Self {
            store,
            names,
            rules: RuleSet::default(),
            settings: RuntimeSettings::default(),
            telemetry: None,
        }
    }

    /// Sets generation rules.
    #[must_use]
    pub fn rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    /// Sets runtime settings.
    #[must_use]
    pub fn settings(mut self, settings: RuntimeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Applies a whole configuration document.
    #[must_use]
    pub fn config(self, config: ReefConfig) -> Self {
        self.rules(config.rules).settings(config.runtime)
    }

    /// Uses an existing telemetry handle instead of building one from settings.
    #[must_use]
    pub fn telemetry(mut self, telemetry: GeneratorTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Finalises the generator.
    ///
    /// # Errors
    ///
    /// Fails when `log_path` is set and the journal cannot be opened, or
    /// when called outside a tokio runtime with a journal configured.
    pub fn build(self) -> Result<Generator> {
        let telemetry = match self.telemetry {
            Some(telemetry) => telemetry,
            None => {
                let mut builder = GeneratorTelemetry::builder("reef-generator");
                if let Some(path) = &self.settings.log_path {
                    builder = builder.log_path(path);
                }
                builder.build()?
            }
        };
        Ok(Generator {
            rules: Arc::new(self.rules.normalized()),
            settings: self.settings,
            store: self.store,
            names: self.names,
            telemetry,
            started: AtomicBool::new(false),
            running: Mutex::new(None),
        })
    }
}
