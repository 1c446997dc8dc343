//! Fixed-size worker pool draining the dispatch queue.

use std::sync::Arc;

use chrono::Utc;
use rand::{rngs::SmallRng, Rng};
use serde::Serialize;
use serde_json::json;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
    time::Instant,
};

use crate::{
    events::GeneratorEventKind,
    model::SensorId,
    scheduler::{Completion, Dispatch, SchedulerHandle, UpdateOutcome},
    store::SensorStore,
    synthesis::{seeded_rng, ReadingSynthesizer},
    telemetry::{GeneratorTelemetry, Level},
};

/// What one worker did before the queue closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    /// Worker index.
    pub worker: usize,
    /// Successful updates.
    pub succeeded: u64,
    /// Failed updates.
    pub failed: u64,
}

/// Everything a worker needs to regenerate and persist a reading.
#[derive(Clone)]
pub struct WorkerContext {
    store: Arc<dyn SensorStore>,
    synthesizer: ReadingSynthesizer,
    scheduler: SchedulerHandle,
    telemetry: GeneratorTelemetry,
}

impl WorkerContext {
    /// Bundles the shared worker dependencies.
    #[must_use]
    pub fn new(
        store: Arc<dyn SensorStore>,
        synthesizer: ReadingSynthesizer,
        scheduler: SchedulerHandle,
        telemetry: GeneratorTelemetry,
    ) -> Self {
        Self {
            store,
            synthesizer,
            scheduler,
            telemetry,
        }
    }

    async fn process(&self, rng: &mut SmallRng, dispatch: Dispatch) -> bool {
        let Dispatch {
            slot,
            sensor,
            reference,
            ..
        } = dispatch;
        let sensor_id = sensor.id;
        let seed: u64 = rng.gen();
        let store = Arc::clone(&self.store);
        let synthesizer = self.synthesizer.clone();
        // own task: a panicking store or synthesis still reports back
        let attempt = tokio::spawn(async move {
            let mut rng = seeded_rng(seed);
            let bundle = synthesizer.synthesize(&mut rng, &sensor, reference, Utc::now());
            store
                .update_sensor_reading(sensor.id, &bundle)
                .await
                .map(|()| bundle)
        })
        .await;
        let outcome = match attempt {
            Ok(Ok(bundle)) => {
                self.telemetry.log(
                    Level::DEBUG,
                    "worker.update",
                    json!({
                        "sensor_id": sensor_id,
                        "transparency": bundle.transparency.value,
                        "fish": bundle.fish.len(),
                    }),
                );
                self.telemetry.event(GeneratorEventKind::UpdateSucceeded {
                    sensor_id,
                    transparency: bundle.transparency.value,
                    temperature: bundle.temperature.value,
                });
                UpdateOutcome::Succeeded {
                    at: Instant::now(),
                    transparency: bundle.transparency.value,
                }
            }
            Ok(Err(err)) => self.failed(sensor_id, err.to_string()),
            Err(err) => self.failed(sensor_id, format!("update task aborted: {err}")),
        };
        let succeeded = matches!(outcome, UpdateOutcome::Succeeded { .. });
        self.scheduler.complete(Completion { slot, outcome });
        succeeded
    }

    fn failed(&self, sensor_id: SensorId, error: String) -> UpdateOutcome {
        self.telemetry.log(
            Level::WARN,
            "worker.update.failed",
            json!({ "sensor_id": sensor_id, "error": error }),
        );
        self.telemetry.event(GeneratorEventKind::UpdateFailed {
            sensor_id,
            error: error.clone(),
        });
        UpdateOutcome::Failed { error }
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// Bounded set of long-lived workers sharing one dispatch queue.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    size: usize,
    seed: u64,
}

impl WorkerPool {
    /// Creates a pool of `size` workers (at least one). Worker `i` draws
    /// randomness from `seed + i`.
    #[must_use]
    pub fn new(size: usize, seed: u64) -> Self {
        Self {
            size: size.max(1),
            seed,
        }
    }

    /// Number of workers.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Spawns the workers. They exit once `queue` is closed and drained.
    pub fn spawn(
        &self,
        queue: mpsc::Receiver<Dispatch>,
        context: WorkerContext,
    ) -> JoinSet<WorkerReport> {
        let queue = Arc::new(Mutex::new(queue));
        let mut workers = JoinSet::new();
        for worker in 0..self.size {
            let queue = Arc::clone(&queue);
            let context = context.clone();
            let rng = seeded_rng(self.seed.wrapping_add(worker as u64));
            workers.spawn(run_worker(worker, queue, context, rng));
        }
        workers
    }
}

async fn run_worker(
    worker: usize,
    queue: Arc<Mutex<mpsc::Receiver<Dispatch>>>,
    context: WorkerContext,
    mut rng: SmallRng,
) -> WorkerReport {
    let mut report = WorkerReport {
        worker,
        ..WorkerReport::default()
    };
    loop {
        let next = queue.lock().await.recv().await;
        let Some(dispatch) = next else { break };
        if context.process(&mut rng, dispatch).await {
            report.succeeded += 1;
        } else {
            report.failed += 1;
        }
    }
    context.telemetry.log(
        Level::DEBUG,
        "worker.exit",
        json!({ "worker": worker, "succeeded": report.succeeded, "failed": report.failed }),
    );
    report
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        model::{Coordinate, Group, Sensor},
        placement::arrange,
        rules::{RetryPolicy, RuleSet},
        scheduler::RegenerationScheduler,
        store::testing::InstrumentedStore,
    };

    fn sensors(group: &Group, count: u32, interval: Duration) -> Vec<Sensor> {
        (0..count)
            .map(|i| {
                Sensor::new(
                    group.id,
                    u64::from(i),
                    Coordinate::new(f64::from(i) * 10.0, 0.0, 100.0),
                    interval,
                )
            })
            .collect()
    }

    struct Harness {
        store: Arc<InstrumentedStore>,
        handle: SchedulerHandle,
        cancel: CancellationToken,
        scheduler: tokio::task::JoinHandle<crate::scheduler::SchedulerStats>,
        workers: JoinSet<WorkerReport>,
    }

    async fn launch(
        group: &Group,
        sensors: Vec<Sensor>,
        pool: usize,
        store: InstrumentedStore,
    ) -> Harness {
        launch_with(group, sensors, pool, store, RetryPolicy::default()).await
    }

    async fn launch_with(
        group: &Group,
        sensors: Vec<Sensor>,
        pool: usize,
        store: InstrumentedStore,
        retry: RetryPolicy,
    ) -> Harness {
        store
            .inner
            .create_group_with_sensors(group, &sensors)
            .await
            .unwrap();
        let store = Arc::new(store);
        let (tx, rx) = mpsc::channel(pool);
        let (scheduler, handle) = RegenerationScheduler::new(
            arrange(sensors),
            tx,
            retry,
            GeneratorTelemetry::default(),
        );
        let species: Vec<String> = ["Grouper", "Lionfish", "Sailfish"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        let context = WorkerContext::new(
            store.clone(),
            ReadingSynthesizer::new(Arc::new(RuleSet::default()), species.into()),
            handle.clone(),
            GeneratorTelemetry::default(),
        );
        let workers = WorkerPool::new(pool, 7).spawn(rx, context);
        let cancel = CancellationToken::new();
        let scheduler = tokio::spawn(scheduler.run(cancel.clone()));
        Harness {
            store,
            handle,
            cancel,
            scheduler,
            workers,
        }
    }

    async fn shutdown(mut harness: Harness) -> Vec<WorkerReport> {
        harness.cancel.cancel();
        harness.scheduler.await.unwrap();
        let mut reports = Vec::new();
        while let Some(report) = harness.workers.join_next().await {
            reports.push(report.unwrap());
        }
        reports
    }

    #[tokio::test(start_paused = true)]
    async fn sensors_update_once_per_interval() {
        let group = Group::new("Alpha");
        let population = sensors(&group, 2, Duration::from_secs(1));
        let ids: Vec<_> = population.iter().map(|s| s.id).collect();
        let harness = launch(&group, population, 4, InstrumentedStore::default()).await;

        tokio::time::sleep(Duration::from_millis(5500)).await;
        let store = harness.store.clone();
        let reports = shutdown(harness).await;

        for id in ids {
            let count = store.inner.update_count(id);
            assert!((4..=6).contains(&count), "sensor updated {count} times");
            let successes: Vec<_> = store
                .attempts_for(id)
                .into_iter()
                .filter(|(_, ok)| *ok)
                .map(|(at, _)| at)
                .collect();
            for pair in successes.windows(2) {
                assert!(pair[1] - pair[0] >= Duration::from_secs(1));
            }
        }
        assert_eq!(reports.len(), 4);
        assert!(store.max_executing.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_pool_size() {
        let group = Group::new("Beta");
        let population = sensors(&group, 12, Duration::from_millis(500));
        let store = InstrumentedStore::new(Duration::from_millis(400));
        let harness = launch(&group, population, 3, store).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        let store = harness.store.clone();
        assert!(harness.handle.stats().dispatched > 12);
        let reports = shutdown(harness).await;

        assert_eq!(store.max_executing.load(Ordering::SeqCst), 3);
        let total: u64 = reports.iter().map(|r| r.succeeded).sum();
        assert_eq!(total, store.inner.total_updates());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_update_is_retried_before_the_next_interval() {
        let group = Group::new("Gamma");
        let population = sensors(&group, 1, Duration::from_secs(2));
        let id = population[0].id;
        let store = InstrumentedStore::default();
        store.fail_next_updates(id, 1);
        let harness = launch(&group, population, 2, store).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let store = harness.store.clone();
        let stats = harness.handle.stats();
        shutdown(harness).await;

        let attempts = store.attempts_for(id);
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].1);
        assert!(attempts[1].1);
        assert!(attempts[1].0 - attempts[0].0 < Duration::from_secs(2));
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(store.inner.update_count(id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn next_interval_policy_waits_a_full_interval_after_failure() {
        let group = Group::new("Epsilon");
        let population = sensors(&group, 1, Duration::from_secs(2));
        let id = population[0].id;
        let store = InstrumentedStore::default();
        store.fail_next_updates(id, 1);
        let harness = launch_with(&group, population, 2, store, RetryPolicy::NextInterval).await;

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let store = harness.store.clone();
        shutdown(harness).await;

        let attempts = store.attempts_for(id);
        assert!(attempts.len() >= 2);
        assert!(!attempts[0].1);
        assert!(attempts[1].1);
        assert!(attempts[1].0 - attempts[0].0 >= Duration::from_secs(2));
        assert_eq!(store.inner.update_count(id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_update_is_reported_as_failure_and_retried() {
        let group = Group::new("Zeta");
        let population = sensors(&group, 1, Duration::from_secs(1));
        let id = population[0].id;
        let store = InstrumentedStore::default();
        store.panic_next_updates(id, 1);
        let harness = launch(&group, population, 1, store).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        let store = harness.store.clone();
        let stats = harness.handle.stats();
        let reports = shutdown(harness).await;

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(store.inner.update_count(id), 1);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].failed, 1);
        assert_eq!(reports[0].succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn workers_exit_when_queue_closes() {
        let group = Group::new("Delta");
        let harness = launch(&group, Vec::new(), 2, InstrumentedStore::default()).await;
        let reports = shutdown(harness).await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.succeeded == 0 && r.failed == 0));
    }
}
