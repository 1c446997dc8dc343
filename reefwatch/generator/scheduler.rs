//! Regeneration scheduler: decides when every tracked sensor is due and
//! hands due sensors to the worker queue.
//!
//! Entries live in a slab owned by the scheduler task. Idle entries sit in a
//! min-heap keyed by next-due instant; a dispatched entry is out of the heap
//! until its completion is applied, so one sensor never has two updates in
//! flight. Workers report back through [`SchedulerHandle::complete`], which is
//! the only way scheduling state changes from outside the loop.

use std::{cmp::Ordering, collections::BinaryHeap, sync::Arc, time::Duration};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::{
    sync::mpsc,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    events::GeneratorEventKind,
    model::{Sensor, SensorId},
    placement::PlacedSensor,
    rules::RetryPolicy,
    telemetry::{GeneratorTelemetry, Level},
};

/// Position of an entry in the scheduler's slab.
pub type EntrySlot = usize;

/// Where an entry is in its `Idle → Due → Dispatched → Idle` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPhase {
    /// Waiting in the due-ordering.
    Idle {
        /// When the entry becomes due.
        next_due: Instant,
    },
    /// Handed to the worker queue, not yet completed.
    Dispatched {
        /// When it was handed over.
        at: Instant,
        /// The due time it had before dispatch.
        due_before: Instant,
    },
}

/// Scheduler-owned tracking state for one sensor.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    /// Tracked sensor.
    pub sensor: Sensor,
    /// Completion time of the last successful update.
    pub last_success: Option<Instant>,
    /// Transparency this sensor last wrote.
    pub transparency: Option<u8>,
    /// Reference transparency inherited from the designated neighbour.
    pub inherited: u8,
    /// Designated neighbour.
    pub neighbour: Option<EntrySlot>,
    /// Lifecycle phase.
    pub phase: EntryPhase,
}

/// Work item handed to the worker pool.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// Entry the work belongs to.
    pub slot: EntrySlot,
    /// Sensor to regenerate.
    pub sensor: Sensor,
    /// Correlation reference for the transparency walk.
    pub reference: u8,
    /// Dispatch instant.
    pub dispatched_at: Instant,
}

/// Result of one dispatched update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The bundle was persisted.
    Succeeded {
        /// When persistence finished.
        at: Instant,
        /// Transparency that was written.
        transparency: u8,
    },
    /// Persistence failed; nothing was written.
    Failed {
        /// Failure description.
        error: String,
    },
}

/// Worker report for a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Entry the report is for.
    pub slot: EntrySlot,
    /// What happened.
    pub outcome: UpdateOutcome,
}

/// Counters readable while the scheduler runs.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tracked sensors.
    pub tracked: usize,
    /// Entries waiting for their due time.
    pub idle: usize,
    /// Dispatches awaiting completion.
    pub in_flight: usize,
    /// Total dispatches.
    pub dispatched: u64,
    /// Total successful updates.
    pub succeeded: u64,
    /// Total failed updates.
    pub failed: u64,
}

#[derive(Debug)]
enum Control {
    Track(Sensor),
    Complete(Completion),
}

/// Cloneable handle to a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    control: mpsc::UnboundedSender<Control>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Starts tracking another sensor. Returns false once the scheduler stopped.
    pub fn track(&self, sensor: Sensor) -> bool {
        self.control.send(Control::Track(sensor)).is_ok()
    }

    /// Reports a finished dispatch. Returns false once the scheduler stopped.
    pub fn complete(&self, completion: Completion) -> bool {
        self.control.send(Control::Complete(completion)).is_ok()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().clone()
    }

    /// True once the scheduler loop has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DueItem {
    due: Instant,
    seq: u64,
    slot: EntrySlot,
}

impl PartialOrd for DueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, earliest due must pop first
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum Wake {
    Cancelled,
    Control(Control),
    Due,
}

/// Priority-driven scheduler. Owns every [`ScheduleEntry`].
#[derive(Debug)]
pub struct RegenerationScheduler {
    entries: Vec<ScheduleEntry>,
    followers: Vec<Vec<EntrySlot>>,
    index: IndexMap<SensorId, EntrySlot>,
    due: BinaryHeap<DueItem>,
    seq: u64,
    retry: RetryPolicy,
    dispatch_tx: mpsc::Sender<Dispatch>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    stats: Arc<Mutex<SchedulerStats>>,
    telemetry: GeneratorTelemetry,
}

impl RegenerationScheduler {
    /// Creates a scheduler tracking `placed` in the given order, all due now.
    #[must_use]
    pub fn new(
        placed: Vec<PlacedSensor>,
        dispatch_tx: mpsc::Sender<Dispatch>,
        retry: RetryPolicy,
        telemetry: GeneratorTelemetry,
    ) -> (Self, SchedulerHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let mut scheduler = Self {
            entries: Vec::with_capacity(placed.len()),
            followers: Vec::with_capacity(placed.len()),
            index: IndexMap::with_capacity(placed.len()),
            due: BinaryHeap::with_capacity(placed.len()),
            seq: 0,
            retry,
            dispatch_tx,
            control_rx,
            stats: Arc::clone(&stats),
            telemetry,
        };
        let now = Instant::now();
        let count = placed.len();
        for item in placed {
            let neighbour = item.neighbour.filter(|&slot| slot < count);
            scheduler.insert(item.sensor, neighbour, now);
        }
        for slot in 0..scheduler.entries.len() {
            if let Some(neighbour) = scheduler.entries[slot].neighbour {
                scheduler.followers[neighbour].push(slot);
            }
        }
        let handle = SchedulerHandle {
            control: control_tx,
            stats,
        };
        (scheduler, handle)
    }

    /// Read-only view of an entry.
    #[must_use]
    pub fn entry(&self, slot: EntrySlot) -> Option<&ScheduleEntry> {
        self.entries.get(slot)
    }

    /// Number of tracked sensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs until `cancel` fires or the worker queue closes.
    ///
    /// Dropping the scheduler on return closes the dispatch queue, which lets
    /// workers drain and exit.
    #[instrument(skip_all, name = "scheduler", fields(tracked = self.entries.len()))]
    pub async fn run(mut self, cancel: CancellationToken) -> SchedulerStats {
        self.log(
            Level::INFO,
            "scheduler.start",
            json!({ "tracked": self.entries.len(), "retry": format!("{:?}", self.retry) }),
        );
        loop {
            let next_due = self.due.peek().map(|item| item.due);
            let wake = tokio::select! {
                biased;
                () = cancel.cancelled() => Wake::Cancelled,
                Some(control) = self.control_rx.recv() => Wake::Control(control),
                () = wait_until(next_due) => Wake::Due,
            };
            match wake {
                Wake::Cancelled => break,
                Wake::Control(control) => self.apply(control),
                Wake::Due => {}
            }
            while let Ok(control) = self.control_rx.try_recv() {
                self.apply(control);
            }
            if !self.dispatch_due(&cancel).await {
                break;
            }
        }
        let stats = self.stats.lock().clone();
        self.log(Level::INFO, "scheduler.stopped", json!(stats));
        self.telemetry.event(GeneratorEventKind::SchedulerStopped {
            dispatched: stats.dispatched,
            succeeded: stats.succeeded,
            failed: stats.failed,
        });
        stats
    }

    /// Dispatches every entry due at the current instant. Returns false when
    /// the loop must stop.
    async fn dispatch_due(&mut self, cancel: &CancellationToken) -> bool {
        let now = Instant::now();
        while let Some(item) = self.pop_due(now) {
            // blocks while workers are saturated
            let sender = self.dispatch_tx.clone();
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = sender.reserve_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                self.due.push(item);
                self.stats.lock().idle = self.due.len();
                return false;
            };
            let dispatch = self.mark_dispatched(item.slot, Instant::now());
            let sensor_id = dispatch.sensor.id;
            permit.send(dispatch);
            let in_flight = self.stats.lock().in_flight;
            self.log(
                Level::DEBUG,
                "scheduler.dispatch",
                json!({ "sensor_id": sensor_id, "in_flight": in_flight }),
            );
            self.telemetry.event(GeneratorEventKind::Dispatched {
                sensor_id,
                in_flight,
            });
        }
        true
    }

    fn pop_due(&mut self, now: Instant) -> Option<DueItem> {
        let item = match self.due.peek() {
            Some(item) if item.due <= now => self.due.pop(),
            _ => None,
        };
        self.stats.lock().idle = self.due.len();
        item
    }

    fn mark_dispatched(&mut self, slot: EntrySlot, at: Instant) -> Dispatch {
        let entry = &mut self.entries[slot];
        let due_before = match entry.phase {
            EntryPhase::Idle { next_due } => next_due,
            EntryPhase::Dispatched { due_before, .. } => due_before,
        };
        entry.phase = EntryPhase::Dispatched { at, due_before };
        let dispatch = Dispatch {
            slot,
            sensor: entry.sensor.clone(),
            reference: entry.inherited,
            dispatched_at: at,
        };
        let mut stats = self.stats.lock();
        stats.in_flight += 1;
        stats.dispatched += 1;
        dispatch
    }

    fn apply(&mut self, control: Control) {
        match control {
            Control::Track(sensor) => self.track(sensor),
            Control::Complete(completion) => self.complete(completion),
        }
    }

    fn track(&mut self, sensor: Sensor) {
        if self.index.contains_key(&sensor.id) {
            self.log(
                Level::WARN,
                "scheduler.track.duplicate",
                json!({ "sensor_id": sensor.id }),
            );
            return;
        }
        let sensor_id = sensor.id;
        self.insert(sensor, None, Instant::now());
        self.telemetry
            .event(GeneratorEventKind::SensorTracked { sensor_id });
    }

    fn insert(&mut self, sensor: Sensor, neighbour: Option<EntrySlot>, due: Instant) {
        let slot = self.entries.len();
        self.index.insert(sensor.id, slot);
        self.entries.push(ScheduleEntry {
            sensor,
            last_success: None,
            transparency: None,
            inherited: 0,
            neighbour,
            phase: EntryPhase::Idle { next_due: due },
        });
        self.followers.push(Vec::new());
        self.push(slot, due);
        self.stats.lock().tracked = self.entries.len();
    }

    fn push(&mut self, slot: EntrySlot, due: Instant) {
        self.seq += 1;
        self.due.push(DueItem {
            due,
            seq: self.seq,
            slot,
        });
        self.stats.lock().idle = self.due.len();
    }

    /// Applies a worker report: the `Dispatched → Idle` transition.
    fn complete(&mut self, completion: Completion) {
        let Some(entry) = self.entries.get_mut(completion.slot) else {
            self.log(
                Level::WARN,
                "scheduler.complete.unknown_slot",
                json!({ "slot": completion.slot }),
            );
            return;
        };
        let EntryPhase::Dispatched { at, due_before } = entry.phase else {
            let sensor_id = entry.sensor.id;
            self.log(
                Level::WARN,
                "scheduler.complete.not_in_flight",
                json!({ "sensor_id": sensor_id }),
            );
            return;
        };
        let interval = entry.sensor.interval;
        let next_due = match completion.outcome {
            UpdateOutcome::Succeeded {
                at: finished,
                transparency,
            } => {
                entry.last_success = Some(finished);
                entry.transparency = Some(transparency);
                for &follower in &self.followers[completion.slot] {
                    self.entries[follower].inherited = transparency;
                }
                self.stats.lock().succeeded += 1;
                due_after(finished, interval)
            }
            UpdateOutcome::Failed { .. } => {
                self.stats.lock().failed += 1;
                match self.retry {
                    RetryPolicy::NextInterval => due_after(at, interval),
                    RetryPolicy::Immediate => due_before,
                }
            }
        };
        self.entries[completion.slot].phase = EntryPhase::Idle { next_due };
        self.push(completion.slot, next_due);
        let mut stats = self.stats.lock();
        stats.in_flight = stats.in_flight.saturating_sub(1);
    }

    fn log(&self, level: Level, message: &str, metadata: serde_json::Value) {
        self.telemetry.log(level, message, metadata);
    }
}

/// Upper bound on how far ahead an entry can be scheduled.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `base + interval`, falling back to [`FAR_FUTURE`] past `base` when the
/// sum does not fit the clock.
fn due_after(base: Instant, interval: Duration) -> Instant {
    base.checked_add(interval)
        .or_else(|| base.checked_add(FAR_FUTURE))
        .unwrap_or(base)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
