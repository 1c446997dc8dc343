#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Reef generator – synthesises an underwater sensor population and keeps
//! every sensor's readings fresh at its own rate.

/// Domain records.
#[path = "../model.rs"]
pub mod model;

/// Generation rules and configuration.
#[path = "../rules.rs"]
pub mod rules;

/// Lifecycle events and publishers.
#[path = "../events.rs"]
pub mod events;

/// Structured logging and seeded randomness.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Species name providers.
#[path = "../names.rs"]
pub mod names;

/// Persistence gateway and in-memory store.
#[path = "../store.rs"]
pub mod store;

/// Loneliness ordering and neighbour designation.
#[path = "../placement.rs"]
pub mod placement;

/// Reading synthesis.
#[path = "../synthesis.rs"]
pub mod synthesis;

/// Bootstrap of groups and sensors.
#[path = "../topology.rs"]
pub mod topology;

/// Due-time scheduling.
#[path = "../scheduler.rs"]
pub mod scheduler;

/// Worker pool.
#[path = "../worker.rs"]
pub mod worker;

/// Runtime entry: start, stop, wait.
#[path = "../main.rs"]
pub mod runtime;

pub use events::{
    EventPublisher, FileEventPublisher, GeneratorEvent, GeneratorEventKind, MemoryEventBus,
};
pub use names::{FileNames, HttpNames, NameProvider, NameSourceError, StaticNames};
pub use rules::{ReefConfig, RetryPolicy, RuleSet, RuntimeSettings};
pub use runtime::{Generator, GeneratorBuilder, GeneratorError, RunSummary, StartReport};
pub use store::{MemoryStore, SensorStore, StoreError};
pub use telemetry::{GeneratorTelemetry, GeneratorTelemetryBuilder};
