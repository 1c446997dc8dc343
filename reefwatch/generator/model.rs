use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier assigned to every sensor group.
pub type GroupId = Uuid;

/// Identifier assigned to every sensor.
pub type SensorId = Uuid;

/// Named cluster of sensors created once at bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group id.
    pub id: GroupId,
    /// Display name (unique within one bootstrap run).
    pub name: String,
}

impl Group {
    /// Creates a group with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

/// Point inside the monitored water volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Coordinate {
    /// Easting.
    pub x: f64,
    /// Northing.
    pub y: f64,
    /// Depth.
    pub z: f64,
}

impl Coordinate {
    /// Creates a coordinate.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(&self, other: &Self) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        let dz = other.z - self.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Simulated sensor. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    /// Sensor id.
    pub id: SensorId,
    /// Owning group.
    pub group_id: GroupId,
    /// Position inside the owning group.
    pub index_in_group: u64,
    /// Placement.
    pub position: Coordinate,
    /// Regeneration interval, fixed for the sensor's lifetime.
    pub interval: Duration,
}

impl Sensor {
    /// Creates a sensor with a fresh id.
    #[must_use]
    pub fn new(
        group_id: GroupId,
        index_in_group: u64,
        position: Coordinate,
        interval: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
            index_in_group,
            position,
            interval,
        }
    }

    /// Human readable name, e.g. `Gamma 3`.
    #[must_use]
    pub fn codename(&self, group: &Group) -> String {
        format!("{} {}", group.name, self.index_in_group)
    }
}

/// Water temperature sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    /// Reporting sensor.
    pub sensor_id: SensorId,
    /// Degrees Celsius.
    pub value: f64,
    /// Synthesis timestamp.
    pub recorded_at: DateTime<Utc>,
}

/// Water transparency sample, percent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transparency {
    /// Reporting sensor.
    pub sensor_id: SensorId,
    /// Value in `0..=100`.
    pub value: u8,
    /// Synthesis timestamp.
    pub recorded_at: DateTime<Utc>,
}

/// Count of one species seen by a sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FishObservation {
    /// Reporting sensor.
    pub sensor_id: SensorId,
    /// Species name.
    pub name: String,
    /// Number of individuals observed.
    pub count: u64,
    /// Synthesis timestamp.
    pub recorded_at: DateTime<Utc>,
}

/// Everything one regeneration produces for a sensor; persisted as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingBundle {
    /// Temperature sample.
    pub temperature: Temperature,
    /// Transparency sample.
    pub transparency: Transparency,
    /// Distinct species observations.
    pub fish: Vec<FishObservation>,
}

impl ReadingBundle {
    /// Sensor the bundle belongs to.
    #[must_use]
    pub fn sensor_id(&self) -> SensorId {
        self.temperature.sensor_id
    }

    /// Shared synthesis timestamp.
    #[must_use]
    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.temperature.recorded_at
    }
}
