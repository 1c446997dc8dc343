use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Pool of group display names. Group count can never exceed its length.
pub const GROUP_NAMES: [&str; 24] = [
    "Alpha", "Beta", "Gamma", "Delta", "Epsilon", "Zeta", "Eta", "Theta", "Iota", "Kappa",
    "Lambda", "Mu", "Nu", "Xi", "Omicron", "Pi", "Rho", "Sigma", "Tau", "Upsilon", "Phi", "Chi",
    "Psi", "Omega",
];

/// Longest regeneration interval accepted, in seconds.
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Inclusive `[min, max]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds<T> {
    /// Lower bound (inclusive).
    pub min: T,
    /// Upper bound (inclusive).
    pub max: T,
}

impl<T: PartialOrd + Copy> Bounds<T> {
    /// Creates bounds as given, without normalising.
    #[must_use]
    pub const fn new(min: T, max: T) -> Self {
        Self { min, max }
    }

    /// Swaps inverted bounds instead of rejecting them.
    #[must_use]
    pub fn normalized(self) -> Self {
        if self.min > self.max {
            Self {
                min: self.max,
                max: self.min,
            }
        } else {
            self
        }
    }

    /// Returns true when `value` lies inside the bounds.
    #[must_use]
    pub fn contains(&self, value: T) -> bool {
        self.min <= value && value <= self.max
    }
}

impl Bounds<f64> {
    /// Distance between the bounds.
    #[must_use]
    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Keeps the bounds only if both ends and their span are finite.
    #[must_use]
    pub fn finite_or(self, fallback: Self) -> Self {
        if self.min.is_finite() && self.max.is_finite() && self.span().is_finite() {
            self
        } else {
            fallback
        }
    }
}

/// Cuboid sensors are placed in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionBounds {
    /// Easting range.
    #[serde(default = "default_axis")]
    pub x: Bounds<f64>,
    /// Northing range.
    #[serde(default = "default_axis")]
    pub y: Bounds<f64>,
    /// Depth range. Temperature falls linearly from `z.min` to `z.max`.
    #[serde(default = "default_axis")]
    pub z: Bounds<f64>,
}

impl Default for RegionBounds {
    fn default() -> Self {
        Self {
            x: default_axis(),
            y: default_axis(),
            z: default_axis(),
        }
    }
}

impl RegionBounds {
    /// Normalises every axis. Non-finite axes reset to the default.
    #[must_use]
    pub fn normalized(self) -> Self {
        let axis = |bounds: Bounds<f64>| bounds.finite_or(default_axis()).normalized();
        Self {
            x: axis(self.x),
            y: axis(self.y),
            z: axis(self.z),
        }
    }
}

/// Static generation rules. Pure data, no behavior beyond normalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    /// Maximum step of the transparency random walk.
    #[serde(default = "default_transparency_infelicity")]
    pub transparency_infelicity: u8,
    /// Number of groups created at bootstrap.
    #[serde(default = "default_groups_count")]
    pub groups_count: u16,
    /// Sensors per group.
    #[serde(default = "default_sensors_per_group")]
    pub sensors_per_group: Bounds<u16>,
    /// Regeneration interval range in whole seconds.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: Bounds<u64>,
    /// Distinct species reported per reading.
    #[serde(default = "default_fish_list_length")]
    pub fish_list_length: usize,
    /// Upper bound for a single species count.
    #[serde(default = "default_max_fish_count")]
    pub max_fish_count: u64,
    /// Temperature at the deepest (`min`) and shallowest (`max`) point.
    #[serde(default = "default_temperature")]
    pub temperature: Bounds<f64>,
    /// Allowed deviation from the depth baseline.
    #[serde(default = "default_temperature_jitter")]
    pub temperature_jitter: f64,
    /// Placement cuboid.
    #[serde(default)]
    pub region: RegionBounds,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            transparency_infelicity: default_transparency_infelicity(),
            groups_count: default_groups_count(),
            sensors_per_group: default_sensors_per_group(),
            interval_secs: default_interval_secs(),
            fish_list_length: default_fish_list_length(),
            max_fish_count: default_max_fish_count(),
            temperature: default_temperature(),
            temperature_jitter: default_temperature_jitter(),
            region: RegionBounds::default(),
        }
    }
}

impl RuleSet {
    /// Returns a copy with inverted bounds swapped, counts and intervals
    /// clamped, and non-finite floats replaced by their defaults.
    #[must_use]
    pub fn normalized(self) -> Self {
        let pool = u16::try_from(GROUP_NAMES.len()).unwrap_or(u16::MAX);
        let intervals = self.interval_secs.normalized();
        let jitter = if self.temperature_jitter.is_finite() {
            self.temperature_jitter.abs()
        } else {
            default_temperature_jitter()
        };
        Self {
            groups_count: self.groups_count.min(pool),
            sensors_per_group: self.sensors_per_group.normalized(),
            interval_secs: Bounds::new(
                intervals.min.min(MAX_INTERVAL_SECS),
                intervals.max.min(MAX_INTERVAL_SECS),
            ),
            max_fish_count: self.max_fish_count.max(1),
            temperature: self
                .temperature
                .finite_or(default_temperature())
                .normalized(),
            temperature_jitter: jitter,
            region: self.region.normalized(),
            ..self
        }
    }

    /// Interval range as durations.
    #[must_use]
    pub fn interval_range(&self) -> Bounds<Duration> {
        Bounds::new(
            Duration::from_secs(self.interval_secs.min),
            Duration::from_secs(self.interval_secs.max),
        )
    }
}

/// What the scheduler does with a sensor whose update failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Re-admit with the unchanged pre-dispatch due time, so the sensor is
    /// eligible again right away.
    #[default]
    Immediate,
    /// Wait one interval from the failed dispatch before retrying.
    NextInterval,
}

/// Process-level knobs for the scheduler and worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RuntimeSettings {
    /// Concurrent workers; defaults to half the available parallelism.
    #[serde(default)]
    pub pool_size: Option<usize>,
    /// Dispatch queue capacity; defaults to the pool size.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// Seed for every random generator; random when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Failure handling.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// JSON-lines log destination.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl RuntimeSettings {
    /// Effective worker count, never zero.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size.unwrap_or_else(default_pool_size).max(1)
    }

    /// Effective dispatch queue capacity, never zero.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or_else(|| self.pool_size()).max(1)
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReefConfig {
    /// Generation rules.
    #[serde(default)]
    pub rules: RuleSet,
    /// Runtime settings.
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

impl ReefConfig {
    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading generator config {}", path.display()))?;
        let mut config =
            Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        if let Some(log_path) = config.runtime.log_path.as_mut() {
            if log_path.is_relative() {
                if let Some(parent) = path.parent() {
                    *log_path = parent.join(&*log_path);
                }
            }
        }
        Ok(config)
    }

    /// Parses a TOML document and normalises the rules.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.rules = config.rules.normalized();
        Ok(config)
    }
}

/// Half of the available parallelism, at least one.
#[must_use]
pub fn default_pool_size() -> usize {
    let threads = thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    (threads / 2).max(1)
}

const fn default_axis() -> Bounds<f64> {
    Bounds::new(0.0, 1000.0)
}

const fn default_transparency_infelicity() -> u8 {
    10
}

#[allow(clippy::cast_possible_truncation)]
const fn default_groups_count() -> u16 {
    GROUP_NAMES.len() as u16
}

const fn default_sensors_per_group() -> Bounds<u16> {
    Bounds::new(2, 10)
}

const fn default_interval_secs() -> Bounds<u64> {
    Bounds::new(10, 20)
}

const fn default_fish_list_length() -> usize {
    10
}

const fn default_max_fish_count() -> u64 {
    10
}

const fn default_temperature() -> Bounds<f64> {
    Bounds::new(-273.17, 56.7)
}

const fn default_temperature_jitter() -> f64 {
    3.0
}
