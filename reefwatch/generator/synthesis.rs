use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::{rngs::SmallRng, seq::index, Rng, SeedableRng};

use crate::{
    model::{FishObservation, ReadingBundle, Sensor, Temperature, Transparency},
    rules::RuleSet,
};

/// Upper bound of the transparency scale.
pub const MAX_TRANSPARENCY: u8 = 100;

/// Computes synthetic reading bundles from the rule set and species pool.
#[derive(Debug, Clone)]
pub struct ReadingSynthesizer {
    rules: Arc<RuleSet>,
    species: Arc<[String]>,
}

impl ReadingSynthesizer {
    /// Creates a synthesizer.
    #[must_use]
    pub fn new(rules: Arc<RuleSet>, species: Arc<[String]>) -> Self {
        Self { rules, species }
    }

    /// Species names available for observations.
    #[must_use]
    pub fn species(&self) -> &[String] {
        &self.species
    }

    /// Depth-derived temperature baseline: warmest at the top of the region.
    #[must_use]
    pub fn baseline(&self, z: f64) -> f64 {
        let band = self.rules.temperature;
        let depth = self.rules.region.z;
        if depth.span() <= 0.0 {
            return band.max;
        }
        band.max - (z - depth.min) / depth.span() * band.span()
    }

    /// Samples a temperature uniformly within the jitter band around the baseline.
    pub fn temperature<R: Rng + ?Sized>(&self, rng: &mut R, z: f64) -> f64 {
        let baseline = self.baseline(z);
        let jitter = self.rules.temperature_jitter;
        rng.gen_range((baseline - jitter)..=(baseline + jitter))
    }

    /// One bounded random-walk step from `reference`, clamped to `0..=100`.
    pub fn transparency<R: Rng + ?Sized>(&self, rng: &mut R, reference: u8) -> u8 {
        let reference = reference.min(MAX_TRANSPARENCY);
        let step = self.rules.transparency_infelicity;
        let low = reference.saturating_sub(step);
        let high = reference.saturating_add(step).min(MAX_TRANSPARENCY);
        rng.gen_range(low..=high)
    }

    /// Distinct species with positive counts. Never longer than the pool.
    pub fn fish<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<(String, u64)> {
        let amount = self.rules.fish_list_length.min(self.species.len());
        let max_count = self.rules.max_fish_count.max(1);
        index::sample(rng, self.species.len(), amount)
            .into_iter()
            .map(|idx| (self.species[idx].clone(), rng.gen_range(1..=max_count)))
            .collect()
    }

    /// Builds a full bundle sharing one timestamp.
    pub fn synthesize<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        sensor: &Sensor,
        reference: u8,
        recorded_at: DateTime<Utc>,
    ) -> ReadingBundle {
        let sensor_id = sensor.id;
        ReadingBundle {
            temperature: Temperature {
                sensor_id,
                value: self.temperature(rng, sensor.position.z),
                recorded_at,
            },
            transparency: Transparency {
                sensor_id,
                value: self.transparency(rng, reference),
                recorded_at,
            },
            fish: self
                .fish(rng)
                .into_iter()
                .map(|(name, count)| FishObservation {
                    sensor_id,
                    name,
                    count,
                    recorded_at,
                })
                .collect(),
        }
    }
}

/// Draws a fresh seed from the thread RNG.
#[must_use]
pub fn random_seed() -> u64 {
    rand::thread_rng().gen()
}

/// Deterministic RNG for `seed`.
#[must_use]
pub fn seeded_rng(seed: u64) -> SmallRng {
    SmallRng::seed_from_u64(seed)
}
