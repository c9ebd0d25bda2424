//! Scenario schema for the visitor simulation harness.
//!
//! A scenario is a small, fully serializable description of one randomized
//! visit: the selection, the starting resolution, and the probability mix
//! the runner draws its per-step decisions from. Failing scenarios are
//! written out as JSON artifacts and replayed byte-for-byte from the seed.

use serde::{Deserialize, Serialize};

use crate::bucket::MAX_USED_BITS;

/// Schema version stamped on serialized scenarios.
pub const SCENARIO_SCHEMA_VERSION: u32 = 1;

/// Selection description, mirroring [`crate::visit::Selection`] with a
/// serde-friendly shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionSpec {
    FullRange,
    Explicit { ids: Vec<u64> },
}

/// One randomized visit: inputs plus the per-step probability mix.
///
/// All probabilities are expressed as `numerator / 100`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scenario {
    /// Schema version for forward-compatible artifact evolution.
    pub schema_version: u32,
    /// Seed for every random decision the runner makes.
    pub seed: u64,
    pub selection: SelectionSpec,
    /// Starting partition resolution.
    pub initial_bits: u32,
    /// Simulated concurrent workers.
    pub workers: u32,
    /// Upper bound on runner steps before the hang oracle fires.
    pub max_steps: u64,
    /// Chance per step that a worker reports partial progress instead of
    /// finishing its bucket.
    pub partial_report_pct: u32,
    /// Chance per step of requesting a resolution change.
    pub bit_change_pct: u32,
    /// Inclusive resolution range a change request picks from.
    pub bit_range: (u32, u32),
    /// Chance per step of checkpointing; half of those also simulate a
    /// crash and resume from the checkpoint.
    pub checkpoint_pct: u32,
    /// Chance per step of splitting or merging a pending bucket
    /// (full-range selections only).
    pub split_merge_pct: u32,
}

impl Scenario {
    /// Validates the scenario, returning a human-readable error.
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be > 0".to_string());
        }
        if self.max_steps == 0 {
            return Err("max_steps must be > 0".to_string());
        }
        let (lo, hi) = self.bit_range;
        if lo > hi {
            return Err("bit_range must be ordered".to_string());
        }
        if hi > MAX_USED_BITS as u32 || self.initial_bits > MAX_USED_BITS as u32 {
            return Err(format!("resolutions must be <= {MAX_USED_BITS}"));
        }
        if self.initial_bits > 16 || hi > 16 {
            // Keeps the runner's coverage oracle array-backed.
            return Err("simulated resolutions are capped at 16 bits".to_string());
        }
        for pct in [
            self.partial_report_pct,
            self.bit_change_pct,
            self.checkpoint_pct,
            self.split_merge_pct,
        ] {
            if pct > 100 {
                return Err("percentages must be <= 100".to_string());
            }
        }
        Ok(())
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            schema_version: SCENARIO_SCHEMA_VERSION,
            seed: 1,
            selection: SelectionSpec::FullRange,
            initial_bits: 4,
            workers: 4,
            max_steps: 100_000,
            partial_report_pct: 30,
            bit_change_pct: 5,
            bit_range: (2, 8),
            checkpoint_pct: 5,
            split_merge_pct: 10,
        }
    }
}
