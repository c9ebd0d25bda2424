//! Deterministic simulation harness for randomized visitor runs.
//!
//! Purpose:
//! - Drive the visitor through long randomized op sequences (hand-outs,
//!   partial reports, resolution changes, splits, checkpoint crashes) from
//!   a single seed.
//! - Check the coverage, yield-exclusion, and checkpoint-fidelity oracles
//!   after every run.
//!
//! Failing runs reduce to a small JSON [`Scenario`] that reproduces the
//! failure byte-for-byte.
//!
//! This module is only available under `cfg(test)` or with the
//! `sim-harness` feature.

pub mod rng;
pub mod runner;
pub mod scenario;

pub use rng::SimRng;
pub use runner::{FailureKind, FailureReport, RunOutcome, VisitorSimRunner};
pub use scenario::{Scenario, SelectionSpec, SCENARIO_SCHEMA_VERSION};
