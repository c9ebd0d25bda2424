//! Deterministic visitor simulation runner.
//!
//! Drives a [`VisitorIterator`] with simulated workers whose every decision
//! comes from a seeded RNG, then checks the invariants the real system
//! depends on:
//!
//! - Termination: the visit reaches `is_done` within a step budget.
//! - Coverage: every superbucket of the universe is visited; exactly once
//!   unless a resolution decrease legitimately re-queued collapsed work.
//! - Yield exclusion: no bucket is handed out while a deferred resolution
//!   change is draining the active set.
//! - Checkpoint fidelity: text and binary round-trips reproduce the token,
//!   and a visit resumed from a checkpoint still covers the universe.
//!
//! Worker crashes are modeled by resuming from a checkpoint and dropping
//! all in-flight workers; their unreported progress is expected to be
//! redone.

use std::panic::{catch_unwind, AssertUnwindSafe};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::bucket::BucketId;
use crate::progress::{BucketProgress, ProgressToken};
use crate::sim::rng::SimRng;
use crate::sim::scenario::{Scenario, SelectionSpec};
use crate::stdx::mix64;
use crate::visit::{Selection, VisitorIterator, VisitorWorkItem, EXPLICIT_BUCKET_BITS};

/// Depth of the coverage oracle's slot array. Splits are capped here so a
/// finished bucket always maps to whole slots.
const FINE_BITS: u8 = 18;

/// Result of a simulation run.
#[derive(Clone, Debug)]
pub enum RunOutcome {
    Ok { finished_buckets: u64 },
    Failed(FailureReport),
}

/// Structured failure report captured in artifacts.
///
/// `step` is the simulation step index where the failure was detected.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub message: String,
    pub step: u64,
}

/// Failure classification for deterministic triage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FailureKind {
    /// A panic escaped from visitor or harness logic.
    Panic,
    /// The visit failed to finish within the step budget.
    Hang,
    /// Coverage, ordering, or yield-exclusion was violated.
    InvariantViolation,
    /// A checkpoint round-trip or resume diverged from the live state.
    CheckpointMismatch,
}

/// Deterministic visitor simulation runner.
pub struct VisitorSimRunner {
    scenario: Scenario,
}

struct Worker {
    item: VisitorWorkItem,
}

/// Tracks how often each part of the universe finished.
enum Coverage {
    /// Full-range universe, one slot per depth-`FINE_BITS` bucket.
    Range(Vec<u32>),
    /// Explicit universe, one count per expected superbucket.
    Explicit(AHashMap<BucketId, u32>),
}

impl Coverage {
    fn record(&mut self, bucket: BucketId) -> Result<(), String> {
        match self {
            Coverage::Range(slots) => {
                let depth = bucket.used_bits();
                if depth > FINE_BITS {
                    return Err(format!(
                        "finished bucket deeper than coverage resolution: {bucket}"
                    ));
                }
                let stride = 1u64 << depth;
                let mut raw = bucket.raw();
                while raw < (1u64 << FINE_BITS) {
                    slots[raw as usize] += 1;
                    raw += stride;
                }
                Ok(())
            }
            Coverage::Explicit(counts) => {
                *counts.entry(bucket).or_insert(0) += 1;
                Ok(())
            }
        }
    }
}

impl VisitorSimRunner {
    pub fn new(scenario: Scenario) -> Result<Self, String> {
        scenario.validate()?;
        Ok(Self { scenario })
    }

    /// Executes the scenario, converting escaped panics into failures.
    pub fn run(&self) -> RunOutcome {
        match catch_unwind(AssertUnwindSafe(|| self.run_inner())) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                RunOutcome::Failed(FailureReport {
                    kind: FailureKind::Panic,
                    message,
                    step: 0,
                })
            }
        }
    }

    fn run_inner(&self) -> RunOutcome {
        let sc = &self.scenario;
        let mut rng = SimRng::new(sc.seed);

        let selection = match &sc.selection {
            SelectionSpec::FullRange => Selection::FullRange,
            SelectionSpec::Explicit { ids } => Selection::Explicit(ids.clone()),
        };
        let mut coverage = match &sc.selection {
            SelectionSpec::FullRange => Coverage::Range(vec![0; 1 << FINE_BITS]),
            SelectionSpec::Explicit { .. } => Coverage::Explicit(AHashMap::new()),
        };

        let mut iter = match VisitorIterator::new(&selection, sc.initial_bits, None) {
            Ok(iter) => iter,
            Err(err) => {
                return RunOutcome::Failed(FailureReport {
                    kind: FailureKind::InvariantViolation,
                    message: format!("fresh iterator rejected: {err}"),
                    step: 0,
                })
            }
        };
        let mut workers: Vec<Option<Worker>> = (0..sc.workers).map(|_| None).collect();
        let mut requeue_seen = false;
        let mut finished = 0u64;

        let fail = |kind: FailureKind, message: String, step: u64| {
            RunOutcome::Failed(FailureReport {
                kind,
                message,
                step,
            })
        };

        let mut step = 0u64;
        loop {
            if step >= sc.max_steps {
                return fail(
                    FailureKind::Hang,
                    format!("not done after {} steps", sc.max_steps),
                    step,
                );
            }
            step += 1;

            if rng.chance(sc.bit_change_pct, 100) {
                let (lo, hi) = sc.bit_range;
                let target = lo + rng.below((hi - lo + 1) as u64) as u32;
                // A decrease re-queues collapsed groups; an increase with a
                // pending bucket already split finer than the target
                // restarts the covering bucket. Both repeat finished work.
                let deep_pending = iter
                    .pending_snapshot()
                    .iter()
                    .any(|(b, _)| (b.used_bits() as u32) > target);
                if target < iter.distribution_bit_count() || deep_pending {
                    requeue_seen = true;
                }
                iter.set_distribution_bit_count(target);
            }

            if iter.should_yield() && iter.get_next().is_some() {
                return fail(
                    FailureKind::InvariantViolation,
                    "bucket handed out while yielding for a resolution change".to_string(),
                    step,
                );
            }

            if matches!(selection, Selection::FullRange) && rng.chance(sc.split_merge_pct, 100) {
                if let Some(depth) = self.split_or_merge(&iter, &mut rng) {
                    // A split made while a change is parked can land below
                    // the parked target and be restarted at apply time.
                    if iter.should_yield() && (depth as u32) > iter.distribution_bit_count() {
                        requeue_seen = true;
                    }
                }
            }

            if rng.chance(sc.checkpoint_pct, 100) {
                let token = iter.checkpoint();
                if let Some(report) = check_round_trips(&token, step) {
                    return RunOutcome::Failed(report);
                }
                if rng.chance(50, 100) {
                    // Simulated crash: resume from the checkpoint, losing
                    // every worker's unreported progress.
                    iter = match VisitorIterator::new(
                        &selection,
                        token.distribution_bit_count(),
                        Some(token),
                    ) {
                        Ok(iter) => iter,
                        Err(err) => {
                            return fail(
                                FailureKind::CheckpointMismatch,
                                format!("own checkpoint rejected on resume: {err}"),
                                step,
                            )
                        }
                    };
                    for slot in &mut workers {
                        *slot = None;
                    }
                }
            }

            let slot = rng.below(workers.len() as u64) as usize;
            match workers[slot].take() {
                None => {
                    if let Some(item) = iter.get_next() {
                        workers[slot] = Some(Worker { item });
                    }
                }
                Some(worker) => {
                    let superbucket = worker.item.superbucket;
                    if sc.partial_report_pct > 0 && rng.chance(sc.partial_report_pct, 100) {
                        let mark = random_mark(superbucket, &mut rng);
                        iter.update(superbucket, BucketProgress::At(mark));
                    } else {
                        iter.update(superbucket, BucketProgress::Finished);
                        finished += 1;
                        if let Err(message) = coverage.record(superbucket) {
                            return fail(FailureKind::InvariantViolation, message, step);
                        }
                    }
                }
            }

            let percent = iter.percent_finished();
            if !(0.0..=100.0).contains(&percent) {
                return fail(
                    FailureKind::InvariantViolation,
                    format!("percent out of range: {percent}"),
                    step,
                );
            }

            if iter.is_done() && workers.iter().all(Option::is_none) {
                break;
            }
        }

        if iter.has_next() || iter.get_next().is_some() {
            return fail(
                FailureKind::InvariantViolation,
                "iterator still offers buckets after is_done".to_string(),
                step,
            );
        }
        if iter.percent_finished() != 100.0 {
            return fail(
                FailureKind::InvariantViolation,
                format!("done at {}%", iter.percent_finished()),
                step,
            );
        }
        if let Some(report) = self.check_coverage(&coverage, requeue_seen, step) {
            return RunOutcome::Failed(report);
        }
        RunOutcome::Ok {
            finished_buckets: finished,
        }
    }

    /// Picks a random pending bucket and splits it, or merges it with its
    /// sibling, returning the children's depth on a split. Merge refusals
    /// (sibling not pending, mixed progress) are legitimate; split of a
    /// snapshot-pending bucket must succeed.
    fn split_or_merge(&self, iter: &VisitorIterator, rng: &mut SimRng) -> Option<u8> {
        let pending = iter.pending_snapshot();
        if pending.is_empty() {
            return None;
        }
        let (bucket, _) = pending[rng.below(pending.len() as u64) as usize];
        if rng.chance(50, 100) {
            if bucket.used_bits() < FINE_BITS {
                iter.split_pending_bucket(bucket)
                    .expect("splitting a snapshot-pending bucket");
                return Some(bucket.used_bits() + 1);
            }
        } else if bucket.used_bits() > 0 {
            let _ = iter.merge_pending_bucket(bucket);
        }
        None
    }

    fn check_coverage(
        &self,
        coverage: &Coverage,
        requeue_seen: bool,
        step: u64,
    ) -> Option<FailureReport> {
        let violation = |message: String| {
            Some(FailureReport {
                kind: FailureKind::InvariantViolation,
                message,
                step,
            })
        };
        match coverage {
            Coverage::Range(slots) => {
                for (raw, &count) in slots.iter().enumerate() {
                    if count == 0 {
                        return violation(format!("fine bucket {raw:#x} never visited"));
                    }
                    // Only a resolution change may re-queue finished work.
                    if count > 1 && !requeue_seen {
                        return violation(format!("fine bucket {raw:#x} visited {count} times"));
                    }
                }
                None
            }
            Coverage::Explicit(counts) => {
                let ids = match &self.scenario.selection {
                    SelectionSpec::Explicit { ids } => ids,
                    SelectionSpec::FullRange => unreachable!("explicit coverage for range"),
                };
                let mut expected: Vec<BucketId> = ids
                    .iter()
                    .map(|&id| BucketId::new(EXPLICIT_BUCKET_BITS, mix64(id) & 0xffff_ffff))
                    .collect();
                expected.sort_by_key(|b| b.key());
                expected.dedup();
                for bucket in &expected {
                    match counts.get(bucket) {
                        None => return violation(format!("superbucket {bucket} never visited")),
                        Some(&count) if count != 1 => {
                            return violation(format!("superbucket {bucket} visited {count} times"))
                        }
                        Some(_) => {}
                    }
                }
                if counts.len() != expected.len() {
                    return violation(format!(
                        "visited {} superbuckets, expected {}",
                        counts.len(),
                        expected.len()
                    ));
                }
                None
            }
        }
    }
}

/// A marker strictly inside `superbucket`, one to three levels deeper.
fn random_mark(superbucket: BucketId, rng: &mut SimRng) -> BucketId {
    let extra_bits = 1 + rng.below(3) as u8;
    let depth = superbucket.used_bits() + extra_bits;
    let extra = rng.below(1u64 << extra_bits);
    BucketId::new(depth, superbucket.raw() | (extra << superbucket.used_bits()))
}

fn check_round_trips(token: &ProgressToken, step: u64) -> Option<FailureReport> {
    let mismatch = |format: &str| {
        Some(FailureReport {
            kind: FailureKind::CheckpointMismatch,
            message: format!("{format} round-trip diverged"),
            step,
        })
    };
    match ProgressToken::from_text(&token.to_text()) {
        Ok(back) if &back == token => {}
        _ => return mismatch("text"),
    }
    match ProgressToken::from_bytes(&token.to_bytes()) {
        Ok(back) if &back == token => {}
        _ => return mismatch("binary"),
    }
    // Pending order must be hand-out order.
    let pending = token.pending_buckets();
    let keys: Vec<_> = pending.iter().map(|(b, _)| b.key()).collect();
    let sorted = {
        let mut s = keys.clone();
        s.sort();
        s
    };
    if keys != sorted {
        return Some(FailureReport {
            kind: FailureKind::InvariantViolation,
            message: "pending snapshot out of key order".to_string(),
            step,
        });
    }
    None
}
