//! Bucket sources: where untouched superbuckets come from.
//!
//! A source enumerates the superbuckets a visit has never handed out, in
//! bucket-key order, and owns the resolution-change state machine. Two
//! flavors exist:
//!
//! * [`RangeSource`]: the full-range universe of `2^bits` superbuckets,
//!   generated on demand from the cursor. Resolution changes restructure
//!   the universe and are deferred while any bucket is outstanding.
//! * [`ExplicitSource`]: a finite identifier set hashed to fixed-depth
//!   superbuckets up front. Resolution changes are informational only.
//!
//! Sources never hand out a bucket twice: the token's cursor advances at
//! hand-out time, so a crash between hand-out and the first progress
//! report is recovered by the consistency rules in the token itself.

use crate::bucket::{BucketId, BucketKey, MAX_USED_BITS};
use crate::progress::ProgressToken;
use crate::stdx::mix64;

/// Depth at which explicit identifiers are pinned, regardless of the
/// nominal distribution bit count. Deep enough that per-identifier
/// buckets almost never collide in practice.
pub const EXPLICIT_BUCKET_BITS: u8 = 32;

/// Full-range source: every superbucket of the `2^bits` universe.
#[derive(Debug)]
pub struct RangeSource {
    distribution_bits: u32,
    /// Set while a resolution change waits for the active set to drain.
    pending_target: Option<u32>,
}

/// Explicit source: the fixed superbuckets of a literal identifier set.
#[derive(Debug)]
pub struct ExplicitSource {
    /// Hashed superbuckets, bucket-key ordered, duplicates removed.
    superbuckets: Vec<BucketId>,
    distribution_bits: u32,
}

impl RangeSource {
    fn new(distribution_bits: u32) -> Self {
        Self {
            distribution_bits,
            pending_target: None,
        }
    }
}

impl ExplicitSource {
    /// Hashes each identifier to a depth-32 superbucket, then key-sorts
    /// and deduplicates. Identifiers that collide into the same bucket
    /// yield one visit covering both.
    fn from_ids(ids: &[u64], distribution_bits: u32) -> Self {
        let mut superbuckets: Vec<BucketId> = ids
            .iter()
            .map(|&id| BucketId::new(EXPLICIT_BUCKET_BITS, mix64(id) & 0xffff_ffff))
            .collect();
        superbuckets.sort_by_key(|b| BucketKey::from_bucket(*b));
        superbuckets.dedup();
        Self {
            superbuckets,
            distribution_bits,
        }
    }
}

/// A bucket source plus its resolution-change state machine.
#[derive(Debug)]
pub enum BucketSource {
    Range(RangeSource),
    Explicit(ExplicitSource),
}

impl BucketSource {
    /// Builds the source for a fresh visit and the matching fresh token.
    ///
    /// # Panics
    ///
    /// Panics if `distribution_bits > 58`.
    pub(crate) fn new_range(distribution_bits: u32) -> (Self, ProgressToken) {
        let token = ProgressToken::new(distribution_bits);
        (Self::Range(RangeSource::new(distribution_bits)), token)
    }

    pub(crate) fn new_explicit(ids: &[u64], distribution_bits: u32) -> (Self, ProgressToken) {
        assert!(
            distribution_bits <= MAX_USED_BITS as u32,
            "distribution bit count {distribution_bits} exceeds max {MAX_USED_BITS}"
        );
        let source = ExplicitSource::from_ids(ids, distribution_bits);
        let token = ProgressToken::with_total(distribution_bits, source.superbuckets.len() as u64);
        (Self::Explicit(source), token)
    }

    /// Rebuilds a source around a resumed token. The token's own
    /// distribution bit count wins; a differing requested count is applied
    /// afterwards through [`set_distribution_bit_count`].
    ///
    /// [`set_distribution_bit_count`]: Self::set_distribution_bit_count
    pub(crate) fn resume_range(token: &ProgressToken) -> Self {
        Self::Range(RangeSource::new(token.distribution_bit_count()))
    }

    pub(crate) fn resume_explicit(ids: &[u64], token: &ProgressToken) -> Self {
        Self::Explicit(ExplicitSource::from_ids(ids, token.distribution_bit_count()))
    }

    /// The resolution hand-outs currently use. While a change is deferred
    /// this is still the old value.
    pub fn distribution_bit_count(&self) -> u32 {
        match self {
            Self::Range(r) => r.distribution_bits,
            Self::Explicit(e) => e.distribution_bits,
        }
    }

    /// The most recently requested resolution, deferred or not.
    pub fn target_bit_count(&self) -> u32 {
        match self {
            Self::Range(r) => r.pending_target.unwrap_or(r.distribution_bits),
            Self::Explicit(e) => e.distribution_bits,
        }
    }

    /// True while a resolution change waits for active buckets to drain.
    /// No bucket may be handed out in this window.
    pub fn should_yield(&self) -> bool {
        matches!(self, Self::Range(r) if r.pending_target.is_some())
    }

    /// Number of superbuckets an explicit source will ever hand out.
    /// `None` for a range source, whose universe lives in the token.
    pub(crate) fn explicit_total(&self) -> Option<u64> {
        match self {
            Self::Range(_) => None,
            Self::Explicit(e) => Some(e.superbuckets.len() as u64),
        }
    }

    /// True if the source still holds superbuckets it has never handed out.
    pub fn has_more(&self, token: &ProgressToken) -> bool {
        match self {
            // The cursor ranges over the `2^bits` superbuckets; the
            // token's total also counts units added by manual splits.
            Self::Range(r) => token.bucket_cursor() < (1u64 << r.distribution_bits),
            Self::Explicit(e) => (token.bucket_cursor() as usize) < e.superbuckets.len(),
        }
    }

    /// Hands out the next untouched superbucket, advancing the token's
    /// cursor. Returns `None` when the supply is exhausted or a deferred
    /// resolution change blocks hand-outs.
    pub(crate) fn next(&self, token: &mut ProgressToken) -> Option<BucketId> {
        if self.should_yield() || !self.has_more(token) {
            return None;
        }
        let n = token.advance_cursor();
        match self {
            Self::Range(r) => Some(BucketKey::nth(n, r.distribution_bits).to_bucket_id()),
            Self::Explicit(e) => Some(e.superbuckets[n as usize]),
        }
    }

    /// Requests a new resolution.
    ///
    /// For a range source the change is applied immediately when no bucket
    /// is outstanding, otherwise it is parked and [`should_yield`] turns
    /// true until the active set drains. Re-requesting the current
    /// resolution cancels a parked change. For an explicit source only the
    /// reported bit count moves; the superbucket set is fixed.
    ///
    /// [`should_yield`]: Self::should_yield
    pub(crate) fn set_distribution_bit_count(&mut self, target: u32, token: &mut ProgressToken) {
        assert!(
            target <= MAX_USED_BITS as u32,
            "distribution bit count {target} exceeds max {MAX_USED_BITS}"
        );
        match self {
            Self::Range(r) => {
                if target == r.distribution_bits {
                    r.pending_target = None;
                    return;
                }
                if token.active_bucket_count() == 0 {
                    r.apply(target, token);
                } else {
                    r.pending_target = Some(target);
                }
            }
            Self::Explicit(e) => {
                e.distribution_bits = target;
                token.set_reported_bits(target);
            }
        }
    }

    /// Applies a parked resolution change once the active set has drained.
    /// Call after every progress update; a no-op otherwise.
    pub(crate) fn complete_pending_change(&mut self, token: &mut ProgressToken) {
        if let Self::Range(r) = self {
            if token.active_bucket_count() > 0 {
                return;
            }
            if let Some(target) = r.pending_target {
                r.apply(target, token);
            }
        }
    }
}

impl RangeSource {
    fn apply(&mut self, target: u32, token: &mut ProgressToken) {
        debug_assert_eq!(token.active_bucket_count(), 0);
        if token.is_lossless_reset_possible() {
            token.lossless_reset(target);
        } else if target > token.distribution_bit_count() {
            token.apply_bit_increase(target);
        } else if target < token.distribution_bit_count() {
            token.apply_bit_decrease(target);
        }
        self.distribution_bits = target;
        self.pending_target = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::BucketProgress;

    #[test]
    fn range_source_hands_out_key_order() {
        let (source, mut token) = BucketSource::new_range(3);
        let raws: Vec<u64> = std::iter::from_fn(|| source.next(&mut token).map(|b| b.raw()))
            .collect();
        assert_eq!(raws, vec![0, 4, 2, 6, 1, 5, 3, 7]);
        assert!(!source.has_more(&token));
    }

    #[test]
    fn explicit_source_sorts_and_dedupes() {
        let ids = [7u64, 7, 42, 1_000_000];
        let (source, token) = BucketSource::new_explicit(&ids, 16);
        assert_eq!(token.total_bucket_count(), 3);
        match &source {
            BucketSource::Explicit(e) => {
                assert_eq!(e.superbuckets.len(), 3);
                for b in &e.superbuckets {
                    assert_eq!(b.used_bits(), EXPLICIT_BUCKET_BITS);
                }
                let keys: Vec<BucketKey> = e
                    .superbuckets
                    .iter()
                    .map(|b| BucketKey::from_bucket(*b))
                    .collect();
                let mut sorted = keys.clone();
                sorted.sort();
                assert_eq!(keys, sorted);
            }
            BucketSource::Range(_) => panic!("expected explicit source"),
        }
    }

    #[test]
    fn explicit_hashing_is_stable() {
        let (a, _) = BucketSource::new_explicit(&[1, 2, 3], 16);
        let (b, _) = BucketSource::new_explicit(&[3, 2, 1], 16);
        match (&a, &b) {
            (BucketSource::Explicit(a), BucketSource::Explicit(b)) => {
                assert_eq!(a.superbuckets, b.superbuckets);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn range_change_defers_while_active() {
        let (mut source, mut token) = BucketSource::new_range(2);
        let b = source.next(&mut token).unwrap();
        token.activate_fresh(b);

        source.set_distribution_bit_count(3, &mut token);
        assert!(source.should_yield());
        assert_eq!(source.distribution_bit_count(), 2);
        assert_eq!(source.target_bit_count(), 3);
        assert!(source.next(&mut token).is_none());

        token.update_progress(b, BucketProgress::Finished);
        source.complete_pending_change(&mut token);
        assert!(!source.should_yield());
        assert_eq!(source.distribution_bit_count(), 3);
        assert_eq!(token.total_bucket_count(), 8);
    }

    #[test]
    fn range_change_applies_immediately_when_idle() {
        let (mut source, mut token) = BucketSource::new_range(2);
        source.set_distribution_bit_count(4, &mut token);
        assert!(!source.should_yield());
        assert_eq!(token.distribution_bit_count(), 4);
        assert_eq!(token.total_bucket_count(), 16);
    }

    #[test]
    fn rerequesting_current_bits_cancels_parked_change() {
        let (mut source, mut token) = BucketSource::new_range(2);
        let b = source.next(&mut token).unwrap();
        token.activate_fresh(b);
        source.set_distribution_bit_count(5, &mut token);
        assert!(source.should_yield());
        source.set_distribution_bit_count(2, &mut token);
        assert!(!source.should_yield());
        assert_eq!(source.distribution_bit_count(), 2);
    }

    #[test]
    fn explicit_change_is_informational() {
        let (mut source, mut token) = BucketSource::new_explicit(&[10, 20], 16);
        let b = source.next(&mut token).unwrap();
        token.activate_fresh(b);

        source.set_distribution_bit_count(20, &mut token);
        assert!(!source.should_yield());
        assert_eq!(token.distribution_bit_count(), 20);
        assert_eq!(token.total_bucket_count(), 2);
        // Remaining hand-outs are unaffected.
        assert!(source.next(&mut token).is_some());
    }
}
