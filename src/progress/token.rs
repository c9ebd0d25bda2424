//! The persisted scan state machine.
//!
//! A `ProgressToken` is the authoritative record of how far a bucket-space
//! visit has advanced. It owns two explicit state partitions:
//!
//! - **pending**: superbuckets with outstanding work, keyed by enumeration
//!   key in an ordered map, each valued with the progress marker reached so
//!   far. This partition is what serialization persists.
//! - **active**: superbuckets currently handed out to a worker, keyed the
//!   same way, valued with the progress marker they were handed out at.
//!   This partition is in-memory only: serialization folds it back into
//!   pending at the last-known progress, so active state never survives a
//!   round trip.
//!
//! The third lifecycle state, **finished**, is a counter plus the cursor
//! invariant below; finished buckets carry no per-bucket record.
//!
//! # Invariants
//!
//! - `finished + pending + active <= total` at all times. Every pending
//!   or active entry counts as one unit of `total` regardless of depth:
//!   a manual split grows the universe by one unit, a merge shrinks it
//!   back, so finishing both halves of a split bucket stays in balance.
//! - Range universe: every superbucket with enumeration index below
//!   `bucket_cursor` is finished, pending, or active, never implicitly
//!   untouched. The cursor advances when a bucket is handed out for the
//!   first time.
//! - All resolution-change arithmetic is exact power-of-two integer
//!   scaling; no rounding ever touches the counters.
//!
//! The token performs no I/O and no locking; `VisitorIterator` drives it
//! behind a single mutex.

use std::collections::BTreeMap;

use ahash::AHashMap;

use crate::bucket::{BucketId, BucketKey, MAX_USED_BITS};

use super::errors::{BucketMergeError, BucketSplitError};

/// Completion state of one superbucket's sub-space.
///
/// Tagged variant form of the legacy sentinel convention: the zero marker
/// ("not started") and the finished marker become explicit variants instead
/// of reserved bucket values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BucketProgress {
    /// No part of the superbucket has been visited.
    NotStarted,
    /// Visited up to (but not including) this sub-bucket, in enumeration
    /// order. The marker is at a finer resolution than its superbucket.
    At(BucketId),
    /// The whole superbucket has been visited.
    Finished,
}

impl BucketProgress {
    /// Packed wire form. `Finished` is never serialized (finished buckets
    /// leave the pending map), so only the other variants are encodable.
    pub(crate) fn packed(&self) -> u64 {
        match self {
            Self::NotStarted => 0,
            Self::At(marker) => marker.packed(),
            Self::Finished => {
                debug_assert!(false, "finished markers are not serialized");
                0
            }
        }
    }

    /// Decodes a packed wire value; zero is the not-started marker.
    pub(crate) fn from_packed(value: u64) -> Option<Self> {
        if value == 0 {
            return Some(Self::NotStarted);
        }
        BucketId::from_packed(value).map(Self::At)
    }
}

/// Fraction of `superbucket` covered by `progress`, in `[0.0, 1.0]`.
///
/// A marker at depth `p` inside a superbucket at depth `s` divides the
/// superbucket into `2^(p-s)` slices in enumeration order; the fraction is
/// the marker's slice rank over the slice count. Markers not strictly
/// inside the superbucket contribute nothing.
pub fn progress_fraction(superbucket: BucketId, progress: BucketProgress) -> f64 {
    match progress {
        BucketProgress::NotStarted => 0.0,
        BucketProgress::Finished => 1.0,
        BucketProgress::At(marker) => {
            if marker.used_bits() <= superbucket.used_bits() || !superbucket.contains(&marker) {
                return 0.0;
            }
            let depth = (marker.used_bits() - superbucket.used_bits()) as u32;
            let extra = (marker.raw() >> superbucket.used_bits()) & crate::stdx::low_mask(depth);
            // Slice rank in enumeration order: the extra bits, bit-reversed.
            let rank = extra.reverse_bits() >> (64 - depth);
            rank as f64 / (1u64 << depth) as f64
        }
    }
}

/// Authoritative, resumable state of one bucket-space visit.
///
/// Created fresh for a new scan or deserialized from the text/binary wire
/// formats; mutated exclusively through [`update_progress`],
/// [`split_pending_bucket`], [`merge_pending_bucket`], and the
/// resolution-change operations driven by `VisitorIterator`.
///
/// [`update_progress`]: ProgressToken::update_progress
/// [`split_pending_bucket`]: ProgressToken::split_pending_bucket
/// [`merge_pending_bucket`]: ProgressToken::merge_pending_bucket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressToken {
    /// Current partition resolution: the keyspace is split into
    /// `2^distribution_bits` superbuckets (range universe).
    distribution_bits: u32,
    /// Range universe: enumeration index of the next never-handed-out
    /// superbucket. Explicit universe: count of handed-out set members.
    bucket_cursor: u64,
    /// Superbuckets visited to completion. Monotonic between resolution
    /// changes; exactly rescaled across them.
    finished_buckets: u64,
    /// Size of the bucket universe: `2^distribution_bits` for a range
    /// visit, the distinct-superbucket cardinality for an explicit one.
    total_buckets: u64,
    /// Pending partition (persisted).
    pending: BTreeMap<BucketKey, BucketProgress>,
    /// Active partition (in-memory only; folded into pending on
    /// serialization).
    active: AHashMap<BucketKey, BucketProgress>,
}

impl ProgressToken {
    /// Fresh token over the full-range universe at the given resolution.
    ///
    /// # Panics
    ///
    /// Panics if `distribution_bits > 58`.
    pub fn new(distribution_bits: u32) -> Self {
        assert!(
            distribution_bits <= MAX_USED_BITS as u32,
            "distribution bit count {distribution_bits} exceeds max {MAX_USED_BITS}"
        );
        Self {
            distribution_bits,
            bucket_cursor: 0,
            finished_buckets: 0,
            total_buckets: 1u64 << distribution_bits,
            pending: BTreeMap::new(),
            active: AHashMap::new(),
        }
    }

    /// Fresh token over an explicit universe of `total` superbuckets.
    pub(crate) fn with_total(distribution_bits: u32, total: u64) -> Self {
        let mut token = Self::new(distribution_bits);
        token.total_buckets = total;
        token
    }

    /// Reassembles a token from deserialized fields. The caller (the wire
    /// format parsers) has already validated structural consistency.
    pub(crate) fn from_parts(
        distribution_bits: u32,
        bucket_cursor: u64,
        finished_buckets: u64,
        total_buckets: u64,
        pending: BTreeMap<BucketKey, BucketProgress>,
    ) -> Self {
        Self {
            distribution_bits,
            bucket_cursor,
            finished_buckets,
            total_buckets,
            pending,
            active: AHashMap::new(),
        }
    }

    /// Reassembles a token from deserialized fields, re-deriving and
    /// checking the consistency the counters imply instead of trusting
    /// them blindly.
    pub(crate) fn validated_from_parts(
        distribution_bits: u32,
        bucket_cursor: u64,
        finished_buckets: u64,
        total_buckets: u64,
        pending: BTreeMap<BucketKey, BucketProgress>,
    ) -> Result<Self, super::errors::ProgressFileError> {
        use super::errors::ProgressFileError;
        if distribution_bits > MAX_USED_BITS as u32 {
            return Err(ProgressFileError::BitCountOutOfRange {
                bits: distribution_bits,
            });
        }
        if bucket_cursor > total_buckets {
            return Err(ProgressFileError::InconsistentCounters {
                detail: "cursor exceeds total bucket count",
            });
        }
        let outstanding = finished_buckets.checked_add(pending.len() as u64);
        if outstanding.map_or(true, |sum| sum > total_buckets) {
            return Err(ProgressFileError::InconsistentCounters {
                detail: "finished plus pending exceeds total bucket count",
            });
        }
        Ok(Self::from_parts(
            distribution_bits,
            bucket_cursor,
            finished_buckets,
            total_buckets,
            pending,
        ))
    }

    /// Current partition resolution.
    #[inline]
    pub fn distribution_bit_count(&self) -> u32 {
        self.distribution_bits
    }

    /// See the field docs: next never-handed index (range) or handed count
    /// (explicit).
    #[inline]
    pub fn bucket_cursor(&self) -> u64 {
        self.bucket_cursor
    }

    /// Superbuckets visited to completion.
    #[inline]
    pub fn finished_bucket_count(&self) -> u64 {
        self.finished_buckets
    }

    /// Size of the bucket universe at the current resolution.
    #[inline]
    pub fn total_bucket_count(&self) -> u64 {
        self.total_buckets
    }

    /// Number of pending entries.
    #[inline]
    pub fn pending_bucket_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of buckets currently handed out.
    #[inline]
    pub fn active_bucket_count(&self) -> usize {
        self.active.len()
    }

    /// True once every bucket of the universe has been visited and nothing
    /// is outstanding.
    pub fn is_finished(&self) -> bool {
        self.finished_buckets == self.total_buckets
            && self.pending.is_empty()
            && self.active.is_empty()
    }

    /// True when the token's universe is the `2^bits` full-range partition
    /// (as opposed to an explicit identifier set).
    pub fn is_range_universe(&self) -> bool {
        self.universe_superbucket_count() == Some(1u64 << self.distribution_bits)
    }

    /// Number of superbuckets in the underlying universe, net of the
    /// inflation manual splits add to `total_buckets`. Splits grow total
    /// and the outstanding entry count in lockstep, so the difference
    /// plus the cursor always recovers the superbucket count. `None` only
    /// on counters no valid token can carry.
    pub(crate) fn universe_superbucket_count(&self) -> Option<u64> {
        let outstanding = self
            .finished_buckets
            .checked_add(self.pending.len() as u64)?
            .checked_add(self.active.len() as u64)?;
        self.total_buckets
            .checked_sub(outstanding)?
            .checked_add(self.bucket_cursor)
    }

    /// Snapshot of the pending partition, lowest key first.
    pub fn pending_buckets(&self) -> Vec<(BucketId, BucketProgress)> {
        self.pending
            .iter()
            .map(|(key, progress)| (key.to_bucket_id(), *progress))
            .collect()
    }

    /// Overall completion in percent.
    ///
    /// `100 * (finished + sum of fractions over pending and active) / total`. A zero
    /// universe (empty explicit selection) reports 100.
    pub fn percent_finished(&self) -> f64 {
        if self.total_buckets == 0 {
            return 100.0;
        }
        let mut done = self.finished_buckets as f64;
        for (key, progress) in self
            .pending
            .iter()
            .chain(self.active.iter().map(|(k, v)| (k, v)))
        {
            done += progress_fraction(key.to_bucket_id(), *progress);
        }
        100.0 * done / self.total_buckets as f64
    }

    /// Answers "has this part of the keyspace already been fully covered",
    /// for an id at any resolution.
    ///
    /// Exact in the range universe via the cursor invariant. In an explicit
    /// universe the token does not know the bucket set, so the answer is
    /// exact for pending/active membership and the terminal state, and
    /// conservatively `false` otherwise.
    pub fn is_bucket_finished(&self, bucket: BucketId) -> bool {
        if self.is_finished() {
            return true;
        }
        let bits = self.distribution_bits;
        if (bucket.used_bits() as u32) >= bits {
            let sup = bucket.truncated(bits as u8);
            let key = sup.key();
            if self.active.contains_key(&key) {
                return false;
            }
            // Any pending entry inside the superbucket means unfinished
            // work there (entries may sit finer than `bits` after splits).
            if self
                .pending
                .range(key..)
                .take_while(|(k, _)| sup.contains(&k.to_bucket_id()))
                .next()
                .is_some()
            {
                return false;
            }
            if !self.is_range_universe() {
                return false;
            }
            key.enumeration_index(bits) < self.bucket_cursor
        } else {
            // Coarser than a superbucket: finished only if every covered
            // superbucket is.
            if !self.is_range_universe() {
                return false;
            }
            let span = bits - bucket.used_bits() as u32;
            let first = bucket.key().enumeration_index(bucket.used_bits() as u32) << span;
            let end = first + (1u64 << span);
            if end > self.bucket_cursor {
                return false;
            }
            let covered = |k: &BucketKey| bucket.contains(&k.to_bucket_id());
            !self.pending.keys().any(covered) && !self.active.keys().any(covered)
        }
    }

    /// Records the outcome of visiting `superbucket`.
    ///
    /// The bucket must currently be active; updates for unknown or
    /// non-active buckets (duplicates, late retries) are tolerated as
    /// silent no-ops. `Finished` retires the bucket; `NotStarted` requeues
    /// it from scratch; a marker requeues it at that partial position.
    pub fn update_progress(&mut self, superbucket: BucketId, progress: BucketProgress) {
        let key = superbucket.key();
        if self.active.remove(&key).is_none() {
            // No-op guard: duplicate or late update.
            return;
        }
        match progress {
            BucketProgress::Finished => self.finished_buckets += 1,
            other => {
                self.pending.insert(key, other);
            }
        }
    }

    /// Hands out the lowest-key pending entry, moving it to active.
    pub(crate) fn activate_pending_front(&mut self) -> Option<(BucketId, BucketProgress)> {
        let (key, progress) = self.pending.pop_first()?;
        self.active.insert(key, progress);
        Some((key.to_bucket_id(), progress))
    }

    /// Hands out a never-touched superbucket supplied by the source.
    pub(crate) fn activate_fresh(&mut self, superbucket: BucketId) {
        let replaced = self
            .active
            .insert(superbucket.key(), BucketProgress::NotStarted);
        debug_assert!(replaced.is_none(), "fresh bucket was already active");
    }

    /// Advances the hand-out cursor, returning its previous value.
    pub(crate) fn advance_cursor(&mut self) -> u64 {
        let at = self.bucket_cursor;
        self.bucket_cursor += 1;
        at
    }

    /// Replaces one pending entry with its two children, both inheriting
    /// the parent's progress marker. Manual resharding of concurrency
    /// granularity; the strict inverse of [`merge_pending_bucket`].
    ///
    /// The parent's single unit of the universe becomes two, so
    /// `total_bucket_count` grows by one and each half finishes as a unit
    /// of its own.
    ///
    /// [`merge_pending_bucket`]: ProgressToken::merge_pending_bucket
    pub fn split_pending_bucket(&mut self, bucket: BucketId) -> Result<(), BucketSplitError> {
        let key = bucket.key();
        let Some(&progress) = self.pending.get(&key) else {
            return Err(BucketSplitError::NotPending { bucket });
        };
        if bucket.used_bits() >= MAX_USED_BITS {
            return Err(BucketSplitError::MaxResolution { bucket });
        }
        self.pending.remove(&key);
        let (c0, c1) = bucket.split();
        self.pending.insert(c0.key(), progress);
        self.pending.insert(c1.key(), progress);
        self.total_buckets += 1;
        Ok(())
    }

    /// Collapses `bucket` and its exact sibling back into their parent,
    /// which inherits their shared progress marker. Fails without mutating
    /// state if the pair are not pending siblings at identical progress.
    /// Undoes the split's universe growth: `total_bucket_count` shrinks
    /// by one.
    pub fn merge_pending_bucket(&mut self, bucket: BucketId) -> Result<(), BucketMergeError> {
        if bucket.used_bits() == 0 {
            return Err(BucketMergeError::RootBucket);
        }
        if (bucket.used_bits() as u32) <= self.distribution_bits {
            return Err(BucketMergeError::AtSuperbucketResolution { bucket });
        }
        let Some(&progress) = self.pending.get(&bucket.key()) else {
            return Err(BucketMergeError::NotPending { bucket });
        };
        let sibling = bucket.sibling();
        let Some(&sibling_progress) = self.pending.get(&sibling.key()) else {
            return Err(BucketMergeError::NotSiblings { bucket, sibling });
        };
        if progress != sibling_progress {
            return Err(BucketMergeError::ProgressMismatch { bucket, sibling });
        }
        self.pending.remove(&bucket.key());
        self.pending.remove(&sibling.key());
        self.pending.insert(bucket.join().key(), progress);
        self.total_buckets -= 1;
        Ok(())
    }

    /// True when a resolution change costs O(1): nothing has been handed
    /// out, finished, or queued yet.
    pub fn is_lossless_reset_possible(&self) -> bool {
        self.bucket_cursor == 0
            && self.finished_buckets == 0
            && self.pending.is_empty()
            && self.active.is_empty()
    }

    /// O(1) resolution change for an untouched range token.
    pub(crate) fn lossless_reset(&mut self, new_bits: u32) {
        debug_assert!(self.is_lossless_reset_possible());
        self.distribution_bits = new_bits;
        self.total_buckets = 1u64 << new_bits;
    }

    /// Raises the resolution: every pending entry splits down to the new
    /// depth (children inherit the parent's marker verbatim) and each
    /// finished or handed-out bucket is worth `2^k` at the new resolution.
    ///
    /// A pending entry a manual split left finer than the new depth does
    /// not fit one new-resolution unit; its covering bucket restarts
    /// whole. Coverage is never lost; work may be repeated.
    pub(crate) fn apply_bit_increase(&mut self, new_bits: u32) {
        debug_assert!(self.active.is_empty(), "resolution change with active buckets");
        debug_assert!(new_bits > self.distribution_bits);
        let k = new_bits - self.distribution_bits;
        let old = std::mem::take(&mut self.pending);
        for (key, progress) in old {
            let bucket = key.to_bucket_id();
            if (bucket.used_bits() as u32) > new_bits {
                let group = bucket.truncated(new_bits as u8);
                self.pending.insert(group.key(), BucketProgress::NotStarted);
                continue;
            }
            let mut stack = vec![bucket];
            while let Some(bucket) = stack.pop() {
                if (bucket.used_bits() as u32) < new_bits {
                    let (c0, c1) = bucket.split();
                    stack.push(c0);
                    stack.push(c1);
                } else {
                    self.pending.insert(bucket.key(), progress);
                }
            }
        }
        self.bucket_cursor <<= k;
        // Handed-out area minus what is still queued. Split-born units in
        // the old counter are worth less than `2^k` each, so the finished
        // count is re-derived rather than shifted.
        self.finished_buckets = self.bucket_cursor - self.pending.len() as u64;
        self.total_buckets = 1u64 << new_bits;
        self.distribution_bits = new_bits;
    }

    /// Lowers the resolution: groups of `2^k` key-adjacent siblings
    /// collapse to one bucket each.
    ///
    /// Conservative collapse: a group with any pending member restarts at
    /// `NotStarted`; the partially handed-out boundary group (cursor not a
    /// multiple of `2^k`) drops its pending entries and is re-handed whole
    /// by the cursor. Coverage is never lost; work may be repeated.
    pub(crate) fn apply_bit_decrease(&mut self, new_bits: u32) {
        debug_assert!(self.active.is_empty(), "resolution change with active buckets");
        debug_assert!(new_bits < self.distribution_bits);
        let k = self.distribution_bits - new_bits;
        let full_groups = self.bucket_cursor >> k;
        let old = std::mem::take(&mut self.pending);
        let mut groups = std::collections::BTreeSet::new();
        for key in old.into_keys() {
            let sup = key.to_bucket_id();
            debug_assert!((sup.used_bits() as u32) >= self.distribution_bits);
            let idx = sup
                .truncated(new_bits as u8)
                .key()
                .enumeration_index(new_bits);
            if idx < full_groups {
                groups.insert(idx);
            }
        }
        self.finished_buckets = full_groups - groups.len() as u64;
        self.bucket_cursor = full_groups;
        for idx in groups {
            let group = BucketKey::nth(idx, new_bits).to_bucket_id();
            self.pending.insert(group.key(), BucketProgress::NotStarted);
        }
        self.total_buckets = 1u64 << new_bits;
        self.distribution_bits = new_bits;
    }

    /// Explicit universe only: records the new reported resolution without
    /// touching the bucket set.
    pub(crate) fn set_reported_bits(&mut self, new_bits: u32) {
        self.distribution_bits = new_bits;
    }

    /// Pending partition with active entries folded back in at their
    /// last-known progress: the view serialization persists.
    pub(crate) fn folded_pending(&self) -> BTreeMap<BucketKey, BucketProgress> {
        let mut folded = self.pending.clone();
        for (key, progress) in &self.active {
            folded.insert(*key, *progress);
        }
        folded
    }

    /// Quiesced snapshot: a clone with the active partition folded back
    /// into pending, safe to persist while workers keep running.
    pub fn checkpoint(&self) -> ProgressToken {
        ProgressToken {
            distribution_bits: self.distribution_bits,
            bucket_cursor: self.bucket_cursor,
            finished_buckets: self.finished_buckets,
            total_buckets: self.total_buckets,
            pending: self.folded_pending(),
            active: AHashMap::new(),
        }
    }
}
