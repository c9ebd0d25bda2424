//! Visitor iteration: handing superbuckets to concurrent workers.
//!
//! [`VisitorIterator`] wraps a [`ProgressToken`] and a [`BucketSource`]
//! behind one mutex so many worker threads can pull buckets, report
//! progress, and checkpoint through a shared handle. The token records
//! lifecycle (pending, active, finished); the source supplies untouched
//! buckets and arbitrates resolution changes. Every public method takes
//! `&self` and does its own locking.
//!
//! The hand-out contract: a superbucket handed to a worker is active
//! until that worker reports on it. Reports for buckets that are not
//! active are ignored, so a worker restarted after a checkpoint reload
//! cannot corrupt counters by double-reporting.

use std::sync::Mutex;

use crate::bucket::{BucketId, MAX_USED_BITS};
use crate::progress::{
    BucketMergeError, BucketProgress, BucketSplitError, ImportError, ProgressToken,
};
use crate::visit::selection::Selection;
use crate::visit::source::BucketSource;

/// A superbucket handed to a worker, with the point to resume from.
///
/// `progress` is [`BucketProgress::NotStarted`] for a bucket handed out
/// for the first time; for a bucket resumed from a checkpoint it carries
/// the last reported position, and the worker skips documents at or
/// below it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VisitorWorkItem {
    pub superbucket: BucketId,
    pub progress: BucketProgress,
}

#[derive(Debug)]
struct IterState {
    token: ProgressToken,
    source: BucketSource,
}

/// Thread-safe orchestrator of a bucket-space visit.
#[derive(Debug)]
pub struct VisitorIterator {
    state: Mutex<IterState>,
}

impl VisitorIterator {
    /// Builds an iterator for `selection` at the requested resolution,
    /// optionally resuming from a checkpointed token.
    ///
    /// A resumed token must describe the same bucket universe as the
    /// selection: the full `2^bits` range for [`Selection::FullRange`],
    /// or exactly the selection's distinct hashed superbuckets for
    /// [`Selection::Explicit`]. A token whose resolution differs from
    /// `distribution_bits` is adopted as-is and the requested resolution
    /// applied on top, exactly as a live `set_distribution_bit_count`
    /// would.
    ///
    /// # Panics
    ///
    /// Panics if `distribution_bits > 58`.
    pub fn new(
        selection: &Selection,
        distribution_bits: u32,
        resume: Option<ProgressToken>,
    ) -> Result<Self, ImportError> {
        assert!(
            distribution_bits <= MAX_USED_BITS as u32,
            "distribution bit count {distribution_bits} exceeds max {MAX_USED_BITS}"
        );
        let (mut source, mut token) = match (selection, resume) {
            (Selection::FullRange, None) => BucketSource::new_range(distribution_bits),
            (Selection::Explicit(ids), None) => BucketSource::new_explicit(ids, distribution_bits),
            (Selection::FullRange, Some(token)) => {
                if !token.is_range_universe() {
                    return Err(ImportError::InconsistentProgressSource {
                        expected_total: 1u64 << token.distribution_bit_count(),
                        token_total: token.total_bucket_count(),
                    });
                }
                check_cursor(&token)?;
                (BucketSource::resume_range(&token), token)
            }
            (Selection::Explicit(ids), Some(token)) => {
                let source = BucketSource::resume_explicit(ids, &token);
                let expected = source
                    .explicit_total()
                    .expect("explicit source has a fixed total");
                // Net of split inflation, so a checkpoint taken while a
                // pending bucket was split still resumes.
                if token.universe_superbucket_count() != Some(expected) {
                    return Err(ImportError::InconsistentProgressSource {
                        expected_total: expected,
                        token_total: token.total_bucket_count(),
                    });
                }
                check_cursor(&token)?;
                (source, token)
            }
        };
        if distribution_bits != token.distribution_bit_count() {
            // Fresh-built sources already match; this only fires on resume.
            source.set_distribution_bit_count(distribution_bits, &mut token);
        }
        Ok(Self {
            state: Mutex::new(IterState { token, source }),
        })
    }

    /// Hands out the next superbucket, preferring resumed pending buckets
    /// over untouched ones. Returns `None` when nothing can be handed out
    /// right now: supply exhausted, everything outstanding, or a deferred
    /// resolution change draining the active set.
    pub fn get_next(&self) -> Option<VisitorWorkItem> {
        let mut st = self.lock();
        if st.source.should_yield() {
            return None;
        }
        if let Some((superbucket, progress)) = st.token.activate_pending_front() {
            return Some(VisitorWorkItem {
                superbucket,
                progress,
            });
        }
        let IterState { token, source } = &mut *st;
        let superbucket = source.next(token)?;
        token.activate_fresh(superbucket);
        Some(VisitorWorkItem {
            superbucket,
            progress: BucketProgress::NotStarted,
        })
    }

    /// Reports a worker's progress on an active superbucket.
    ///
    /// [`BucketProgress::Finished`] retires the bucket; anything else
    /// parks it as pending, to be re-handed by a later [`get_next`].
    /// Reports for buckets that are not currently active are ignored.
    /// If this report drains the active set while a resolution change is
    /// parked, the change is applied before returning.
    ///
    /// [`get_next`]: Self::get_next
    pub fn update(&self, superbucket: BucketId, progress: BucketProgress) {
        let mut st = self.lock();
        let IterState { token, source } = &mut *st;
        token.update_progress(superbucket, progress);
        source.complete_pending_change(token);
    }

    /// True if a future [`get_next`] could succeed without further
    /// updates: some pending or untouched bucket exists and no deferred
    /// resolution change is blocking hand-outs.
    ///
    /// [`get_next`]: Self::get_next
    pub fn has_next(&self) -> bool {
        let st = self.lock();
        if st.source.should_yield() {
            return false;
        }
        st.token.pending_bucket_count() > 0 || st.source.has_more(&st.token)
    }

    /// True once every superbucket of the universe has finished.
    pub fn is_done(&self) -> bool {
        self.lock().token.is_finished()
    }

    /// True while a deferred resolution change waits for active buckets
    /// to drain. Callers should keep reporting progress and poll again.
    pub fn should_yield(&self) -> bool {
        self.lock().source.should_yield()
    }

    /// True while the iterator's target resolution and the token's applied
    /// resolution disagree, i.e. a requested change has not completed yet.
    /// Equivalent to [`should_yield`]; named for callers inspecting the
    /// state machine rather than scheduling work.
    ///
    /// [`should_yield`]: Self::should_yield
    pub fn is_inconsistent_state(&self) -> bool {
        self.should_yield()
    }

    /// Requests a new partition resolution.
    ///
    /// With no bucket outstanding the change applies immediately and
    /// existing progress is rescaled, never discarded. With buckets
    /// outstanding the change is parked: hand-outs stop until every
    /// active bucket reports, then the change applies. Re-requesting the
    /// current resolution cancels a parked change. For an explicit
    /// selection only the reported bit count moves.
    ///
    /// # Panics
    ///
    /// Panics if `target > 58`.
    pub fn set_distribution_bit_count(&self, target: u32) {
        let mut st = self.lock();
        let IterState { token, source } = &mut *st;
        source.set_distribution_bit_count(target, token);
    }

    /// The most recently requested resolution, applied or parked.
    pub fn distribution_bit_count(&self) -> u32 {
        self.lock().source.target_bit_count()
    }

    /// Completed fraction of the visit, in percent.
    pub fn percent_finished(&self) -> f64 {
        self.lock().token.percent_finished()
    }

    /// True if `bucket`'s span has been fully visited.
    pub fn is_bucket_finished(&self, bucket: BucketId) -> bool {
        self.lock().token.is_bucket_finished(bucket)
    }

    /// Splits a pending superbucket into its two children, so two workers
    /// can take the halves independently.
    pub fn split_pending_bucket(&self, bucket: BucketId) -> Result<(), BucketSplitError> {
        self.lock().token.split_pending_bucket(bucket)
    }

    /// Merges a pending bucket with its pending sibling back into their
    /// parent.
    pub fn merge_pending_bucket(&self, bucket: BucketId) -> Result<(), BucketMergeError> {
        self.lock().token.merge_pending_bucket(bucket)
    }

    /// Pending buckets in hand-out order. Active buckets are not listed.
    pub fn pending_snapshot(&self) -> Vec<(BucketId, BucketProgress)> {
        self.lock().token.pending_buckets()
    }

    /// Point-in-time copy of the progress state, safe to persist. Active
    /// buckets are folded back to their last reported position, so a
    /// visit resumed from the copy re-hands them out.
    pub fn checkpoint(&self) -> ProgressToken {
        self.lock().token.checkpoint()
    }

    /// [`checkpoint`] rendered in the text progress-file format.
    ///
    /// [`checkpoint`]: Self::checkpoint
    pub fn checkpoint_text(&self) -> String {
        self.lock().token.to_text()
    }

    /// [`checkpoint`] rendered in the binary progress-blob format.
    ///
    /// [`checkpoint`]: Self::checkpoint
    pub fn checkpoint_bytes(&self) -> Vec<u8> {
        self.lock().token.to_bytes()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IterState> {
        self.state.lock().expect("visitor iterator mutex poisoned")
    }
}

fn check_cursor(token: &ProgressToken) -> Result<(), ImportError> {
    if token.bucket_cursor() > token.total_bucket_count() {
        return Err(ImportError::CursorOutOfRange {
            cursor: token.bucket_cursor(),
            total: token.total_bucket_count(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketKey;

    fn drain(iter: &VisitorIterator) -> Vec<BucketId> {
        let mut out = Vec::new();
        while let Some(item) = iter.get_next() {
            iter.update(item.superbucket, BucketProgress::Finished);
            out.push(item.superbucket);
        }
        out
    }

    #[test]
    fn fresh_range_visit_covers_universe_in_key_order() {
        let iter = VisitorIterator::new(&Selection::FullRange, 3, None).unwrap();
        assert!(iter.has_next());
        assert!(!iter.is_done());

        let visited = drain(&iter);
        let raws: Vec<u64> = visited.iter().map(|b| b.raw()).collect();
        assert_eq!(raws, vec![0, 4, 2, 6, 1, 5, 3, 7]);
        assert!(iter.is_done());
        assert!(!iter.has_next());
        assert_eq!(iter.percent_finished(), 100.0);
    }

    #[test]
    fn partial_report_requeues_with_resume_point() {
        let iter = VisitorIterator::new(&Selection::FullRange, 2, None).unwrap();
        let first = iter.get_next().unwrap();
        assert_eq!(first.progress, BucketProgress::NotStarted);

        let mark = BucketId::new(10, first.superbucket.raw() | (1 << 5));
        iter.update(first.superbucket, BucketProgress::At(mark));

        // The parked bucket comes back before any untouched one.
        let again = iter.get_next().unwrap();
        assert_eq!(again.superbucket, first.superbucket);
        assert_eq!(again.progress, BucketProgress::At(mark));
    }

    #[test]
    fn update_for_unknown_bucket_is_ignored() {
        let iter = VisitorIterator::new(&Selection::FullRange, 2, None).unwrap();
        iter.update(BucketId::new(2, 0b01), BucketProgress::Finished);
        assert_eq!(iter.percent_finished(), 0.0);
        assert_eq!(drain(&iter).len(), 4);
        assert!(iter.is_done());
    }

    #[test]
    fn double_finish_does_not_overcount() {
        let iter = VisitorIterator::new(&Selection::FullRange, 1, None).unwrap();
        let item = iter.get_next().unwrap();
        iter.update(item.superbucket, BucketProgress::Finished);
        iter.update(item.superbucket, BucketProgress::Finished);
        assert_eq!(iter.percent_finished(), 50.0);
    }

    #[test]
    fn deferred_bit_change_blocks_until_active_drains() {
        let iter = VisitorIterator::new(&Selection::FullRange, 2, None).unwrap();
        let item = iter.get_next().unwrap();

        iter.set_distribution_bit_count(3);
        assert!(iter.should_yield());
        assert!(iter.is_inconsistent_state());
        assert!(!iter.has_next());
        assert!(iter.get_next().is_none());
        // Requested value is visible while parked.
        assert_eq!(iter.distribution_bit_count(), 3);

        iter.update(item.superbucket, BucketProgress::Finished);
        assert!(!iter.should_yield());
        assert!(!iter.is_inconsistent_state());
        assert!(iter.has_next());

        // One of four depth-2 buckets finished carries over as two of
        // eight depth-3 buckets.
        assert_eq!(iter.percent_finished(), 25.0);
        let remaining = drain(&iter);
        assert_eq!(remaining.len(), 6);
        assert!(remaining.iter().all(|b| b.used_bits() == 3));
        assert!(iter.is_done());
    }

    #[test]
    fn resume_continues_where_checkpoint_left_off() {
        let iter = VisitorIterator::new(&Selection::FullRange, 2, None).unwrap();
        let a = iter.get_next().unwrap();
        let b = iter.get_next().unwrap();
        iter.update(a.superbucket, BucketProgress::Finished);
        let mark = BucketId::new(5, b.superbucket.raw());
        iter.update(b.superbucket, BucketProgress::At(mark));

        let token = iter.checkpoint();
        let resumed = VisitorIterator::new(&Selection::FullRange, 2, Some(token)).unwrap();

        // The parked bucket is re-handed with its mark before fresh ones.
        let first = resumed.get_next().unwrap();
        assert_eq!(first.superbucket, b.superbucket);
        assert_eq!(first.progress, BucketProgress::At(mark));
        resumed.update(first.superbucket, BucketProgress::Finished);

        let rest = drain(&resumed);
        assert_eq!(rest.len(), 2);
        assert!(!rest.contains(&a.superbucket));
        assert!(resumed.is_done());
    }

    #[test]
    fn resume_with_new_bits_rescales_on_entry() {
        let iter = VisitorIterator::new(&Selection::FullRange, 2, None).unwrap();
        let a = iter.get_next().unwrap();
        iter.update(a.superbucket, BucketProgress::Finished);

        let token = iter.checkpoint();
        let resumed = VisitorIterator::new(&Selection::FullRange, 3, Some(token)).unwrap();
        assert!(!resumed.should_yield());
        assert_eq!(resumed.distribution_bit_count(), 3);
        assert_eq!(resumed.percent_finished(), 25.0);
        assert_eq!(drain(&resumed).len(), 6);
        assert!(resumed.is_done());
    }

    #[test]
    fn explicit_selection_visits_each_distinct_identifier_bucket_once() {
        let ids = vec![3u64, 17, 17, 994];
        let iter = VisitorIterator::new(&Selection::Explicit(ids), 16, None).unwrap();
        let visited = drain(&iter);
        assert_eq!(visited.len(), 3);
        assert!(iter.is_done());
        assert_eq!(iter.percent_finished(), 100.0);
    }

    #[test]
    fn explicit_resume_rejects_mismatched_universe() {
        let iter = VisitorIterator::new(&Selection::Explicit(vec![1, 2, 3]), 16, None).unwrap();
        let token = iter.checkpoint();
        let err = VisitorIterator::new(&Selection::Explicit(vec![1, 2]), 16, Some(token))
            .unwrap_err();
        match err {
            ImportError::InconsistentProgressSource {
                expected_total,
                token_total,
            } => {
                assert_eq!(expected_total, 2);
                assert_eq!(token_total, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn range_resume_rejects_explicit_token() {
        let iter = VisitorIterator::new(&Selection::Explicit(vec![1, 2, 3]), 8, None).unwrap();
        let token = iter.checkpoint();
        assert!(matches!(
            VisitorIterator::new(&Selection::FullRange, 8, Some(token)),
            Err(ImportError::InconsistentProgressSource { .. })
        ));
    }

    #[test]
    fn split_then_halves_come_out_adjacent() {
        let iter = VisitorIterator::new(&Selection::FullRange, 1, None).unwrap();
        let item = iter.get_next().unwrap();
        iter.update(item.superbucket, BucketProgress::NotStarted);

        iter.split_pending_bucket(item.superbucket).unwrap();
        let pending = iter.pending_snapshot();
        assert_eq!(pending.len(), 2);
        let (lo, hi) = item.superbucket.split();
        assert_eq!(pending[0].0, lo);
        assert_eq!(pending[1].0, hi);

        // Key order puts both halves before the other depth-1 bucket.
        let mut handed = Vec::new();
        while let Some(it) = iter.get_next() {
            handed.push(it.superbucket);
            iter.update(it.superbucket, BucketProgress::Finished);
        }
        let keys: Vec<BucketKey> = handed.iter().map(|b| BucketKey::from_bucket(*b)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(iter.is_done());
    }

    #[test]
    fn resume_from_mid_split_checkpoint() {
        let iter = VisitorIterator::new(&Selection::FullRange, 2, None).unwrap();
        let item = iter.get_next().unwrap();
        iter.update(item.superbucket, BucketProgress::NotStarted);
        iter.split_pending_bucket(item.superbucket).unwrap();

        // The checkpoint taken mid-split parses and resumes.
        let token = ProgressToken::from_text(&iter.checkpoint_text()).unwrap();
        let resumed = VisitorIterator::new(&Selection::FullRange, 2, Some(token)).unwrap();

        let visited = drain(&resumed);
        assert_eq!(visited.len(), 5);
        let (lo, hi) = item.superbucket.split();
        assert!(visited.contains(&lo));
        assert!(visited.contains(&hi));
        assert!(resumed.is_done());
        assert_eq!(resumed.percent_finished(), 100.0);
    }

    #[test]
    fn explicit_resume_tolerates_split_halves() {
        let ids = vec![5u64, 6, 7];
        let iter = VisitorIterator::new(&Selection::Explicit(ids.clone()), 16, None).unwrap();
        let item = iter.get_next().unwrap();
        iter.update(item.superbucket, BucketProgress::NotStarted);
        iter.split_pending_bucket(item.superbucket).unwrap();

        let token = iter.checkpoint();
        let resumed = VisitorIterator::new(&Selection::Explicit(ids), 16, Some(token)).unwrap();
        assert_eq!(drain(&resumed).len(), 4);
        assert!(resumed.is_done());
    }

    #[test]
    fn shared_across_threads() {
        use std::sync::Arc;

        let iter = Arc::new(VisitorIterator::new(&Selection::FullRange, 6, None).unwrap());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let iter = Arc::clone(&iter);
            handles.push(std::thread::spawn(move || {
                let mut visited = 0u64;
                while let Some(item) = iter.get_next() {
                    iter.update(item.superbucket, BucketProgress::Finished);
                    visited += 1;
                }
                visited
            }));
        }
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 64);
        assert!(iter.is_done());
    }
}
