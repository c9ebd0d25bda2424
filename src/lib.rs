//! Resumable iteration over a partitioned bucket space.
//!
//! ## Scope
//! This crate orchestrates visits over a keyspace partitioned into a binary
//! trie of buckets. A shared [`VisitorIterator`] hands superbuckets to
//! concurrent workers, collects their progress reports, and survives
//! restarts by checkpointing a compact [`ProgressToken`].
//!
//! ## Key invariants
//! - Superbuckets are handed out in bucket-key order: raw id bits reversed,
//!   so sibling subtrees interleave fairly across the keyspace.
//! - A handed-out bucket is active until its worker reports; reports for
//!   non-active buckets are ignored, so restarts cannot corrupt counters.
//! - For every enumeration index below the hand-out cursor, the bucket is
//!   finished, pending, or active. Nothing below the cursor is ever lost.
//! - Resolution changes rescale progress, never discard it. With workers
//!   outstanding the change parks and hand-outs stop until they drain.
//!
//! ## Visit flow
//! 1) Classify the document selection: full range or explicit identifiers.
//! 2) Build the bucket source (`2^bits` range, or hashed superbuckets).
//! 3) Workers pull from [`VisitorIterator::get_next`], visit, and report
//!    through [`VisitorIterator::update`].
//! 4) Checkpoint at any time; resume by feeding the token back in.
//!
//! ## Notable entry points
//! - [`VisitorIterator`] / [`Selection`]: orchestration.
//! - [`ProgressToken`]: persisted state, text and binary wire formats.
//! - [`BucketId`] / [`BucketKey`]: trie addressing and visit order.

pub mod bucket;
pub mod progress;
#[cfg(any(test, feature = "sim-harness"))]
pub mod sim;
pub mod stdx;
pub mod visit;

pub use bucket::{BucketId, BucketKey, MAX_USED_BITS};
pub use progress::{
    BucketMergeError, BucketProgress, BucketSplitError, ImportError, ProgressFileError,
    ProgressToken,
};
pub use visit::{Selection, VisitorIterator, VisitorWorkItem};
