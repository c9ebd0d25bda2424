//! Error types for progress bookkeeping and token import.
//!
//! Errors are stage-specific to keep diagnostics precise: parsing a
//! serialized token, resharding a pending bucket, and importing a token
//! against a document selection fail in unrelated ways and are reported by
//! separate enums. All enums are `#[non_exhaustive]` so variants can be
//! added without breaking callers; consumers should include a fallback
//! match arm.

use std::fmt;

use crate::bucket::BucketId;

/// Errors from parsing a serialized progress token (text or binary).
///
/// All of these indicate structurally invalid input; none are recoverable
/// and no partial token is produced.
#[derive(Debug)]
#[non_exhaustive]
pub enum ProgressFileError {
    /// The first line is not a progress-file header.
    BadHeader,
    /// Fewer lines than the four mandatory counter fields.
    MissingField { field: &'static str },
    /// A counter line did not parse as an unsigned decimal.
    BadCounter { field: &'static str },
    /// A pending entry line is not `hex:hex`.
    BadEntry { line: usize },
    /// A pending entry carried a malformed key or progress value.
    BadBucket { line: usize },
    /// Counters contradict each other (e.g. finished + pending > total).
    InconsistentCounters { detail: &'static str },
    /// The distribution bit count exceeds the representable maximum.
    BitCountOutOfRange { bits: u32 },
    /// Binary input does not start with the expected magic.
    BadMagic,
    /// Binary input has an unsupported version byte.
    UnsupportedVersion { version: u8 },
    /// Binary input ended before the declared content.
    Truncated { expected: usize, found: usize },
    /// Binary input has bytes past the declared content.
    TrailingBytes { count: usize },
}

impl fmt::Display for ProgressFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadHeader => write!(f, "malformed progress file: bad header line"),
            Self::MissingField { field } => {
                write!(f, "malformed progress file: missing field {field}")
            }
            Self::BadCounter { field } => {
                write!(f, "malformed progress file: unparsable counter {field}")
            }
            Self::BadEntry { line } => {
                write!(f, "malformed progress file: bad entry at line {line}")
            }
            Self::BadBucket { line } => {
                write!(f, "malformed progress file: invalid bucket at line {line}")
            }
            Self::InconsistentCounters { detail } => {
                write!(f, "malformed progress file: {detail}")
            }
            Self::BitCountOutOfRange { bits } => {
                write!(f, "malformed progress file: bit count {bits} out of range")
            }
            Self::BadMagic => write!(f, "malformed progress blob: bad magic"),
            Self::UnsupportedVersion { version } => {
                write!(f, "malformed progress blob: unsupported version {version}")
            }
            Self::Truncated { expected, found } => {
                write!(
                    f,
                    "malformed progress blob: truncated ({found} of {expected} bytes)"
                )
            }
            Self::TrailingBytes { count } => {
                write!(f, "malformed progress blob: {count} trailing bytes")
            }
        }
    }
}

impl std::error::Error for ProgressFileError {}

/// Errors from manually splitting a pending bucket.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum BucketSplitError {
    /// The bucket is not a pending entry of the token.
    NotPending { bucket: BucketId },
    /// The bucket is already at the maximum resolution.
    MaxResolution { bucket: BucketId },
}

impl fmt::Display for BucketSplitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPending { bucket } => write!(f, "cannot split {bucket}: not pending"),
            Self::MaxResolution { bucket } => {
                write!(f, "cannot split {bucket}: already at max resolution")
            }
        }
    }
}

impl std::error::Error for BucketSplitError {}

/// Errors from manually merging a pending bucket with its sibling.
///
/// No state is mutated when any of these are returned.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum BucketMergeError {
    /// The root bucket has no sibling to merge with.
    RootBucket,
    /// Merging would produce a bucket coarser than the current partition
    /// resolution; merge only undoes a prior manual split.
    AtSuperbucketResolution { bucket: BucketId },
    /// The named bucket is not a pending entry of the token.
    NotPending { bucket: BucketId },
    /// The exact sibling is not a pending entry (it may be finished,
    /// active, or split to a finer resolution).
    NotSiblings { bucket: BucketId, sibling: BucketId },
    /// Both entries are pending but at different progress markers.
    ProgressMismatch { bucket: BucketId, sibling: BucketId },
}

impl fmt::Display for BucketMergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RootBucket => write!(f, "cannot merge the root bucket"),
            Self::AtSuperbucketResolution { bucket } => {
                write!(f, "cannot merge {bucket}: already at partition resolution")
            }
            Self::NotPending { bucket } => write!(f, "cannot merge {bucket}: not pending"),
            Self::NotSiblings { bucket, sibling } => {
                write!(f, "cannot merge {bucket}: sibling {sibling} is not pending")
            }
            Self::ProgressMismatch { bucket, sibling } => {
                write!(
                    f,
                    "cannot merge {bucket} with {sibling}: progress markers differ"
                )
            }
        }
    }
}

impl std::error::Error for BucketMergeError {}

/// Errors from constructing an iterator against a resumed token.
///
/// Surfaced at construction time; the token is rejected whole.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ImportError {
    /// The token's bucket universe does not match the document selection it
    /// is being resumed against (e.g. an explicit 3-literal selection given
    /// a full-range token, or vice versa).
    InconsistentProgressSource { expected_total: u64, token_total: u64 },
    /// The token's cursor points past its bucket universe.
    CursorOutOfRange { cursor: u64, total: u64 },
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InconsistentProgressSource {
                expected_total,
                token_total,
            } => write!(
                f,
                "inconsistent progress source: selection implies {expected_total} buckets, \
                 token has {token_total}"
            ),
            Self::CursorOutOfRange { cursor, total } => {
                write!(
                    f,
                    "inconsistent progress source: cursor {cursor} exceeds total {total}"
                )
            }
        }
    }
}

impl std::error::Error for ImportError {}
