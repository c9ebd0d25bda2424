//! Resumable progress tracking for bucket-space visits.

pub mod binary_format;
pub mod errors;
pub mod text_format;
pub mod token;

pub use binary_format::{BINARY_MAGIC, BINARY_VERSION};
pub use errors::{BucketMergeError, BucketSplitError, ImportError, ProgressFileError};
pub use text_format::TEXT_HEADER;
pub use token::{progress_fraction, BucketProgress, ProgressToken};
