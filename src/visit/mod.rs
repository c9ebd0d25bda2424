//! Visit orchestration: selections, bucket sources, and the iterator.

pub mod iterator;
pub mod selection;
pub mod source;

pub use iterator::{VisitorIterator, VisitorWorkItem};
pub use selection::Selection;
pub use source::{BucketSource, ExplicitSource, RangeSource, EXPLICIT_BUCKET_BITS};
