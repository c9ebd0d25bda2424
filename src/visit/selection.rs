//! Document-selection classification input.
//!
//! The selection parser is an external collaborator; the core only consumes
//! its verdict: either the selection covers the full keyspace, or it
//! reduces to a finite set of literal identifiers. Identifiers are opaque
//! 64-bit values; the core hashes them to buckets and never interprets
//! them.

/// Classification of a document selection, as produced by the external
/// selection parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    /// The selection cannot be reduced to a literal identifier set (for
    /// example, predicates over non-identifier fields). Every bucket of
    /// the keyspace must be visited.
    FullRange,
    /// The selection reduces to these literal identifiers; only their
    /// buckets need visiting.
    Explicit(Vec<u64>),
}

impl Selection {
    /// True if the selection names an explicit identifier set.
    #[inline]
    pub fn is_explicit(&self) -> bool {
        matches!(self, Selection::Explicit(_))
    }
}
