//! Bucket addressing over the binary keyspace trie.

pub mod bucket_id;
pub mod bucket_key;

pub use bucket_id::{BucketId, MAX_USED_BITS};
pub use bucket_key::BucketKey;
