//! Compact binary serialization of progress tokens.
//!
//! Field-for-field equivalent to the text format, for transport inside
//! control messages where the human-readable form is wasteful.
//!
//! # Blob format
//!
//! ```text
//! "VDSP" (4B)  || version u8 ||
//! distribution_bit_count u32be || bucket_cursor u64be ||
//! finished_bucket_count u64be || total_bucket_count u64be ||
//! entry_count u64be || entry_count x (key u64be || progress u64be)
//! ```
//!
//! Big-endian throughout so entry bytes sort the same way the keys do. The
//! magic keeps foreign blobs from being misinterpreted as truncated tokens;
//! the version byte allows layout evolution without ambiguity.

use std::collections::BTreeMap;

use crate::bucket::BucketKey;

use super::errors::ProgressFileError;
use super::token::{BucketProgress, ProgressToken};

/// Magic prefix of every binary progress blob.
pub const BINARY_MAGIC: [u8; 4] = *b"VDSP";

/// Current blob layout version.
pub const BINARY_VERSION: u8 = 1;

const FIXED_HEADER_LEN: usize = 4 + 1 + 4 + 8 + 8 + 8 + 8;
const ENTRY_LEN: usize = 16;

impl ProgressToken {
    /// Serializes the token to the binary format, active buckets folded
    /// into the entry list.
    pub fn to_bytes(&self) -> Vec<u8> {
        let folded = self.folded_pending();
        let mut out = Vec::with_capacity(FIXED_HEADER_LEN + folded.len() * ENTRY_LEN);
        out.extend_from_slice(&BINARY_MAGIC);
        out.push(BINARY_VERSION);
        out.extend_from_slice(&self.distribution_bit_count().to_be_bytes());
        out.extend_from_slice(&self.bucket_cursor().to_be_bytes());
        out.extend_from_slice(&self.finished_bucket_count().to_be_bytes());
        out.extend_from_slice(&self.total_bucket_count().to_be_bytes());
        out.extend_from_slice(&(folded.len() as u64).to_be_bytes());
        for (key, progress) in folded {
            out.extend_from_slice(&key.value().to_be_bytes());
            out.extend_from_slice(&progress.packed().to_be_bytes());
        }
        out
    }

    /// Parses a token from the binary format.
    pub fn from_bytes(input: &[u8]) -> Result<Self, ProgressFileError> {
        if input.len() < 4 {
            return Err(ProgressFileError::Truncated {
                expected: FIXED_HEADER_LEN,
                found: input.len(),
            });
        }
        if input[..4] != BINARY_MAGIC {
            return Err(ProgressFileError::BadMagic);
        }
        if input.len() < FIXED_HEADER_LEN {
            return Err(ProgressFileError::Truncated {
                expected: FIXED_HEADER_LEN,
                found: input.len(),
            });
        }
        let version = input[4];
        if version != BINARY_VERSION {
            return Err(ProgressFileError::UnsupportedVersion { version });
        }

        let mut cursor = Cursor {
            buf: input,
            pos: 5,
        };
        let distribution_bits = cursor.read_u32();
        let bucket_cursor = cursor.read_u64();
        let finished_buckets = cursor.read_u64();
        let total_buckets = cursor.read_u64();
        let entry_count = cursor.read_u64();

        let body_len = (entry_count as usize)
            .checked_mul(ENTRY_LEN)
            .and_then(|body| body.checked_add(FIXED_HEADER_LEN))
            .ok_or(ProgressFileError::Truncated {
                expected: usize::MAX,
                found: input.len(),
            })?;
        if input.len() < body_len {
            return Err(ProgressFileError::Truncated {
                expected: body_len,
                found: input.len(),
            });
        }
        if input.len() > body_len {
            return Err(ProgressFileError::TrailingBytes {
                count: input.len() - body_len,
            });
        }

        let mut pending = BTreeMap::new();
        for n in 0..entry_count {
            let key_value = cursor.read_u64();
            let progress_value = cursor.read_u64();
            let line = n as usize + 1;
            let bucket = BucketKey::decode_checked(key_value)
                .ok_or(ProgressFileError::BadBucket { line })?;
            let progress = BucketProgress::from_packed(progress_value)
                .ok_or(ProgressFileError::BadBucket { line })?;
            if pending.insert(bucket.key(), progress).is_some() {
                return Err(ProgressFileError::InconsistentCounters {
                    detail: "duplicate pending entry",
                });
            }
        }

        ProgressToken::validated_from_parts(
            distribution_bits,
            bucket_cursor,
            finished_buckets,
            total_buckets,
            pending,
        )
    }
}

/// Bounds-checked big-endian reader over a validated slice.
///
/// Callers verify the total length up front; reads never run past it.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn read_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        u32::from_be_bytes(bytes)
    }

    fn read_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        u64::from_be_bytes(bytes)
    }
}
