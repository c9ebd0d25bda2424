//! Human-inspectable text serialization of progress tokens.
//!
//! This is the durable on-disk/over-the-wire representation. The layout is
//! fixed; readers of every version must keep accepting it.
//!
//! # File format
//!
//! ```text
//! VDS bucket progress file (42.5% completed)   <- header; legacy writers
//! 16                                              omit the parenthetical
//! 1024                                         <- bucket cursor
//! 960                                          <- finished bucket count
//! 65536                                        <- total bucket count
//! 14:0                                         <- pending entries,
//! 8000000000000011:4400000000000011               hex(key):hex(progress),
//! ...                                             ascending key order
//! ```
//!
//! The second line is the distribution bit count. A progress value of zero
//! is the not-started marker; finished buckets never appear as entries.
//! Active buckets are folded back into the entry list at their last-known
//! progress, so a serialized token never records active state.
//!
//! Parsing is strict about structure (line counts, decimal counters, hex
//! entries) and tolerant about the legacy header and CRLF line endings.

use std::collections::BTreeMap;

use crate::bucket::BucketKey;

use super::errors::ProgressFileError;
use super::token::{BucketProgress, ProgressToken};

/// Leading header text every progress file starts with.
pub const TEXT_HEADER: &str = "VDS bucket progress file";

impl ProgressToken {
    /// Serializes the token to the text format, active buckets folded into
    /// the pending list.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(TEXT_HEADER);
        out.push_str(&format!(" ({}% completed)\n", self.percent_finished()));
        out.push_str(&format!("{}\n", self.distribution_bit_count()));
        out.push_str(&format!("{}\n", self.bucket_cursor()));
        out.push_str(&format!("{}\n", self.finished_bucket_count()));
        out.push_str(&format!("{}\n", self.total_bucket_count()));
        for (key, progress) in self.folded_pending() {
            out.push_str(&format!("{:x}:{:x}\n", key.value(), progress.packed()));
        }
        out
    }

    /// Parses a token from the text format.
    ///
    /// Rejects structurally malformed input; never produces a partial
    /// token.
    pub fn from_text(input: &str) -> Result<Self, ProgressFileError> {
        let mut lines = input.lines().map(|line| line.trim_end_matches('\r'));

        let header = lines.next().ok_or(ProgressFileError::MissingField {
            field: "header",
        })?;
        if !header.starts_with(TEXT_HEADER) {
            return Err(ProgressFileError::BadHeader);
        }

        let distribution_bits: u32 = parse_counter(lines.next(), "distribution bit count")?;
        let bucket_cursor: u64 = parse_counter(lines.next(), "bucket cursor")?;
        let finished_buckets: u64 = parse_counter(lines.next(), "finished bucket count")?;
        let total_buckets: u64 = parse_counter(lines.next(), "total bucket count")?;

        let mut pending = BTreeMap::new();
        // Entry lines start after the header and four counters.
        for (offset, line) in lines.enumerate() {
            let line_no = offset + 6;
            if line.is_empty() {
                continue;
            }
            let (key_hex, progress_hex) = line
                .split_once(':')
                .ok_or(ProgressFileError::BadEntry { line: line_no })?;
            let key_value = u64::from_str_radix(key_hex, 16)
                .map_err(|_| ProgressFileError::BadEntry { line: line_no })?;
            let progress_value = u64::from_str_radix(progress_hex, 16)
                .map_err(|_| ProgressFileError::BadEntry { line: line_no })?;
            let bucket = BucketKey::decode_checked(key_value)
                .ok_or(ProgressFileError::BadBucket { line: line_no })?;
            let progress = BucketProgress::from_packed(progress_value)
                .ok_or(ProgressFileError::BadBucket { line: line_no })?;
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

fn parse_counter<T: std::str::FromStr>(
    line: Option<&str>,
    field: &'static str,
) -> Result<T, ProgressFileError> {
    let line = line.ok_or(ProgressFileError::MissingField { field })?;
    line.trim()
        .parse()
        .map_err(|_| ProgressFileError::BadCounter { field })
}
