//! Enumeration keys: a total order over bucket ids.
//!
//! Purpose: order superbuckets so that refining the partition (raising the
//! distribution bit count) never reorders the buckets already enumerated:
//! each bucket is simply followed by its new sibling. This is what makes a
//! resolution change a local doubling instead of a global resort.
//!
//! # Key format
//!
//! ```text
//! key u64:
//!   [63 .. 64-used_bits]  id bits of the bucket, bit-reversed
//!   [63-used_bits .. 6]   zero
//!   [5 .. 0]              used_bits
//! ```
//!
//! Reversing the id bits makes the *shallow* trie bits the most significant
//! comparison bits: all descendants of a bucket sort into one contiguous key
//! range directly after the bucket itself. The depth tag in the low 6 bits
//! never collides with the reversed id (at most 58 bits, all at the top) and
//! makes decoding total: a key alone recovers its `(used_bits, raw)` pair.
//!
//! # Ordering invariant
//!
//! Enumerating all buckets at depth `n` in ascending key order and then
//! re-enumerating at depth `n + 1` yields the original buckets in the same
//! relative order, each immediately followed by its new sibling. For `n = 3`
//! the raw-id visiting order is `[0, 4, 2, 6, 1, 5, 3, 7]`.

use super::bucket_id::{BucketId, MAX_USED_BITS};
use crate::stdx::bits::low_mask;

const DEPTH_TAG_BITS: u32 = 6;
const DEPTH_TAG_MASK: u64 = (1 << DEPTH_TAG_BITS) - 1;

/// Total enumeration order over [`BucketId`] values.
///
/// Compares as a plain unsigned 64-bit integer. Construction is injective:
/// distinct bucket ids (including an ancestor and its first child, which
/// share id bits) map to distinct keys because the depth tag participates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey(u64);

impl BucketKey {
    /// Key of the given bucket.
    #[inline]
    pub fn from_bucket(bucket: BucketId) -> Self {
        // `raw` only has low `used_bits` bits set, so the full-word reversal
        // left-justifies exactly the used portion.
        BucketKey(bucket.raw().reverse_bits() | bucket.used_bits() as u64)
    }

    /// Key of the `n`-th bucket, in enumeration order, of the `2^bits`
    /// partition, without materializing the sequence.
    ///
    /// Keys are strictly increasing in `n`.
    ///
    /// # Panics
    ///
    /// Panics if `bits > MAX_USED_BITS` or `n >= 2^bits`.
    pub fn nth(n: u64, bits: u32) -> Self {
        assert!(
            bits <= MAX_USED_BITS as u32,
            "bits {bits} exceeds max {MAX_USED_BITS}"
        );
        assert!(
            bits == 64 || n < (1u64 << bits),
            "bucket index {n} out of range for {bits} bits"
        );
        if bits == 0 {
            return BucketKey(0);
        }
        BucketKey((n << (64 - bits)) | bits as u64)
    }

    /// Decodes the key back into its bucket id.
    ///
    /// Total for keys produced by [`BucketKey::from_bucket`] or
    /// [`BucketKey::nth`]. For foreign values use
    /// [`BucketKey::decode_checked`].
    #[inline]
    pub fn to_bucket_id(&self) -> BucketId {
        debug_assert!(Self::decode_checked(self.0).is_some(), "malformed key");
        let used_bits = (self.0 & DEPTH_TAG_MASK) as u8;
        BucketId::new(used_bits, (self.0 & !DEPTH_TAG_MASK).reverse_bits())
    }

    /// Validating decode for keys read from external input.
    ///
    /// Returns `None` if the depth tag exceeds [`MAX_USED_BITS`] or if id
    /// bits are set beyond the declared depth.
    pub fn decode_checked(value: u64) -> Option<BucketId> {
        let used_bits = (value & DEPTH_TAG_MASK) as u8;
        if used_bits > MAX_USED_BITS {
            return None;
        }
        let raw = (value & !DEPTH_TAG_MASK).reverse_bits();
        if raw & !low_mask(used_bits as u32) != 0 {
            return None;
        }
        Some(BucketId::new(used_bits, raw))
    }

    /// Enumeration index of this key's bucket within the `2^bits` partition.
    ///
    /// Only meaningful when the bucket's depth is at least `bits` (the
    /// index of its depth-`bits` ancestor is returned).
    #[inline]
    pub fn enumeration_index(&self, bits: u32) -> u64 {
        if bits == 0 {
            return 0;
        }
        self.0 >> (64 - bits)
    }

    /// Raw key value (for serialization).
    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BucketKey(0x{:016x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_bit_visiting_order() {
        let order: Vec<u64> = (0..8)
            .map(|n| BucketKey::nth(n, 3).to_bucket_id().raw())
            .collect();
        assert_eq!(order, vec![0, 4, 2, 6, 1, 5, 3, 7]);
    }

    #[test]
    fn nth_keys_strictly_increase() {
        for bits in [1u32, 2, 3, 8, 13] {
            let mut prev = None;
            for n in 0..(1u64 << bits) {
                let key = BucketKey::nth(n, bits);
                if let Some(p) = prev {
                    assert!(key > p, "keys must increase at bits={bits}, n={n}");
                }
                prev = Some(key);
            }
        }
    }

    #[test]
    fn nth_round_trips_through_bucket_id() {
        for bits in [0u32, 1, 4, 11] {
            for n in 0..(1u64 << bits) {
                let key = BucketKey::nth(n, bits);
                let bucket = key.to_bucket_id();
                assert_eq!(bucket.used_bits() as u32, bits);
                assert_eq!(bucket.key(), key);
                assert_eq!(key.enumeration_index(bits), n);
            }
        }
    }

    #[test]
    fn refinement_preserves_relative_order() {
        // Each depth-n bucket is immediately followed by its new sibling
        // when re-enumerated at depth n+1.
        for bits in [1u32, 3, 6] {
            for n in 0..(1u64 << bits) {
                let parent = BucketKey::nth(n, bits).to_bucket_id();
                let (c0, c1) = parent.split();
                assert_eq!(BucketKey::nth(2 * n, bits + 1).to_bucket_id(), c0);
                assert_eq!(BucketKey::nth(2 * n + 1, bits + 1).to_bucket_id(), c1);
            }
        }
    }

    #[test]
    fn parent_sorts_directly_before_first_child() {
        let parent = BucketId::new(4, 0b0110);
        let (c0, c1) = parent.split();
        assert!(parent.key() < c0.key());
        assert!(c0.key() < c1.key());
    }

    #[test]
    fn decode_checked_rejects_stray_bits() {
        // Depth tag of 2 but a third reversed id bit set.
        let bad = (0b111u64 << 61) | 2;
        assert_eq!(BucketKey::decode_checked(bad), None);
        // Depth tag beyond the maximum.
        assert_eq!(BucketKey::decode_checked(63), None);
    }

    #[test]
    fn decode_checked_accepts_valid_keys() {
        for b in [
            BucketId::ROOT,
            BucketId::new(2, 0b10),
            BucketId::new(32, 0xdead_beef),
        ] {
            assert_eq!(BucketKey::decode_checked(b.key().value()), Some(b));
        }
    }

    #[test]
    fn enumeration_index_of_descendants_matches_ancestor() {
        let parent = BucketKey::nth(5, 4).to_bucket_id();
        let (c0, c1) = parent.split();
        assert_eq!(c0.key().enumeration_index(4), 5);
        assert_eq!(c1.key().enumeration_index(4), 5);
    }
}
