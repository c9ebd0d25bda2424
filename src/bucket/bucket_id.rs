//! Bucket identifiers over the binary keyspace trie.
//!
//! A `BucketId` names one node of the binary trie that partitions the
//! keyspace: `used_bits` selects the trie depth, and the low `used_bits`
//! bits of `raw` select the node at that depth. Depth 0 is the whole
//! keyspace; each extra bit halves a bucket into two children.
//!
//! # Invariants
//!
//! - `used_bits <= MAX_USED_BITS` (58). The remaining 6 bits of the packed
//!   word carry the depth, so deeper nodes are not representable.
//! - Bits of `raw` at positions `>= used_bits` are always zero. Constructors
//!   mask them away.
//!
//! # Packed format
//!
//! ```text
//! packed u64:
//!   [63..58] used_bits (6 bits) || [57..0] raw (used portion, low-aligned)
//! ```
//!
//! The packed form is the wire representation used inside progress tokens;
//! a packed value of zero is the conventional NULL marker ("not started").

use crate::stdx::bits::low_mask;

/// Maximum trie depth a `BucketId` can express.
///
/// 6 bits of the packed word are reserved for the depth itself, leaving 58
/// for the id bits.
pub const MAX_USED_BITS: u8 = 58;

const PACKED_BITS_SHIFT: u32 = 58;

/// Immutable address of a binary-trie node over the keyspace.
///
/// `Copy` and 16 bytes; cheap to pass around and store in maps. Ordering of
/// bucket ids for enumeration purposes goes through [`BucketKey`], not
/// through `BucketId` itself.
///
/// [`BucketKey`]: super::BucketKey
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BucketId {
    used_bits: u8,
    raw: u64,
}

impl BucketId {
    /// The root bucket covering the entire keyspace.
    pub const ROOT: BucketId = BucketId {
        used_bits: 0,
        raw: 0,
    };

    /// Creates a bucket id at depth `used_bits` with the given id bits.
    ///
    /// Bits of `raw` at positions `>= used_bits` are masked away.
    ///
    /// # Panics
    ///
    /// Panics if `used_bits > MAX_USED_BITS`.
    pub fn new(used_bits: u8, raw: u64) -> Self {
        assert!(
            used_bits <= MAX_USED_BITS,
            "used_bits {used_bits} exceeds max {MAX_USED_BITS}"
        );
        Self {
            used_bits,
            raw: raw & low_mask(used_bits as u32),
        }
    }

    /// Trie depth of this bucket.
    #[inline]
    pub fn used_bits(&self) -> u8 {
        self.used_bits
    }

    /// Significant id bits (low `used_bits` bits; higher bits are zero).
    #[inline]
    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// Enumeration key of this bucket. See [`BucketKey`] for the ordering
    /// guarantees.
    ///
    /// [`BucketKey`]: super::BucketKey
    #[inline]
    pub fn key(&self) -> super::BucketKey {
        super::BucketKey::from_bucket(*self)
    }

    /// Packed wire form: depth in the top 6 bits, id bits below.
    #[inline]
    pub fn packed(&self) -> u64 {
        ((self.used_bits as u64) << PACKED_BITS_SHIFT) | self.raw
    }

    /// Decodes a packed wire value.
    ///
    /// Returns `None` if the depth field exceeds [`MAX_USED_BITS`] or if id
    /// bits beyond the depth are set.
    pub fn from_packed(packed: u64) -> Option<Self> {
        let used_bits = (packed >> PACKED_BITS_SHIFT) as u8;
        if used_bits > MAX_USED_BITS {
            return None;
        }
        let raw = packed & low_mask(PACKED_BITS_SHIFT);
        if raw & !low_mask(used_bits as u32) != 0 {
            return None;
        }
        Some(Self { used_bits, raw })
    }

    /// Splits this bucket into its two children.
    ///
    /// The first child keeps the parent's id bits; the second sets the new
    /// high bit. Both are one level deeper.
    ///
    /// # Panics
    ///
    /// Panics if the bucket is already at [`MAX_USED_BITS`].
    pub fn split(&self) -> (BucketId, BucketId) {
        assert!(
            self.used_bits < MAX_USED_BITS,
            "cannot split bucket at max depth {MAX_USED_BITS}"
        );
        let child_bits = self.used_bits + 1;
        (
            BucketId {
                used_bits: child_bits,
                raw: self.raw,
            },
            BucketId {
                used_bits: child_bits,
                raw: self.raw | (1u64 << self.used_bits),
            },
        )
    }

    /// The sibling sharing this bucket's parent.
    ///
    /// # Panics
    ///
    /// Panics if called on the root bucket, which has no sibling.
    pub fn sibling(&self) -> BucketId {
        assert!(self.used_bits > 0, "root bucket has no sibling");
        BucketId {
            used_bits: self.used_bits,
            raw: self.raw ^ (1u64 << (self.used_bits - 1)),
        }
    }

    /// True if `other` is this bucket's exact sibling: equal depth, ids
    /// differing only in the deepest bit.
    #[inline]
    pub fn is_sibling_of(&self, other: &BucketId) -> bool {
        self.used_bits == other.used_bits
            && self.used_bits > 0
            && (self.raw ^ other.raw) == (1u64 << (self.used_bits - 1))
    }

    /// Merges this bucket with its sibling, yielding the parent.
    ///
    /// # Panics
    ///
    /// Panics if called on the root bucket.
    pub fn join(&self) -> BucketId {
        assert!(self.used_bits > 0, "root bucket has no parent");
        let parent_bits = self.used_bits - 1;
        BucketId {
            used_bits: parent_bits,
            raw: self.raw & low_mask(parent_bits as u32),
        }
    }

    /// The ancestor of this bucket at depth `bits`.
    ///
    /// # Panics
    ///
    /// Panics if `bits > self.used_bits()` (there is no such ancestor).
    pub fn truncated(&self, bits: u8) -> BucketId {
        assert!(
            bits <= self.used_bits,
            "cannot truncate depth {} to deeper {}",
            self.used_bits,
            bits
        );
        BucketId {
            used_bits: bits,
            raw: self.raw & low_mask(bits as u32),
        }
    }

    /// True if `finer` lies inside this bucket's sub-space (including the
    /// bucket itself).
    #[inline]
    pub fn contains(&self, finer: &BucketId) -> bool {
        finer.used_bits >= self.used_bits
            && (finer.raw & low_mask(self.used_bits as u32)) == self.raw
    }
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BucketId(0x{:016x})", self.packed())
    }
}
