//! Properties of the bit-reversed bucket-key order.
//!
//! The key order is the visit order: enumeration must be a bijection at
//! every resolution, sibling subtrees must interleave, and refining a
//! bucket must never reorder it relative to others.

use proptest::prelude::*;

use bucketscan_rs::{BucketId, BucketKey};

fn bucket_strategy() -> impl Strategy<Value = BucketId> {
    (1u8..=16, any::<u64>()).prop_map(|(bits, raw)| BucketId::new(bits, raw))
}

proptest! {
    /// `nth` and `enumeration_index` are inverse at every resolution.
    #[test]
    fn enumeration_is_a_bijection(bits in 1u32..=12, n in any::<u64>()) {
        let n = n & ((1u64 << bits) - 1);
        let key = BucketKey::nth(n, bits);
        prop_assert_eq!(key.enumeration_index(bits), n);
        let bucket = key.to_bucket_id();
        prop_assert_eq!(bucket.used_bits() as u32, bits);
        prop_assert_eq!(BucketKey::from_bucket(bucket), key);
    }

    /// Key and bucket id encode the same (depth, raw) pair.
    #[test]
    fn key_round_trips_through_bucket_id(bucket in bucket_strategy()) {
        let key = BucketKey::from_bucket(bucket);
        prop_assert_eq!(key.to_bucket_id(), bucket);
        prop_assert_eq!(BucketKey::decode_checked(key.value()), Some(bucket));
    }

    /// Splitting a bucket keeps both children inside the parent's key
    /// span: after any other same-depth bucket's key, the children still
    /// compare the same way the parent did.
    #[test]
    fn refinement_preserves_relative_order(
        bits in 1u8..=15,
        raw_a in any::<u64>(),
        raw_b in any::<u64>(),
    ) {
        let a = BucketId::new(bits, raw_a);
        let b = BucketId::new(bits, raw_b);
        prop_assume!(a != b);
        let (a0, a1) = a.split();
        let cmp = BucketKey::from_bucket(a).cmp(&BucketKey::from_bucket(b));
        prop_assert_eq!(BucketKey::from_bucket(a0).cmp(&BucketKey::from_bucket(b)), cmp);
        prop_assert_eq!(BucketKey::from_bucket(a1).cmp(&BucketKey::from_bucket(b)), cmp);
    }

    /// A parent's key is a lower bound for its whole subtree.
    #[test]
    fn children_sort_after_parent(bucket in bucket_strategy()) {
        prop_assume!(bucket.used_bits() < 16);
        let (c0, c1) = bucket.split();
        let parent = BucketKey::from_bucket(bucket);
        prop_assert!(parent < BucketKey::from_bucket(c0));
        prop_assert!(BucketKey::from_bucket(c0) < BucketKey::from_bucket(c1));
    }
}

/// Exhaustive check of the visiting order at a small resolution.
#[test]
fn three_bit_order_is_bit_reversed() {
    let raws: Vec<u64> = (0..8)
        .map(|n| BucketKey::nth(n, 3).to_bucket_id().raw())
        .collect();
    assert_eq!(raws, vec![0, 4, 2, 6, 1, 5, 3, 7]);
}
