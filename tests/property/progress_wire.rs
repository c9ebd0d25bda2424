//! Wire-format round-trip properties for progress tokens.
//!
//! Tokens are produced the way real ones are: by driving a visitor with a
//! random mix of hand-outs, reports, and splits, then checkpointing.

use proptest::prelude::*;

use bucketscan_rs::{
    BucketId, BucketProgress, ProgressToken, Selection, VisitorIterator, VisitorWorkItem,
};

#[derive(Clone, Debug)]
enum Op {
    Pull,
    Finish(usize),
    Partial(usize, u8),
    Park(usize),
    Split,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Pull),
        2 => any::<usize>().prop_map(Op::Finish),
        2 => (any::<usize>(), 1u8..=3).prop_map(|(i, d)| Op::Partial(i, d)),
        1 => any::<usize>().prop_map(Op::Park),
        1 => Just(Op::Split),
    ]
}

/// Applies ops to a fresh visitor and returns its checkpoint.
fn walk(bits: u32, ops: &[Op]) -> ProgressToken {
    let iter = VisitorIterator::new(&Selection::FullRange, bits, None).unwrap();
    let mut held: Vec<VisitorWorkItem> = Vec::new();
    for op in ops {
        match op {
            Op::Pull => {
                if let Some(item) = iter.get_next() {
                    held.push(item);
                }
            }
            Op::Finish(i) => {
                if !held.is_empty() {
                    let item = held.swap_remove(i % held.len());
                    iter.update(item.superbucket, BucketProgress::Finished);
                }
            }
            Op::Partial(i, depth) => {
                if !held.is_empty() {
                    let item = held.swap_remove(i % held.len());
                    let sup = item.superbucket;
                    let mark = BucketId::new(
                        sup.used_bits() + depth,
                        sup.raw() | (1u64 << sup.used_bits()),
                    );
                    iter.update(sup, BucketProgress::At(mark));
                }
            }
            Op::Park(i) => {
                if !held.is_empty() {
                    let item = held.swap_remove(i % held.len());
                    iter.update(item.superbucket, BucketProgress::NotStarted);
                }
            }
            Op::Split => {
                if let Some((bucket, _)) = iter.pending_snapshot().first().copied() {
                    if bucket.used_bits() < 20 {
                        let _ = iter.split_pending_bucket(bucket);
                    }
                }
            }
        }
    }
    iter.checkpoint()
}

proptest! {
    #[test]
    fn text_round_trip_preserves_state(
        bits in 1u32..=8,
        ops in prop::collection::vec(op_strategy(), 0..60),
    ) {
        let token = walk(bits, &ops);
        let parsed = ProgressToken::from_text(&token.to_text()).unwrap();
        prop_assert_eq!(parsed, token);
    }

    #[test]
    fn binary_round_trip_preserves_state(
        bits in 1u32..=8,
        ops in prop::collection::vec(op_strategy(), 0..60),
    ) {
        let token = walk(bits, &ops);
        let parsed = ProgressToken::from_bytes(&token.to_bytes()).unwrap();
        prop_assert_eq!(parsed, token);
    }

    /// A truncated binary blob never parses.
    #[test]
    fn truncated_binary_is_rejected(
        bits in 1u32..=6,
        ops in prop::collection::vec(op_strategy(), 0..30),
        cut in any::<prop::sample::Index>(),
    ) {
        let bytes = walk(bits, &ops).to_bytes();
        prop_assume!(bytes.len() > 1);
        let cut = cut.index(bytes.len() - 1);
        prop_assert!(ProgressToken::from_bytes(&bytes[..cut]).is_err());
    }
}
