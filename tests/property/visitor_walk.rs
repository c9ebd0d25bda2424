//! Conservation properties of randomized visitor walks.
//!
//! Whatever mix of reports, resolution changes, and checkpoint resumes
//! happens mid-visit, draining the iterator afterwards must reach a fully
//! finished state, and no part of the keyspace may be skipped.

use proptest::prelude::*;

use bucketscan_rs::{
    BucketId, BucketProgress, Selection, VisitorIterator, VisitorWorkItem,
};

const COVER_BITS: u8 = 12;

#[derive(Clone, Debug)]
enum Op {
    Pull,
    Finish(usize),
    Partial(usize),
    ChangeBits(u32),
    CrashResume,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Pull),
        3 => any::<usize>().prop_map(Op::Finish),
        2 => any::<usize>().prop_map(Op::Partial),
        1 => (1u32..=8).prop_map(Op::ChangeBits),
        1 => Just(Op::CrashResume),
    ]
}

/// Marks every depth-`COVER_BITS` slot under `bucket` as covered.
fn cover(slots: &mut [u32], bucket: BucketId) {
    assert!(bucket.used_bits() <= COVER_BITS);
    let stride = 1u64 << bucket.used_bits();
    let mut raw = bucket.raw();
    while raw < (1u64 << COVER_BITS) {
        slots[raw as usize] += 1;
        raw += stride;
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    #[test]
    fn random_walk_always_drains_to_full_coverage(
        bits in 1u32..=8,
        ops in prop::collection::vec(op_strategy(), 0..80),
    ) {
        let mut iter = VisitorIterator::new(&Selection::FullRange, bits, None).unwrap();
        let mut held: Vec<VisitorWorkItem> = Vec::new();
        let mut slots = vec![0u32; 1 << COVER_BITS];
        let mut decreased = false;

        for op in &ops {
            match op {
                Op::Pull => {
                    if let Some(item) = iter.get_next() {
                        prop_assert!(!iter.should_yield());
                        held.push(item);
                    }
                }
                Op::Finish(i) => {
                    if !held.is_empty() {
                        let item = held.swap_remove(i % held.len());
                        iter.update(item.superbucket, BucketProgress::Finished);
                        cover(&mut slots, item.superbucket);
                    }
                }
                Op::Partial(i) => {
                    if !held.is_empty() {
                        let item = held.swap_remove(i % held.len());
                        let sup = item.superbucket;
                        let mark =
                            BucketId::new(sup.used_bits() + 1, sup.raw() | (1 << sup.used_bits()));
                        iter.update(sup, BucketProgress::At(mark));
                    }
                }
                Op::ChangeBits(target) => {
                    if *target < iter.distribution_bit_count() {
                        decreased = true;
                    }
                    iter.set_distribution_bit_count(*target);
                }
                Op::CrashResume => {
                    let token = iter.checkpoint();
                    iter = VisitorIterator::new(
                        &Selection::FullRange,
                        token.distribution_bit_count(),
                        Some(token),
                    )
                    .unwrap();
                    held.clear();
                }
            }
            let percent = iter.percent_finished();
            prop_assert!((0.0..=100.0).contains(&percent));
        }

        // Drain: report everything still held, then pull to completion.
        for item in held.drain(..) {
            iter.update(item.superbucket, BucketProgress::Finished);
            cover(&mut slots, item.superbucket);
        }
        while let Some(item) = iter.get_next() {
            iter.update(item.superbucket, BucketProgress::Finished);
            cover(&mut slots, item.superbucket);
        }

        prop_assert!(iter.is_done());
        prop_assert!(!iter.has_next());
        prop_assert_eq!(iter.percent_finished(), 100.0);
        for (raw, &count) in slots.iter().enumerate() {
            prop_assert!(count >= 1, "slot {raw:#x} never covered");
            if !decreased {
                prop_assert_eq!(count, 1, "slot {:#x} covered {} times", raw, count);
            }
        }
    }
}
