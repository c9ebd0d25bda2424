//! Small bit-manipulation helpers shared across the crate.
//!
//! Purpose: stable 64-bit mixing for identifier-to-bucket assignment and
//! mask construction for partial-word bucket ids.
//!
//! Invariants:
//! - `mix64` is a fixed function: the same input yields the same output on
//!   every platform, build, and crate version. Bucket assignments derived
//!   from it are persisted inside progress tokens, so the function must
//!   never change.
//!
//! Algorithm:
//! - `mix64` is the splitmix64 finalizer: two xor-shift-multiply rounds with
//!   the published constants, then a final xor-shift.
//!
//! References:
//! - https://prng.di.unimi.it/splitmix64.c
//! - https://zimbry.blogspot.com/2011/09/better-bit-mixing-improving-on.html

/// Stable 64-bit bit mixer (splitmix64 finalizer).
///
/// Guarantees:
/// - Bijective on `u64`; all 64 output bits depend on all input bits.
/// - Fixed for all time; safe to persist values derived from it.
///
/// Complexity:
/// - O(1), branch-free.
///
/// # Examples
/// ```
/// use bucketscan_rs::stdx::bits::mix64;
///
/// assert_eq!(mix64(0), 0);
/// assert_ne!(mix64(1), mix64(2));
/// ```
#[inline]
pub fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    x
}

/// Mask with the low `bits` bits set.
///
/// Preconditions:
/// - `bits < 64`. Enforced with a `debug_assert!`; bucket ids never use the
///   full word (at most 58 significant bits).
#[inline]
pub fn low_mask(bits: u32) -> u64 {
    debug_assert!(bits < 64);
    (1u64 << bits) - 1
}
