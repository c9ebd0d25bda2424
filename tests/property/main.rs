//! Property-based tests for bucket ordering and visitor state.
//!
//! Run with: `cargo test --test property`

mod bucket_key_order;
mod progress_wire;
mod visitor_walk;
