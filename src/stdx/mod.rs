//! Small, self-contained helpers used across the project.

pub mod bits;

pub use bits::{low_mask, mix64};
