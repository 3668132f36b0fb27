//! Optimization state: gradient accumulation and Adam.

pub mod adam;

pub use adam::{AdamState, GradientAccumulator};
