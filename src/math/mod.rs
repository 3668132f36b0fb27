//! Dense numerical primitives the engines share.
//!
//! Multiply, transpose and elementwise arithmetic come straight from
//! `ndarray`; this module adds the pieces it lacks — a pivoted Gauss-Jordan
//! inverse with a graceful identity fallback, a power-iteration spectral
//! estimate, and finite/clamped sanitization. Degenerate inputs never panic
//! the forecasting loop; they log and substitute.

pub mod linalg;

pub use linalg::{invert, max_eigenvalue, outer, sanitize, try_invert};
