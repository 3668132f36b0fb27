//! Linear-Gaussian filtering core.
//!
//! Pure predict/gain/update primitives over [`FilterState`]. The fusion
//! engine composes these with the sequence encoder; nothing here ever
//! errors — singular innovation covariance degrades through the
//! `math::invert` identity fallback.

pub mod kalman;

pub use kalman::{analytic_gain, predict, update, FilterState, KalmanMatrices};
