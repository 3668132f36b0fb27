//! Kalman predict/update and the analytic gain.
//!
//! ```text
//! predict:  x̂⁻ = A·x̂            P⁻ = A·P·Aᵗ + Q
//! gain:     K  = P⁻·Hᵗ·(H·P⁻·Hᵗ + R)⁻¹
//! update:   y  = z − H·x̂⁻       x̂ = x̂⁻ + K·y       P = (I − K·H)·P⁻
//! ```
//!
//! All functions are pure: inputs are borrowed, outputs are owned, nothing
//! aliases. The gain may also be supplied externally (the fusion engine's
//! learned sigmoid head does exactly that).

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::math;

/// Gaussian belief over the latent state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterState {
    /// Mean x̂.
    pub mean: Array1<f32>,

    /// Full covariance P.
    pub covariance: Array2<f32>,
}

impl FilterState {
    /// Zero mean with isotropic covariance.
    pub fn new(dim: usize, variance: f32) -> Self {
        Self {
            mean: Array1::zeros(dim),
            covariance: Array2::eye(dim) * variance,
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }
}

/// The four matrices of a linear-Gaussian model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KalmanMatrices {
    /// State transition A.
    pub a: Array2<f32>,

    /// Observation map H.
    pub h: Array2<f32>,

    /// Process noise Q.
    pub q: Array2<f32>,

    /// Observation noise R.
    pub r: Array2<f32>,
}

impl KalmanMatrices {
    /// Identity transition/observation with isotropic noise — the standard
    /// starting point before any learning.
    pub fn identity(dim: usize, process_noise: f32, observation_noise: f32) -> Self {
        Self {
            a: Array2::eye(dim),
            h: Array2::eye(dim),
            q: Array2::eye(dim) * process_noise,
            r: Array2::eye(dim) * observation_noise,
        }
    }
}

/// Time update: propagate the belief one step through the linear dynamics.
pub fn predict(state: &FilterState, m: &KalmanMatrices) -> FilterState {
    let mean = m.a.dot(&state.mean);
    let covariance = m.a.dot(&state.covariance).dot(&m.a.t()) + &m.q;
    FilterState { mean, covariance }
}

/// Analytic Kalman gain `K = P⁻·Hᵗ·(H·P⁻·Hᵗ + R)⁻¹`.
///
/// A singular innovation covariance degrades to the identity inverse
/// (logged by `math::invert`) instead of failing.
pub fn analytic_gain(prior: &FilterState, m: &KalmanMatrices) -> Array2<f32> {
    let innovation_cov = m.h.dot(&prior.covariance).dot(&m.h.t()) + &m.r;
    prior
        .covariance
        .dot(&m.h.t())
        .dot(&math::invert(&innovation_cov))
}

/// Measurement update with a supplied gain.
///
/// Returns the posterior belief and the innovation `y = z − H·x̂⁻` (the
/// fusion engine folds its magnitude into its confidence score).
pub fn update(
    prior: &FilterState,
    observation: &Array1<f32>,
    gain: &Array2<f32>,
    m: &KalmanMatrices,
) -> (FilterState, Array1<f32>) {
    let innovation = observation - &m.h.dot(&prior.mean);
    let mean = &prior.mean + &gain.dot(&innovation);

    let n = prior.dim();
    let identity: Array2<f32> = Array2::eye(n);
    let covariance = (identity - gain.dot(&m.h)).dot(&prior.covariance);

    (FilterState { mean, covariance }, innovation)
}
