//! Per-subject state snapshot.
//!
//! `StateVector` is the value every engine consumes and produces. State
//! transitions are pure: `forward`/`update` return a new instance and never
//! mutate their input. All components are finite; forward passes clamp into
//! ±`state_clamp`.
//!
//! Timestamps are `f64` fractional hours since the Unix epoch. Hour-of-day
//! and day-of-week fall out of plain modular arithmetic (the epoch began on
//! a Thursday), which keeps the crate free of a calendar dependency.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::filter::FilterState;

/// Snapshot of one subject at one timestep.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateVector {
    /// Latent dynamical state `z`.
    pub latent: Array1<f32>,

    /// Observation-space state `x` (what self-reports measure).
    pub observed: Array1<f32>,

    /// Diagonal of the state covariance.
    pub uncertainty: Array1<f32>,

    /// Fractional hours since the Unix epoch.
    pub timestamp: f64,

    /// Monotone step counter.
    pub timestep: u64,
}

impl StateVector {
    /// Zero state with unit uncertainty at a given timestamp.
    pub fn zeros(dim: usize, timestamp: f64) -> Self {
        Self {
            latent: Array1::zeros(dim),
            observed: Array1::zeros(dim),
            uncertainty: Array1::ones(dim),
            timestamp,
            timestep: 0,
        }
    }

    /// State dimension.
    pub fn dim(&self) -> usize {
        self.latent.len()
    }

    /// True when every component of every field is finite.
    pub fn is_finite(&self) -> bool {
        self.latent.iter().all(|v| v.is_finite())
            && self.observed.iter().all(|v| v.is_finite())
            && self.uncertainty.iter().all(|v| v.is_finite())
            && self.timestamp.is_finite()
    }

    /// Project into the filter representation: mean = latent, covariance =
    /// diag(uncertainty). One half of the typed PLRNN↔KalmanFormer bridge.
    pub fn to_filter(&self) -> FilterState {
        let n = self.latent.len();
        let mut covariance = Array2::zeros((n, n));
        for i in 0..n {
            covariance[[i, i]] = self.uncertainty[i].max(0.0);
        }
        FilterState {
            mean: self.latent.clone(),
            covariance,
        }
    }

    /// Lift a filter state back into a snapshot: latent = observed = mean,
    /// uncertainty = diag(covariance). The other half of the bridge.
    pub fn from_filter(filter: &FilterState, timestamp: f64, timestep: u64) -> Self {
        let n = filter.mean.len();
        let uncertainty = Array1::from_iter((0..n).map(|i| filter.covariance[[i, i]].max(0.0)));
        Self {
            latent: filter.mean.clone(),
            observed: filter.mean.clone(),
            uncertainty,
            timestamp,
            timestep,
        }
    }
}

/// Hour of day in [0, 24) for an epoch-hours timestamp.
pub fn hour_of_day(timestamp: f64) -> f32 {
    timestamp.rem_euclid(24.0) as f32
}

/// Day of week in [0, 7), 0 = Sunday, for an epoch-hours timestamp.
/// The epoch (1970-01-01) was a Thursday, day 4.
pub fn day_of_week(timestamp: f64) -> f32 {
    let days = (timestamp / 24.0).floor() as i64;
    (days + 4).rem_euclid(7) as f32
}
