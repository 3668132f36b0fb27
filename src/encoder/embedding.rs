//! Observation embedding with positional and temporal structure.
//!
//! Each window position becomes `w_obs·obs + positional[pos] + time`,
//! where the time term encodes circadian and weekly phase as fixed
//! sinusoidal harmonics. The first half of the embedding dimensions
//! carries hour-of-day harmonics, the second half day-of-week harmonics,
//! alternating sin/cos per pair.

use ndarray::Array1;

use crate::state::{day_of_week, hour_of_day};
use crate::weights::KalmanFormerWeights;

/// Embed one observation for window position `pos`.
///
/// Positions past the positional table reuse its last row.
pub fn embed(
    obs: &Array1<f32>,
    pos: usize,
    timestamp: f64,
    weights: &KalmanFormerWeights,
) -> Array1<f32> {
    let mut e = weights.w_obs.dot(obs);
    let row = pos.min(weights.positional.nrows() - 1);
    e += &weights.positional.row(row);
    e += &time_features(e.len(), timestamp);
    e
}

/// Fixed sinusoidal time encoding of dimension `dim`.
pub fn time_features(dim: usize, timestamp: f64) -> Array1<f32> {
    let circadian = std::f32::consts::TAU * hour_of_day(timestamp) / 24.0;
    let weekly = std::f32::consts::TAU * day_of_week(timestamp) / 7.0;

    let half = dim / 2;
    let mut t = Array1::zeros(dim);
    for i in 0..dim {
        let (phase, j) = if i < half {
            (circadian, i)
        } else {
            (weekly, i - half)
        };
        let angle = phase * (j / 2 + 1) as f32;
        t[i] = if j % 2 == 0 { angle.sin() } else { angle.cos() };
    }
    t
}
