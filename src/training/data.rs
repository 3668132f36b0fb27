//! Per-subject sequence preparation.
//!
//! EMA-style data arrives irregularly sampled and on arbitrary scales.
//! [`TrainingSequence`] carries the raw series plus the two optional
//! preparation passes the trainer expects: linear resampling onto the
//! configured grid, and per-dimension z-scoring with recorded statistics
//! so outputs can be mapped back.

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// One subject's ordered observation series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingSequence {
    pub observations: Vec<Array1<f32>>,

    /// Hours, strictly increasing.
    pub timestamps: Vec<f64>,

    /// Whether the series has been resampled onto a fixed grid.
    pub interpolated: bool,

    /// Per-dimension `(mean, std)` recorded by `normalize`.
    pub norm_stats: Option<Vec<(f32, f32)>>,
}

impl TrainingSequence {
    /// Build a sequence, rejecting empty input, length mismatches and
    /// timestamps that fail to strictly increase.
    pub fn new(observations: Vec<Array1<f32>>, timestamps: Vec<f64>) -> Result<Self> {
        if observations.is_empty() {
            return Err(EngineError::EmptySequence);
        }
        if observations.len() != timestamps.len() {
            return Err(EngineError::DimensionMismatch {
                expected: observations.len(),
                got: timestamps.len(),
            });
        }
        for i in 1..timestamps.len() {
            if timestamps[i] <= timestamps[i - 1] {
                return Err(EngineError::NonMonotonicTimestamps { index: i });
            }
        }
        Ok(Self {
            observations,
            timestamps,
            interpolated: false,
            norm_stats: None,
        })
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Apply the preparation passes the config switches on.
    pub fn prepare(mut self, config: &EngineConfig) -> TrainingSequence {
        if config.interpolate {
            self = self.interpolate(config.dt_hours);
        }
        if config.normalize {
            self.normalize();
        }
        self
    }

    /// Resample onto a regular `dt_hours` grid by linear interpolation
    /// between the two bracketing samples. The grid starts at the first
    /// timestamp and never extends past the last.
    pub fn interpolate(&self, dt_hours: f32) -> TrainingSequence {
        let dt = dt_hours as f64;
        if dt <= 0.0 || self.timestamps.len() < 2 {
            let mut copy = self.clone();
            copy.interpolated = true;
            return copy;
        }

        let start = self.timestamps[0];
        let end = self.timestamps[self.timestamps.len() - 1];
        let points = ((end - start) / dt + 1e-9).floor() as usize;

        let mut observations = Vec::with_capacity(points + 1);
        let mut timestamps = Vec::with_capacity(points + 1);
        let mut seg = 0usize;
        for k in 0..=points {
            let t = start + k as f64 * dt;
            while seg + 1 < self.timestamps.len() && self.timestamps[seg + 1] < t {
                seg += 1;
            }
            let obs = if seg + 1 >= self.timestamps.len() {
                self.observations[seg].clone()
            } else {
                let t0 = self.timestamps[seg];
                let t1 = self.timestamps[seg + 1];
                let alpha = (((t - t0) / (t1 - t0)).clamp(0.0, 1.0)) as f32;
                &self.observations[seg] * (1.0 - alpha) + &self.observations[seg + 1] * alpha
            };
            observations.push(obs);
            timestamps.push(t);
        }

        TrainingSequence {
            observations,
            timestamps,
            interpolated: true,
            norm_stats: self.norm_stats.clone(),
        }
    }

    /// Z-score every dimension in place and record `(mean, std)` per
    /// dimension. Near-constant dimensions get a σ floor of 1e-6 instead
    /// of a division blowup.
    pub fn normalize(&mut self) {
        let dim = match self.observations.first() {
            Some(o) => o.len(),
            None => return,
        };
        let n = self.observations.len() as f32;

        let mut stats = Vec::with_capacity(dim);
        for d in 0..dim {
            let mean = self.observations.iter().map(|o| o[d]).sum::<f32>() / n;
            let var = self
                .observations
                .iter()
                .map(|o| (o[d] - mean) * (o[d] - mean))
                .sum::<f32>()
                / n;
            let std = var.sqrt().max(1e-6);
            stats.push((mean, std));
        }

        for obs in self.observations.iter_mut() {
            for d in 0..dim {
                obs[d] = (obs[d] - stats[d].0) / stats[d].1;
            }
        }
        self.norm_stats = Some(stats);
    }

    /// Map a normalized vector back to the original scale. Identity when
    /// `normalize` was never applied.
    pub fn denormalize(&self, v: &Array1<f32>) -> Array1<f32> {
        match &self.norm_stats {
            Some(stats) => Array1::from_iter(
                v.iter()
                    .enumerate()
                    .map(|(d, x)| match stats.get(d) {
                        Some((mean, std)) => x * std + mean,
                        None => *x,
                    }),
            ),
            None => v.clone(),
        }
    }
}

/// Seeded synthetic EMA series: a circadian sine per dimension, phase
/// staggered, plus AR(1) noise. Timestamps follow the config grid.
pub fn synthetic_sequence(config: &EngineConfig, steps: usize, seed: u64) -> TrainingSequence {
    let mut rng = StdRng::seed_from_u64(seed);
    generate(config, steps, &mut rng, false)
}

/// Like [`synthetic_sequence`], but over the final third the AR
/// coefficient ramps toward 1 and the noise amplifies, imitating critical
/// slowing before a transition. Useful for exercising the early-warning
/// detectors.
pub fn synthetic_sequence_with_transition(
    config: &EngineConfig,
    steps: usize,
    seed: u64,
) -> TrainingSequence {
    let mut rng = StdRng::seed_from_u64(seed);
    generate(config, steps, &mut rng, true)
}

fn generate(
    config: &EngineConfig,
    steps: usize,
    rng: &mut StdRng,
    transition: bool,
) -> TrainingSequence {
    let dim = config.state_dim;
    let dt = config.dt_hours as f64;
    let noise = Normal::new(0.0_f32, 0.15).unwrap();
    let onset = steps.saturating_mul(2) / 3;

    let mut ar = vec![0.0f32; dim];
    let mut observations = Vec::with_capacity(steps);
    let mut timestamps = Vec::with_capacity(steps);

    for k in 0..steps {
        let t = k as f64 * dt;
        // Ramp from baseline dynamics into near-unit-root noise.
        let (phi, gain) = if transition && k >= onset && steps > onset {
            let p = (k - onset) as f32 / (steps - onset) as f32;
            (0.65 + 0.33 * p, 1.0 + 1.5 * p)
        } else {
            (0.65, 1.0)
        };

        let mut obs = Array1::zeros(dim);
        for d in 0..dim {
            let phase = d as f32 * std::f32::consts::TAU / dim.max(1) as f32;
            let circadian = 0.5 * ((t / 24.0) as f32 * std::f32::consts::TAU + phase).sin();
            ar[d] = phi * ar[d] + gain * noise.sample(rng);
            obs[d] = circadian + ar[d];
        }
        observations.push(obs);
        timestamps.push(t);
    }

    TrainingSequence {
        observations,
        timestamps,
        interpolated: true,
        norm_stats: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn seq(values: &[(f64, [f32; 2])]) -> TrainingSequence {
        let observations = values.iter().map(|(_, v)| arr1(v)).collect();
        let timestamps = values.iter().map(|(t, _)| *t).collect();
        TrainingSequence::new(observations, timestamps).unwrap()
    }

    #[test]
    fn test_empty_sequence_rejected() {
        let r = TrainingSequence::new(vec![], vec![]);
        assert!(matches!(r, Err(EngineError::EmptySequence)));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let r = TrainingSequence::new(vec![arr1(&[1.0])], vec![0.0, 1.0]);
        assert!(r.is_err());
    }

    #[test]
    fn test_non_monotonic_timestamps_rejected() {
        let obs = vec![arr1(&[0.0]), arr1(&[1.0]), arr1(&[2.0])];
        let r = TrainingSequence::new(obs, vec![0.0, 2.0, 2.0]);
        assert!(matches!(
            r,
            Err(EngineError::NonMonotonicTimestamps { index: 2 })
        ));
    }

    #[test]
    fn test_interpolation_fills_the_grid() {
        let s = seq(&[(0.0, [0.0, 1.0]), (2.0, [1.0, 3.0])]);
        let r = s.interpolate(1.0);
        assert_eq!(r.len(), 3);
        assert!(r.interpolated);
        assert!((r.timestamps[1] - 1.0).abs() < 1e-9);
        assert!((r.observations[1][0] - 0.5).abs() < 1e-6);
        assert!((r.observations[1][1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_interpolation_keeps_endpoints() {
        let s = seq(&[(0.0, [0.2, -0.4]), (1.5, [0.8, 0.0]), (3.0, [0.0, 0.6])]);
        let r = s.interpolate(1.0);
        assert_eq!(r.len(), 4);
        assert!((r.observations[0][0] - 0.2).abs() < 1e-6);
        assert!((r.observations[3][0] - 0.0).abs() < 1e-6);
        assert!((r.timestamps[3] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_interpolation_regular_grid_is_identity() {
        let s = seq(&[(0.0, [1.0, 0.0]), (1.0, [2.0, 0.0]), (2.0, [3.0, 0.0])]);
        let r = s.interpolate(1.0);
        assert_eq!(r.len(), 3);
        for k in 0..3 {
            assert!((r.observations[k][0] - s.observations[k][0]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_normalize_centers_and_scales() {
        let mut s = seq(&[(0.0, [1.0, 10.0]), (1.0, [2.0, 20.0]), (2.0, [3.0, 30.0])]);
        s.normalize();

        for d in 0..2 {
            let mean: f32 = s.observations.iter().map(|o| o[d]).sum::<f32>() / 3.0;
            let var: f32 =
                s.observations.iter().map(|o| (o[d] - mean) * (o[d] - mean)).sum::<f32>() / 3.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-4);
        }
        assert!(s.norm_stats.is_some());
    }

    #[test]
    fn test_normalize_constant_dimension_floors_sigma() {
        let mut s = seq(&[(0.0, [5.0, 0.0]), (1.0, [5.0, 1.0]), (2.0, [5.0, 2.0])]);
        s.normalize();
        for o in &s.observations {
            assert!(o[0].abs() < 1e-3);
            assert!(o[0].is_finite());
        }
    }

    #[test]
    fn test_denormalize_roundtrip() {
        let original = seq(&[(0.0, [1.0, -4.0]), (1.0, [3.0, 2.0]), (2.0, [5.0, 8.0])]);
        let mut s = original.clone();
        s.normalize();

        for k in 0..s.len() {
            let back = s.denormalize(&s.observations[k]);
            for d in 0..2 {
                assert!(
                    (back[d] - original.observations[k][d]).abs() < 1e-4,
                    "roundtrip off at [{}, {}]",
                    k,
                    d
                );
            }
        }
    }

    #[test]
    fn test_synthetic_is_reproducible() {
        let config = EngineConfig::default();
        let a = synthetic_sequence(&config, 48, 9);
        let b = synthetic_sequence(&config, 48, 9);
        assert_eq!(a.len(), 48);
        for k in 0..48 {
            for d in 0..3 {
                assert_eq!(a.observations[k][d], b.observations[k][d]);
            }
            assert!(a.observations[k].iter().all(|v| v.is_finite()));
        }
        for k in 1..48 {
            assert!(a.timestamps[k] > a.timestamps[k - 1]);
        }
    }

    #[test]
    fn test_transition_raises_late_variance() {
        let config = EngineConfig::default();
        let s = synthetic_sequence_with_transition(&config, 240, 11);
        let third = s.len() / 3;

        let var_of = |obs: &[Array1<f32>]| {
            let n = obs.len() as f32;
            let mean = obs.iter().map(|o| o[0]).sum::<f32>() / n;
            obs.iter().map(|o| (o[0] - mean) * (o[0] - mean)).sum::<f32>() / n
        };
        let early = var_of(&s.observations[..third]);
        let late = var_of(&s.observations[s.len() - third..]);
        assert!(late > 1.5 * early, "early {} late {}", early, late);
    }
}
