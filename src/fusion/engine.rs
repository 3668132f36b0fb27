//! KalmanFormer — a linear-Gaussian filter fused with an attention encoder.
//!
//! Each update runs both branches over the same observation: the Kalman
//! branch does predict → gain → update, the attention branch encodes the
//! recent window and projects the current context back into state space.
//! The two estimates are blended by an adaptive ratio `r`:
//!
//!   `x = (1 − r)·kalman + r·attention`
//!
//! When a learned gain head is present, the Kalman gain is
//! `diag(sigmoid(gain_w·ctx + gain_b))` instead of the analytic form.
//! Forecasts self-feed: each step's blend becomes the next pseudo
//! observation, so uncertainty compounds the way the filter says it should.

use std::collections::VecDeque;

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::config::EngineConfig;
use crate::encoder::encode_window;
use crate::error::{EngineError, Result};
use crate::filter::{self, FilterState};
use crate::math;
use crate::state::StateVector;
use crate::weights::KalmanFormerWeights;

use super::explain::{explain_attention, AttentionExplanation};

/// Forecast over a fixed horizon.
#[derive(Clone, Debug)]
pub struct FusionForecast {
    /// `horizon + 1` states, the starting state first.
    pub trajectory: Vec<StateVector>,

    /// Per-step means, aligned with `trajectory`.
    pub mean: Vec<Array1<f32>>,

    /// Per-step 95% band `(lower, upper)`, aligned with `trajectory`.
    pub ci95: Vec<(Array1<f32>, Array1<f32>)>,

    /// Head-averaged attention of the deepest layer at the last rolled
    /// step. Empty when no window was available.
    pub attention: Array2<f32>,
}

/// The fusion engine. One instance per subject.
pub struct KalmanFormer {
    config: EngineConfig,
    weights: Option<KalmanFormerWeights>,
    history: VecDeque<(Array1<f32>, f64)>,
    blend_ratio: f32,
    last_attention: Array2<f32>,
    last_confidence: f32,
}

impl KalmanFormer {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let blend_ratio = config.blend_ratio;
        Ok(Self {
            config,
            weights: None,
            history: VecDeque::new(),
            blend_ratio,
            last_attention: Array2::zeros((0, 0)),
            last_confidence: 0.0,
        })
    }

    /// Build fresh weights from the configured seed.
    pub fn initialize(&mut self) {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        self.initialize_with(&mut rng);
    }

    /// Build fresh weights from a caller-owned generator.
    pub fn initialize_with(&mut self, rng: &mut StdRng) {
        let w = KalmanFormerWeights::init(&self.config, rng);
        debug!(params = w.param_count(), "kalmanformer initialized");
        self.weights = Some(w);
    }

    pub fn is_initialized(&self) -> bool {
        self.weights.is_some()
    }

    /// Structural copy of the current weights; the caller owns it.
    pub fn export_weights(&self) -> Result<KalmanFormerWeights> {
        Ok(self.weights_ref()?.clone())
    }

    pub fn load_weights(&mut self, weights: KalmanFormerWeights) -> Result<()> {
        if weights.state_dim() != self.config.state_dim {
            return Err(EngineError::DimensionMismatch {
                expected: self.config.state_dim,
                got: weights.state_dim(),
            });
        }
        self.weights = Some(weights);
        Ok(())
    }

    pub fn blend_ratio(&self) -> f32 {
        self.blend_ratio
    }

    /// Confidence of the last update, in (0, 1].
    pub fn confidence(&self) -> f32 {
        self.last_confidence
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Fuse one observation into the state.
    ///
    /// Appends `(observation, timestamp)` to the bounded window, runs both
    /// branches and returns the blended posterior. The input state is never
    /// mutated.
    pub fn update(
        &mut self,
        state: &StateVector,
        observation: &Array1<f32>,
        timestamp: f64,
    ) -> Result<StateVector> {
        self.weights_ref()?;
        let n = self.config.state_dim;
        if observation.len() != n {
            return Err(EngineError::DimensionMismatch {
                expected: n,
                got: observation.len(),
            });
        }
        if state.dim() != n {
            return Err(EngineError::DimensionMismatch {
                expected: n,
                got: state.dim(),
            });
        }

        self.history.push_back((observation.clone(), timestamp));
        while self.history.len() > self.config.window_size {
            self.history.pop_front();
        }

        let weights = self.weights.as_ref().ok_or(EngineError::Uninitialized)?;
        let window: Vec<(Array1<f32>, f64)> = self.history.iter().cloned().collect();
        let encoded = encode_window(&window, weights, &self.config);

        let prior = filter::predict(&state.to_filter(), &weights.kalman);

        // The window holds at least the observation just pushed.
        let ctx = encoded.current().to_owned();
        let x_att = weights.w_out.dot(&ctx) + &weights.b_out;

        let gain = match (&weights.gain_w, &weights.gain_b) {
            (Some(gw), Some(gb)) if self.config.learned_gain => {
                Array2::from_diag(&(gw.dot(&ctx) + gb).mapv(sigmoid))
            }
            _ => filter::analytic_gain(&prior, &weights.kalman),
        };

        let (posterior, innovation) = filter::update(&prior, observation, &gain, &weights.kalman);

        let r = self.blend_ratio;
        let blended = math::sanitize(
            (1.0 - r) * &posterior.mean + r * &x_att,
            self.config.state_clamp,
        );

        let agreement = (-l2(&(&posterior.mean - &x_att))).exp();
        let surprise = (-l2(&innovation)).exp();
        self.last_confidence = 0.5 * (agreement + surprise);
        self.last_attention = encoded.attention;

        Ok(StateVector::from_filter(
            &FilterState {
                mean: blended,
                covariance: posterior.covariance,
            },
            timestamp,
            state.timestep + 1,
        ))
    }

    /// Forecast `horizon` steps ahead.
    ///
    /// Each step's blended estimate becomes the next pseudo observation.
    /// Works on a local copy of the window; internal history is untouched.
    pub fn predict(&self, state: &StateVector, horizon: usize) -> Result<FusionForecast> {
        let weights = self.weights_ref()?;

        let mut window: Vec<(Array1<f32>, f64)> = self.history.iter().cloned().collect();
        let mut filter_state = state.to_filter();
        let dt = self.config.dt_hours as f64;
        let r = self.blend_ratio;

        let mut trajectory = Vec::with_capacity(horizon + 1);
        let mut mean = Vec::with_capacity(horizon + 1);
        let mut ci95 = Vec::with_capacity(horizon + 1);
        let mut attention = self.last_attention.clone();

        trajectory.push(state.clone());
        mean.push(state.latent.clone());
        ci95.push(band(&state.latent, &state.uncertainty));

        for k in 1..=horizon {
            let prior = filter::predict(&filter_state, &weights.kalman);
            let encoded = encode_window(&window, weights, &self.config);
            let ctx = (encoded.context.nrows() > 0).then(|| encoded.current().to_owned());

            let x_att = match &ctx {
                Some(c) => weights.w_out.dot(c) + &weights.b_out,
                None => prior.mean.clone(),
            };

            let gain = match (&weights.gain_w, &weights.gain_b, &ctx) {
                (Some(gw), Some(gb), Some(c)) if self.config.learned_gain => {
                    Array2::from_diag(&(gw.dot(c) + gb).mapv(sigmoid))
                }
                _ => filter::analytic_gain(&prior, &weights.kalman),
            };

            let pseudo = math::sanitize(
                (1.0 - r) * &prior.mean + r * &x_att,
                self.config.state_clamp,
            );
            let (posterior, _) = filter::update(&prior, &pseudo, &gain, &weights.kalman);

            let t = state.timestamp + dt * k as f64;
            window.push((pseudo, t));
            if window.len() > self.config.window_size {
                window.remove(0);
            }
            if encoded.attention.nrows() > 0 {
                attention = encoded.attention;
            }

            let snapshot = StateVector::from_filter(&posterior, t, state.timestep + k as u64);
            mean.push(snapshot.latent.clone());
            ci95.push(band(&snapshot.latent, &snapshot.uncertainty));
            trajectory.push(snapshot);
            filter_state = posterior;
        }

        Ok(FusionForecast {
            trajectory,
            mean,
            ci95,
            attention,
        })
    }

    /// Explain where the encoder's attention sat at the last update.
    pub fn explain(&self) -> Result<AttentionExplanation> {
        self.weights_ref()?;
        let timestamps: Vec<f64> = self.history.iter().map(|(_, t)| *t).collect();
        Ok(explain_attention(&self.last_attention, &timestamps))
    }

    /// Nudge the blend toward whichever branch the recent errors favor.
    ///
    /// RMSE above 0.5 pulls 0.1 toward the filter branch, anything better
    /// pushes 0.1 toward the attention branch; the ratio stays in
    /// [0.2, 0.8]. Empty input leaves the ratio untouched.
    pub fn adapt_blend_ratio(
        &mut self,
        predictions: &[Array1<f32>],
        actuals: &[Array1<f32>],
    ) -> Result<f32> {
        self.weights_ref()?;
        let pairs = predictions.len().min(actuals.len());
        if pairs == 0 {
            return Ok(self.blend_ratio);
        }

        let mut sum = 0.0;
        let mut count = 0usize;
        for (p, a) in predictions.iter().zip(actuals.iter()).take(pairs) {
            for (x, y) in p.iter().zip(a.iter()) {
                sum += (x - y) * (x - y);
                count += 1;
            }
        }
        if count == 0 {
            return Ok(self.blend_ratio);
        }

        let rmse = (sum / count as f32).sqrt();
        let step = if rmse > 0.5 { -0.1 } else { 0.1 };
        self.blend_ratio = (self.blend_ratio + step).clamp(0.2, 0.8);
        debug!(rmse = rmse, ratio = self.blend_ratio, "blend ratio adapted");
        Ok(self.blend_ratio)
    }

    fn weights_ref(&self) -> Result<&KalmanFormerWeights> {
        self.weights.as_ref().ok_or(EngineError::Uninitialized)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn l2(v: &Array1<f32>) -> f32 {
    v.dot(v).sqrt()
}

/// 95% band around a mean given a per-dimension variance.
fn band(mean: &Array1<f32>, variance: &Array1<f32>) -> (Array1<f32>, Array1<f32>) {
    let half = variance.mapv(|v| 1.96 * v.max(0.0).sqrt());
    (mean - &half, mean + &half)
}
