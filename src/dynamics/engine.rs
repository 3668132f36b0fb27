//! Piecewise-linear recurrent dynamics.
//!
//! The latent state evolves as
//!
//!   `z' = a ⊙ z + w·relu(z) + s + bias_z  (+ dend_c·relu(dend_d·z + dend_bias))`
//!   `x' = b·z' + bias_x`
//!
//! with every transition clamped into ±`state_clamp` and non-finite
//! components zeroed. The piecewise-linear form keeps the model
//! analyzable: the connectivity `w` doubles as a causal graph and the
//! upper-region Jacobian `diag(a) + w` gives a spectral stability read.
//!
//! The engine owns an internal [`KalmanFormer`] fed by `observe`, so the
//! hybrid forecast can route short horizons through the fusion branch and
//! long horizons through a pure latent rollout.

use std::path::Path;

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fusion::{FusionForecast, KalmanFormer};
use crate::math;
use crate::optim::{AdamState, GradientAccumulator};
use crate::state::StateVector;
use crate::training::data::TrainingSequence;
use crate::weights::PlrnnWeights;

use super::causal::{self, CausalNetwork};
use super::online;
use super::warning::{detect_early_warnings, EarlyWarningSignal};

/// Cap on the retained observation history feeding early warnings.
const HISTORY_CAP: usize = 512;

/// Named horizons of the hybrid forecast scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForecastHorizon {
    /// 3 steps. The fusion engine tracks fast fluctuations best.
    Short,

    /// 12 steps. Both engines averaged, widest band per step wins.
    Medium,

    /// 48 steps. Pure latent rollout.
    Long,
}

impl ForecastHorizon {
    pub fn steps(self) -> usize {
        match self {
            ForecastHorizon::Short => 3,
            ForecastHorizon::Medium => 12,
            ForecastHorizon::Long => 48,
        }
    }
}

/// Forecast with per-step bands and whatever early warnings are active at
/// forecast time.
#[derive(Clone, Debug)]
pub struct Forecast {
    /// `horizon + 1` states, the starting state first.
    pub trajectory: Vec<StateVector>,

    /// Per-step observation-space means, aligned with `trajectory`.
    pub mean: Vec<Array1<f32>>,

    /// Per-step 95% band `(lower, upper)`, aligned with `trajectory`.
    pub ci95: Vec<(Array1<f32>, Array1<f32>)>,

    pub warnings: Vec<EarlyWarningSignal>,
}

/// The latent-dynamics engine. One instance per subject.
pub struct PlrnnEngine {
    config: EngineConfig,
    weights: Option<PlrnnWeights>,
    fusion: KalmanFormer,
    observations: Vec<Array1<f32>>,
    current: StateVector,
    adam: AdamState,
}

impl PlrnnEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let fusion = KalmanFormer::new(config.clone())?;
        let current = StateVector::zeros(config.state_dim, 0.0);
        Ok(Self {
            config,
            weights: None,
            fusion,
            observations: Vec::new(),
            current,
            adam: AdamState::new(),
        })
    }

    /// Build fresh weights for both engines from the configured seed.
    pub fn initialize(&mut self) {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let weights = PlrnnWeights::init(&self.config, &mut rng);
        debug!(params = weights.param_count(), "plrnn initialized");
        self.weights = Some(weights);
        self.fusion.initialize_with(&mut rng);
    }

    pub fn is_initialized(&self) -> bool {
        self.weights.is_some()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Latest state tracked by `observe`.
    pub fn current_state(&self) -> &StateVector {
        &self.current
    }

    /// The internal fusion engine.
    pub fn fusion(&self) -> &KalmanFormer {
        &self.fusion
    }

    pub fn fusion_mut(&mut self) -> &mut KalmanFormer {
        &mut self.fusion
    }

    /// Structural copy of the current weights; the caller owns it.
    pub fn export_weights(&self) -> Result<PlrnnWeights> {
        Ok(self.weights_ref()?.clone())
    }

    pub fn load_weights(&mut self, weights: PlrnnWeights) -> Result<()> {
        if weights.state_dim() != self.config.state_dim {
            return Err(EngineError::DimensionMismatch {
                expected: self.config.state_dim,
                got: weights.state_dim(),
            });
        }
        self.weights = Some(weights);
        Ok(())
    }

    /// Write the current weights to a JSON file.
    pub fn save_weights(&self, path: &Path) -> Result<()> {
        self.weights_ref()?.save(path)
    }

    /// Replace the current weights from a JSON file.
    pub fn load_weights_file(&mut self, path: &Path) -> Result<()> {
        let weights = PlrnnWeights::load(path)?;
        self.load_weights(weights)
    }

    /// One dynamics step. The input `s`, when given, enters the latent
    /// update identity-coupled. Never mutates `state`.
    pub fn forward(&self, state: &StateVector, input: Option<&Array1<f32>>) -> Result<StateVector> {
        let weights = self.weights_ref()?;
        self.check_dim(state.dim())?;
        if let Some(s) = input {
            self.check_dim(s.len())?;
        }
        Ok(self.step(weights, state, input))
    }

    /// Roll `horizon` steps ahead. The trajectory always has `horizon + 1`
    /// states including the start; the band widens by `process_noise` per
    /// step. Early warnings active on the observation history ride along.
    pub fn predict(
        &self,
        state: &StateVector,
        horizon: usize,
        input: Option<&Array1<f32>>,
    ) -> Result<Forecast> {
        let trajectory = self.rollout(state, horizon, input)?;
        Ok(assemble_forecast(trajectory, self.early_warnings()))
    }

    /// Route a forecast by horizon class: fusion for short, latent rollout
    /// for long, a blend of both for medium.
    pub fn hybrid_predict(&self, state: &StateVector, horizon: ForecastHorizon) -> Result<Forecast> {
        let steps = horizon.steps();
        match horizon {
            ForecastHorizon::Short => {
                let fused = self.fusion.predict(state, steps)?;
                Ok(from_fusion(fused, self.early_warnings()))
            }
            ForecastHorizon::Long => self.predict(state, steps, None),
            ForecastHorizon::Medium => {
                let fused = self.fusion.predict(state, steps)?;
                let rolled = self.rollout(state, steps, None)?;
                Ok(combine(fused, rolled, self.early_warnings()))
            }
        }
    }

    /// Fold one measurement into the engine.
    ///
    /// The latent estimate comes from the robust inverse of the observation
    /// map; the measurement also feeds the fusion window and the
    /// early-warning history. Returns the new current state.
    pub fn observe(&mut self, observation: &Array1<f32>, timestamp: f64) -> Result<StateVector> {
        self.check_dim(observation.len())?;
        let latent = {
            let weights = self.weights_ref()?;
            self.latent_from_observation(weights, observation)
        };

        self.observations.push(observation.clone());
        if self.observations.len() > HISTORY_CAP {
            self.observations.remove(0);
        }

        let fused = self.fusion.update(&self.current, observation, timestamp)?;
        let next = StateVector {
            latent,
            observed: observation.clone(),
            uncertainty: fused.uncertainty,
            timestamp,
            timestep: fused.timestep,
        };
        self.current = next.clone();
        Ok(next)
    }

    /// Early warnings over the engine's own observation history.
    pub fn early_warnings(&self) -> Vec<EarlyWarningSignal> {
        detect_early_warnings(&self.observations, self.config.window_size, &self.config)
    }

    /// The causal graph implied by the current connectivity.
    pub fn extract_causal_network(&self) -> Result<CausalNetwork> {
        Ok(causal::extract(self.weights_ref()?, &self.config))
    }

    /// Spectral radius of the upper-region Jacobian `diag(a) + w`. Values
    /// below 1 mean the all-active linearization is contractive.
    pub fn spectral_radius(&self) -> Result<f32> {
        let weights = self.weights_ref()?;
        let jacobian = Array2::from_diag(&weights.a) + &weights.w;
        Ok(math::max_eigenvalue(&jacobian, 100))
    }

    /// One gradient step toward `target`; returns the teacher-forced next
    /// state and the step loss.
    pub fn train_online(
        &mut self,
        state: &StateVector,
        target: &Array1<f32>,
        input: Option<&Array1<f32>>,
    ) -> Result<(StateVector, f32)> {
        self.check_dim(state.dim())?;
        self.check_dim(target.len())?;
        if let Some(s) = input {
            self.check_dim(s.len())?;
        }

        let (weights, adam, config) = self.training_parts()?;
        let cache = online::forward_cached(weights, config, &state.latent, input);
        let loss = online::calculate_loss(&cache.x_next, target);

        let mut accum = GradientAccumulator::new();
        let zero = Array1::zeros(cache.z_next.len());
        online::backward_step(weights, &cache, Some(target), &zero, &mut accum);
        online::add_regularization(weights, &mut accum, config.l1_weight, config.l2_weight);
        accum.count_step();
        accum.clip_global_norm(config.gradient_clip);
        online::apply_gradients(weights, &accum, adam, config.learning_rate);

        let inverse = math::invert(&weights.b);
        let latent = math::sanitize(inverse.dot(&(target - &weights.bias_x)), config.state_clamp);
        let next = StateVector {
            latent,
            observed: target.clone(),
            uncertainty: state.uncertainty.mapv(|u| u + config.process_noise),
            timestamp: state.timestamp + config.dt_hours as f64,
            timestep: state.timestep + 1,
        };
        weights.meta.training_samples += 1;
        Ok((next, loss))
    }

    /// Run `train_online` across consecutive pairs of a sequence. Returns
    /// the mean per-step loss; a single-observation sequence is a no-op.
    pub fn train_batch(&mut self, sequence: &TrainingSequence) -> Result<f32> {
        if sequence.len() < 2 {
            return Ok(0.0);
        }
        let first = {
            let weights = self.weights_ref()?;
            self.latent_from_observation(weights, &sequence.observations[0])
        };
        let mut state = StateVector::zeros(self.config.state_dim, sequence.timestamps[0]);
        state.latent = first;
        state.observed = sequence.observations[0].clone();

        let mut total = 0.0;
        for k in 1..sequence.len() {
            let (next, loss) = self.train_online(&state, &sequence.observations[k], None)?;
            state = next;
            total += loss;
        }
        Ok(total / (sequence.len() - 1) as f32)
    }

    // ── internals ───────────────────────────────────────────────────────

    pub(super) fn rollout(
        &self,
        state: &StateVector,
        horizon: usize,
        input: Option<&Array1<f32>>,
    ) -> Result<Vec<StateVector>> {
        let weights = self.weights_ref()?;
        self.check_dim(state.dim())?;
        if let Some(s) = input {
            self.check_dim(s.len())?;
        }

        let mut trajectory = Vec::with_capacity(horizon + 1);
        trajectory.push(state.clone());
        let mut current = state.clone();
        for _ in 0..horizon {
            current = self.step(weights, &current, input);
            trajectory.push(current.clone());
        }
        Ok(trajectory)
    }

    /// Split mutable borrows for the trainer: weights, optimizer state and
    /// the shared config in one call.
    pub(crate) fn training_parts(
        &mut self,
    ) -> Result<(&mut PlrnnWeights, &mut AdamState, &EngineConfig)> {
        let weights = self.weights.as_mut().ok_or(EngineError::Uninitialized)?;
        Ok((weights, &mut self.adam, &self.config))
    }

    fn step(
        &self,
        weights: &PlrnnWeights,
        state: &StateVector,
        input: Option<&Array1<f32>>,
    ) -> StateVector {
        let cache = online::forward_cached(weights, &self.config, &state.latent, input);
        StateVector {
            latent: cache.z_next,
            observed: cache.x_next,
            uncertainty: state.uncertainty.mapv(|u| u + self.config.process_noise),
            timestamp: state.timestamp + self.config.dt_hours as f64,
            timestep: state.timestep + 1,
        }
    }

    fn latent_from_observation(
        &self,
        weights: &PlrnnWeights,
        observation: &Array1<f32>,
    ) -> Array1<f32> {
        let inverse = math::invert(&weights.b);
        math::sanitize(
            inverse.dot(&(observation - &weights.bias_x)),
            self.config.state_clamp,
        )
    }

    fn weights_ref(&self) -> Result<&PlrnnWeights> {
        self.weights.as_ref().ok_or(EngineError::Uninitialized)
    }

    fn check_dim(&self, got: usize) -> Result<()> {
        if got != self.config.state_dim {
            return Err(EngineError::DimensionMismatch {
                expected: self.config.state_dim,
                got,
            });
        }
        Ok(())
    }
}

fn assemble_forecast(trajectory: Vec<StateVector>, warnings: Vec<EarlyWarningSignal>) -> Forecast {
    let mean = trajectory.iter().map(|s| s.observed.clone()).collect();
    let ci95 = trajectory
        .iter()
        .map(|s| band(&s.observed, &s.uncertainty))
        .collect();
    Forecast {
        trajectory,
        mean,
        ci95,
        warnings,
    }
}

fn from_fusion(fused: FusionForecast, warnings: Vec<EarlyWarningSignal>) -> Forecast {
    Forecast {
        trajectory: fused.trajectory,
        mean: fused.mean,
        ci95: fused.ci95,
        warnings,
    }
}

/// Average both branch means; per step and dimension the wider band wins.
fn combine(
    fused: FusionForecast,
    rolled: Vec<StateVector>,
    warnings: Vec<EarlyWarningSignal>,
) -> Forecast {
    let len = fused.trajectory.len().min(rolled.len());
    let mut trajectory = Vec::with_capacity(len);
    let mut mean = Vec::with_capacity(len);
    let mut ci95 = Vec::with_capacity(len);

    for k in 0..len {
        let a = &fused.trajectory[k];
        let b = &rolled[k];
        let m = (&a.observed + &b.observed) / 2.0;
        let u = Array1::from_iter(
            a.uncertainty
                .iter()
                .zip(b.uncertainty.iter())
                .map(|(x, y)| x.max(*y)),
        );
        let snapshot = StateVector {
            latent: b.latent.clone(),
            observed: m.clone(),
            uncertainty: u,
            timestamp: b.timestamp,
            timestep: b.timestep,
        };
        mean.push(m);
        ci95.push(band(&snapshot.observed, &snapshot.uncertainty));
        trajectory.push(snapshot);
    }

    Forecast {
        trajectory,
        mean,
        ci95,
        warnings,
    }
}

/// 95% band around a mean given a per-dimension variance.
fn band(mean: &Array1<f32>, variance: &Array1<f32>) -> (Array1<f32>, Array1<f32>) {
    let half = variance.mapv(|v| 1.96 * v.max(0.0).sqrt());
    (mean - &half, mean + &half)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn engine() -> PlrnnEngine {
        let mut e = PlrnnEngine::new(EngineConfig::default()).unwrap();
        e.initialize();
        e
    }

    #[test]
    fn test_uninitialized_calls_fail() {
        let mut e = PlrnnEngine::new(EngineConfig::default()).unwrap();
        let s = StateVector::zeros(3, 0.0);
        let obs = arr1(&[0.1, 0.2, 0.3]);

        assert!(matches!(
            e.forward(&s, None),
            Err(EngineError::Uninitialized)
        ));
        assert!(matches!(
            e.predict(&s, 3, None),
            Err(EngineError::Uninitialized)
        ));
        assert!(matches!(
            e.observe(&obs, 1.0),
            Err(EngineError::Uninitialized)
        ));
        assert!(matches!(
            e.train_online(&s, &obs, None),
            Err(EngineError::Uninitialized)
        ));
        assert!(matches!(
            e.extract_causal_network(),
            Err(EngineError::Uninitialized)
        ));
        assert!(matches!(
            e.spectral_radius(),
            Err(EngineError::Uninitialized)
        ));
    }

    #[test]
    fn test_forward_is_deterministic_and_pure() {
        let e = engine();
        let mut s = StateVector::zeros(3, 5.0);
        s.latent = arr1(&[0.5, -0.5, 1.0]);
        let before = s.latent.clone();

        let a = e.forward(&s, None).unwrap();
        let b = e.forward(&s, None).unwrap();
        for (x, y) in a.latent.iter().zip(b.latent.iter()) {
            assert_eq!(x, y);
        }
        for (x, y) in s.latent.iter().zip(before.iter()) {
            assert_eq!(x, y);
        }
        assert_eq!(a.timestep, 1);
        assert!((a.timestamp - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_forward_rejects_wrong_dims() {
        let e = engine();
        let s = StateVector::zeros(4, 0.0);
        assert!(matches!(
            e.forward(&s, None),
            Err(EngineError::DimensionMismatch { expected: 3, got: 4 })
        ));

        let ok = StateVector::zeros(3, 0.0);
        let bad_input = arr1(&[1.0]);
        assert!(e.forward(&ok, Some(&bad_input)).is_err());
    }

    #[test]
    fn test_predict_returns_horizon_plus_one() {
        let e = engine();
        let s = StateVector::zeros(3, 0.0);
        for h in [0usize, 1, 7, 48] {
            let f = e.predict(&s, h, None).unwrap();
            assert_eq!(f.trajectory.len(), h + 1);
            assert_eq!(f.mean.len(), h + 1);
            assert_eq!(f.ci95.len(), h + 1);
        }
    }

    #[test]
    fn test_band_widens_with_horizon() {
        let e = engine();
        let s = StateVector::zeros(3, 0.0);
        let f = e.predict(&s, 10, None).unwrap();
        for k in 1..f.trajectory.len() {
            for i in 0..3 {
                assert!(f.trajectory[k].uncertainty[i] > f.trajectory[k - 1].uncertainty[i]);
            }
        }
    }

    #[test]
    fn test_thousand_forwards_stay_clamped() {
        let e = engine();
        let mut s = StateVector::zeros(3, 0.0);
        s.latent = arr1(&[1.0, -2.0, 3.0]);
        for _ in 0..1000 {
            s = e.forward(&s, None).unwrap();
            assert!(s.is_finite());
            for &v in s.latent.iter().chain(s.observed.iter()) {
                assert!(v.abs() <= 10.0, "escaped the clamp: {}", v);
            }
        }
        assert_eq!(s.timestep, 1000);
    }

    #[test]
    fn test_hybrid_horizon_lengths() {
        let mut e = engine();
        let mut s = StateVector::zeros(3, 0.0);
        for i in 0..8 {
            s = e.observe(&arr1(&[0.1 * i as f32, -0.2, 0.4]), i as f64).unwrap();
        }

        let short = e.hybrid_predict(&s, ForecastHorizon::Short).unwrap();
        assert_eq!(short.trajectory.len(), 4);
        let medium = e.hybrid_predict(&s, ForecastHorizon::Medium).unwrap();
        assert_eq!(medium.trajectory.len(), 13);
        let long = e.hybrid_predict(&s, ForecastHorizon::Long).unwrap();
        assert_eq!(long.trajectory.len(), 49);
    }

    #[test]
    fn test_medium_band_is_at_least_as_wide() {
        let mut e = engine();
        let mut s = StateVector::zeros(3, 0.0);
        for i in 0..6 {
            s = e.observe(&arr1(&[0.3, -0.1, 0.2]), i as f64).unwrap();
        }

        let medium = e.hybrid_predict(&s, ForecastHorizon::Medium).unwrap();
        let rolled = e.predict(&s, 12, None).unwrap();
        for k in 0..medium.trajectory.len() {
            for i in 0..3 {
                assert!(
                    medium.trajectory[k].uncertainty[i] >= rolled.trajectory[k].uncertainty[i] - 1e-6
                );
            }
        }
    }

    #[test]
    fn test_observe_advances_current_state() {
        let mut e = engine();
        let s1 = e.observe(&arr1(&[0.5, 0.1, -0.3]), 1.0).unwrap();
        assert_eq!(s1.timestep, 1);
        let s2 = e.observe(&arr1(&[0.6, 0.0, -0.2]), 2.0).unwrap();
        assert_eq!(s2.timestep, 2);
        assert_eq!(e.current_state().timestep, 2);
        assert!((e.current_state().observed[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_train_online_converges_on_fixed_target() {
        let mut e = engine();
        let mut s = StateVector::zeros(3, 0.0);
        s.latent = arr1(&[0.2, 0.2, 0.2]);
        let target = arr1(&[0.5, -0.3, 0.2]);

        let (_, first_loss) = e.train_online(&s, &target, None).unwrap();
        let mut last_loss = first_loss;
        for _ in 0..300 {
            let (_, loss) = e.train_online(&s, &target, None).unwrap();
            last_loss = loss;
        }
        assert!(
            last_loss < first_loss * 0.5,
            "loss {} -> {}",
            first_loss,
            last_loss
        );
    }

    #[test]
    fn test_train_online_returns_teacher_forced_state() {
        let mut e = engine();
        let s = StateVector::zeros(3, 0.0);
        let target = arr1(&[0.4, 0.1, -0.6]);
        let (next, loss) = e.train_online(&s, &target, None).unwrap();
        assert!(loss >= 0.0);
        assert_eq!(next.timestep, 1);
        for (x, y) in next.observed.iter().zip(target.iter()) {
            assert_eq!(x, y);
        }
    }

    #[test]
    fn test_exported_weights_reproduce_forward() {
        let a = engine();
        let mut b = PlrnnEngine::new(EngineConfig::default()).unwrap();
        b.load_weights(a.export_weights().unwrap()).unwrap();

        let mut s = StateVector::zeros(3, 0.0);
        s.latent = arr1(&[0.7, -0.2, 0.1]);
        let x = a.forward(&s, None).unwrap();
        let y = b.forward(&s, None).unwrap();
        for (p, q) in x.latent.iter().zip(y.latent.iter()) {
            assert_eq!(p, q);
        }
    }

    #[test]
    fn test_weight_file_roundtrip_reproduces_forward() {
        let dir = std::env::temp_dir().join("kairos_engine_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("weights.json");

        let a = engine();
        a.save_weights(&path).unwrap();

        let mut b = PlrnnEngine::new(EngineConfig::default()).unwrap();
        b.load_weights_file(&path).unwrap();

        let mut s = StateVector::zeros(3, 0.0);
        s.latent = arr1(&[0.3, 0.3, -0.9]);
        let x = a.forward(&s, None).unwrap();
        let y = b.forward(&s, None).unwrap();
        for (p, q) in x.observed.iter().zip(y.observed.iter()) {
            assert_eq!(p, q);
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_spectral_radius_is_positive() {
        let e = engine();
        let rho = e.spectral_radius().unwrap();
        assert!(rho > 0.0 && rho.is_finite());
    }

    #[test]
    fn test_input_shifts_the_trajectory() {
        let e = engine();
        let mut s = StateVector::zeros(3, 0.0);
        s.latent = arr1(&[0.1, 0.1, 0.1]);
        let push = arr1(&[1.0, 0.0, 0.0]);

        let plain = e.forward(&s, None).unwrap();
        let pushed = e.forward(&s, Some(&push)).unwrap();
        let diff: f32 = plain
            .latent
            .iter()
            .zip(pushed.latent.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(diff > 1e-6);
    }
}
