//! Engine configuration.
//!
//! One flat, fully-overridable options object shared by the filter, the
//! encoder, the fusion engine, the PLRNN and the trainer. Every field has a
//! documented default; construct with `EngineConfig::default()` and override
//! what you need. One config maps to exactly one subject's engine instance.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Learning-rate schedule applied after warmup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LrSchedule {
    /// Fixed learning rate for the whole run.
    Constant,
    /// Halve the rate every 10 epochs.
    Step,
    /// Multiply by 0.95 each epoch.
    Exponential,
    /// Cosine-anneal from the base rate down to `lr_min`.
    Cosine,
}

/// Flat configuration for a per-subject engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of observed/latent dimensions (3–5 in practice, ≤ 8).
    pub state_dim: usize,

    /// Human-readable labels for each state dimension. Drives the causal,
    /// intervention and explanation surfaces.
    pub dim_labels: Vec<String>,

    /// Sampling interval of the regular grid, in hours.
    pub dt_hours: f32,

    /// Component-wise clamp applied to every latent/observed value.
    pub state_clamp: f32,

    /// Per-step variance growth used for rollout confidence intervals.
    pub process_noise: f32,

    /// Number of dendritic basis functions (0 disables the dendritic term).
    pub dendritic_bases: usize,

    // ── sequence encoder ────────────────────────────────────────────────
    /// Bounded observation window the encoder attends over.
    pub window_size: usize,

    /// Embedding width (≤ 128).
    pub embed_dim: usize,

    /// Attention heads. Must divide `embed_dim`.
    pub num_heads: usize,

    /// Encoder layers.
    pub num_layers: usize,

    /// Feed-forward hidden width.
    pub ff_dim: usize,

    /// Softmax temperature for attention scores.
    pub attention_temperature: f32,

    // ── fusion ──────────────────────────────────────────────────────────
    /// Learn the Kalman gain from context via a sigmoid head instead of the
    /// analytic gain.
    pub learned_gain: bool,

    /// Initial Kalman/attention blend ratio (0 = pure filter, 1 = pure
    /// attention). Adapted online within [0.2, 0.8].
    pub blend_ratio: f32,

    // ── learning ────────────────────────────────────────────────────────
    /// Adam base learning rate.
    pub learning_rate: f32,

    /// L1 penalty on the connection matrix `w` (sparsity).
    pub l1_weight: f32,

    /// L2 penalty on all weights.
    pub l2_weight: f32,

    /// Global gradient-norm clip.
    pub gradient_clip: f32,

    // ── trainer ─────────────────────────────────────────────────────────
    /// Maximum training epochs.
    pub epochs: usize,

    /// Truncated-BPTT window length, in steps.
    pub bptt_window: usize,

    /// Overlap between consecutive BPTT windows, in steps.
    pub bptt_overlap: usize,

    /// Extra rollout horizons for the auxiliary multi-horizon loss.
    pub horizons: Vec<usize>,

    /// Loss weight per entry of `horizons` (same arity).
    pub horizon_weights: Vec<f32>,

    /// Initial probability of substituting the ground-truth next value
    /// during training.
    pub teacher_forcing: f32,

    /// Per-epoch exponential decay of the teacher-forcing probability.
    pub teacher_forcing_decay: f32,

    /// Schedule applied after warmup.
    pub lr_schedule: LrSchedule,

    /// Floor for decaying schedules.
    pub lr_min: f32,

    /// Epochs without validation improvement before stopping.
    pub patience: usize,

    /// Fraction of BPTT windows held out for validation (tail split).
    pub validation_split: f32,

    /// Linearly interpolate irregular timestamps onto the `dt_hours` grid
    /// before training.
    pub interpolate: bool,

    /// Z-score each dimension per subject before training.
    pub normalize: bool,

    /// Seed for every random path: weight init, teacher-forcing draws,
    /// synthetic data.
    pub seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dim: 3,
            dim_labels: vec![
                "valence".to_string(),
                "arousal".to_string(),
                "stress".to_string(),
            ],
            dt_hours: 1.0,
            state_clamp: 10.0,
            process_noise: 0.05,
            dendritic_bases: 0,
            window_size: 24,
            embed_dim: 32,
            num_heads: 4,
            num_layers: 2,
            ff_dim: 64,
            attention_temperature: 1.0,
            learned_gain: true,
            blend_ratio: 0.5,
            learning_rate: 1e-2,
            l1_weight: 1e-3,
            l2_weight: 1e-4,
            gradient_clip: 5.0,
            epochs: 50,
            bptt_window: 10,
            bptt_overlap: 2,
            horizons: vec![1, 3, 12],
            horizon_weights: vec![1.0, 0.5, 0.25],
            teacher_forcing: 0.5,
            teacher_forcing_decay: 0.95,
            lr_schedule: LrSchedule::Cosine,
            lr_min: 1e-5,
            patience: 5,
            validation_split: 0.2,
            interpolate: true,
            normalize: true,
            seed: 42,
        }
    }
}

impl EngineConfig {
    /// Check internal consistency. Call once after assembling overrides.
    pub fn validate(&self) -> Result<()> {
        if self.state_dim == 0 {
            return Err(EngineError::InvalidConfig("state_dim must be > 0".into()));
        }
        if self.dim_labels.len() != self.state_dim {
            return Err(EngineError::InvalidConfig(format!(
                "dim_labels has {} entries for state_dim {}",
                self.dim_labels.len(),
                self.state_dim
            )));
        }
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(EngineError::InvalidConfig(format!(
                "num_heads {} must divide embed_dim {}",
                self.num_heads, self.embed_dim
            )));
        }
        if self.horizons.len() != self.horizon_weights.len() {
            return Err(EngineError::InvalidConfig(format!(
                "{} horizons but {} horizon_weights",
                self.horizons.len(),
                self.horizon_weights.len()
            )));
        }
        if self.bptt_window < 2 {
            return Err(EngineError::InvalidConfig(
                "bptt_window must be at least 2".into(),
            ));
        }
        if self.bptt_overlap >= self.bptt_window {
            return Err(EngineError::InvalidConfig(format!(
                "bptt_overlap {} must be smaller than bptt_window {}",
                self.bptt_overlap, self.bptt_window
            )));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(EngineError::InvalidConfig(
                "validation_split must be in [0, 1)".into(),
            ));
        }
        if self.dt_hours <= 0.0 {
            return Err(EngineError::InvalidConfig("dt_hours must be > 0".into()));
        }
        if self.window_size == 0 {
            return Err(EngineError::InvalidConfig("window_size must be > 0".into()));
        }
        Ok(())
    }

    /// Index of a dimension label, or the typed unknown-label error.
    pub fn dim_index(&self, label: &str) -> Result<usize> {
        self.dim_labels
            .iter()
            .position(|l| l == label)
            .ok_or_else(|| EngineError::UnknownDimension(label.to_string()))
    }
}
