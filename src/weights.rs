//! Model weights for both engines.
//!
//! Typed, fixed-shape parameter structs with serde derives — the only
//! durable artifact this crate produces. Construction is always explicit:
//! `init(&config, &mut rng)` with a caller-owned seeded generator, never a
//! process-wide default. Export is a structural `Clone`; persistence is
//! JSON (nested numeric arrays plus the metadata block), and a
//! save→load round trip reproduces bit-identical predictions.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::encoder::EncoderLayer;
use crate::error::Result;
use crate::filter::KalmanMatrices;

/// Observation-noise variance for the initial Kalman R.
/// Self-reports on a ~[-5, 5] scale carry roughly half-point noise.
const OBS_NOISE: f32 = 0.25;

/// Provenance block carried inside every weight struct.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeightsMeta {
    /// Unix seconds at the last training run (0 if untrained).
    pub trained_at: u64,

    /// Observations consumed across all training runs.
    pub training_samples: u64,

    /// Best validation loss of the last run, if any run completed.
    pub validation_loss: Option<f32>,

    /// The exact configuration these weights were built for.
    pub config: EngineConfig,
}

impl WeightsMeta {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            trained_at: 0,
            training_samples: 0,
            validation_loss: None,
            config: config.clone(),
        }
    }

    /// Stamp the current wall-clock time as the training time.
    pub fn touch(&mut self) {
        self.trained_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
    }
}

/// Xavier-uniform matrix: U[−√(6/(fan_in+fan_out)), +√(6/(fan_in+fan_out))].
pub(crate) fn xavier(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f32> {
    let limit = (6.0 / (rows + cols) as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-limit..limit))
}

// ── PLRNN ───────────────────────────────────────────────────────────────

/// Piecewise-linear RNN parameters:
/// `z' = a⊙z + w·relu(z) + s + bias_z  (+ dend_c·relu(dend_d·z + dend_bias))`
/// `x' = b·z' + bias_x`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlrnnWeights {
    /// Diagonal autoregression a ∈ Rⁿ.
    pub a: Array1<f32>,

    /// Dense latent connectivity w ∈ Rⁿˣⁿ. Carries the causal structure.
    pub w: Array2<f32>,

    /// Observation map b ∈ Rⁿˣⁿ.
    pub b: Array2<f32>,

    /// Latent bias.
    pub bias_z: Array1<f32>,

    /// Observation bias.
    pub bias_x: Array1<f32>,

    /// Dendritic basis mixing c ∈ Rⁿˣᵐ (None when bases are disabled).
    pub dend_c: Option<Array2<f32>>,

    /// Dendritic basis projection d ∈ Rᵐˣⁿ.
    pub dend_d: Option<Array2<f32>>,

    /// Dendritic thresholds ∈ Rᵐ.
    pub dend_bias: Option<Array1<f32>>,

    pub meta: WeightsMeta,
}

impl PlrnnWeights {
    /// Xavier-scaled initialization; the diagonal `a` is drawn from
    /// U[0.8, 0.95] so the linear part starts contractive and slow.
    pub fn init(config: &EngineConfig, rng: &mut StdRng) -> Self {
        let n = config.state_dim;
        let m = config.dendritic_bases;

        let a = Array1::from_shape_fn(n, |_| rng.gen_range(0.8..0.95));
        let w = xavier(n, n, rng);
        let b = xavier(n, n, rng);

        let (dend_c, dend_d, dend_bias) = if m > 0 {
            let c = xavier(n, m, rng);
            let d = xavier(m, n, rng);
            let bias = Array1::from_shape_fn(m, |_| rng.gen_range(-1.0..1.0));
            (Some(c), Some(d), Some(bias))
        } else {
            (None, None, None)
        };

        Self {
            a,
            w,
            b,
            bias_z: Array1::zeros(n),
            bias_x: Array1::zeros(n),
            dend_c,
            dend_d,
            dend_bias,
            meta: WeightsMeta::new(config),
        }
    }

    pub fn state_dim(&self) -> usize {
        self.a.len()
    }

    pub fn has_dendritic(&self) -> bool {
        self.dend_c.is_some()
    }

    pub fn param_count(&self) -> usize {
        let dend = self.dend_c.as_ref().map_or(0, |c| c.len())
            + self.dend_d.as_ref().map_or(0, |d| d.len())
            + self.dend_bias.as_ref().map_or(0, |b| b.len());
        self.a.len() + self.w.len() + self.b.len() + self.bias_z.len() + self.bias_x.len() + dend
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(self, path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

// ── KalmanFormer ────────────────────────────────────────────────────────

/// Kalman matrices + encoder stack + fusion heads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KalmanFormerWeights {
    /// Linear-Gaussian model the filter branch runs on.
    pub kalman: KalmanMatrices,

    /// Observation embedding (embed_dim × state_dim).
    pub w_obs: Array2<f32>,

    /// Learned positional table (window_size × embed_dim).
    pub positional: Array2<f32>,

    /// Encoder layers.
    pub layers: Vec<EncoderLayer>,

    /// Attention-branch output projection (state_dim × embed_dim) + bias.
    pub w_out: Array2<f32>,
    pub b_out: Array1<f32>,

    /// Sigmoid gain head over the context (state_dim × embed_dim), present
    /// only when `learned_gain` is configured.
    pub gain_w: Option<Array2<f32>>,
    pub gain_b: Option<Array1<f32>>,

    pub meta: WeightsMeta,
}

impl KalmanFormerWeights {
    pub fn init(config: &EngineConfig, rng: &mut StdRng) -> Self {
        let n = config.state_dim;
        let e = config.embed_dim;

        // Small-normal positional table, transformer style.
        let pos_dist = Normal::new(0.0_f32, 0.02).unwrap();
        let positional =
            Array2::from_shape_fn((config.window_size, e), |_| pos_dist.sample(rng));

        let layers = (0..config.num_layers)
            .map(|_| EncoderLayer::init(e, config.ff_dim, rng))
            .collect();

        let (gain_w, gain_b) = if config.learned_gain {
            // Zero bias puts the initial learned gain at sigmoid(0) = 0.5.
            (Some(xavier(n, e, rng)), Some(Array1::zeros(n)))
        } else {
            (None, None)
        };

        Self {
            kalman: KalmanMatrices::identity(n, config.process_noise, OBS_NOISE),
            w_obs: xavier(e, n, rng),
            positional,
            layers,
            w_out: xavier(n, e, rng),
            b_out: Array1::zeros(n),
            gain_w,
            gain_b,
            meta: WeightsMeta::new(config),
        }
    }

    pub fn state_dim(&self) -> usize {
        self.w_out.nrows()
    }

    pub fn embed_dim(&self) -> usize {
        self.w_obs.nrows()
    }

    pub fn param_count(&self) -> usize {
        let heads = self.gain_w.as_ref().map_or(0, |w| w.len())
            + self.gain_b.as_ref().map_or(0, |b| b.len());
        self.kalman.a.len()
            + self.kalman.h.len()
            + self.kalman.q.len()
            + self.kalman.r.len()
            + self.w_obs.len()
            + self.positional.len()
            + self.layers.iter().map(|l| l.param_count()).sum::<usize>()
            + self.w_out.len()
            + self.b_out.len()
            + heads
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(self, path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

// ── persistence ─────────────────────────────────────────────────────────

fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let json = serde_json::to_string(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn cfg() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn test_plrnn_init_shapes() {
        let mut rng = StdRng::seed_from_u64(7);
        let w = PlrnnWeights::init(&cfg(), &mut rng);
        assert_eq!(w.a.len(), 3);
        assert_eq!(w.w.dim(), (3, 3));
        assert_eq!(w.b.dim(), (3, 3));
        assert!(!w.has_dendritic());
    }

    #[test]
    fn test_plrnn_diagonal_in_stability_band() {
        let mut rng = StdRng::seed_from_u64(11);
        let w = PlrnnWeights::init(&cfg(), &mut rng);
        for &v in w.a.iter() {
            assert!((0.8..0.95).contains(&v), "a = {}", v);
        }
    }

    #[test]
    fn test_init_is_seed_deterministic() {
        let mut r1 = StdRng::seed_from_u64(99);
        let mut r2 = StdRng::seed_from_u64(99);
        let w1 = PlrnnWeights::init(&cfg(), &mut r1);
        let w2 = PlrnnWeights::init(&cfg(), &mut r2);
        for (x, y) in w1.w.iter().zip(w2.w.iter()) {
            assert_eq!(x, y);
        }
    }

    #[test]
    fn test_dendritic_bases_optional() {
        let config = EngineConfig {
            dendritic_bases: 4,
            ..cfg()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let w = PlrnnWeights::init(&config, &mut rng);
        assert!(w.has_dendritic());
        assert_eq!(w.dend_c.as_ref().unwrap().dim(), (3, 4));
        assert_eq!(w.dend_d.as_ref().unwrap().dim(), (4, 3));
        assert_eq!(w.dend_bias.as_ref().unwrap().len(), 4);
    }

    #[test]
    fn test_kalmanformer_init_shapes() {
        let mut rng = StdRng::seed_from_u64(5);
        let config = cfg();
        let w = KalmanFormerWeights::init(&config, &mut rng);
        assert_eq!(w.layers.len(), config.num_layers);
        assert_eq!(w.w_obs.dim(), (config.embed_dim, config.state_dim));
        assert_eq!(w.positional.dim(), (config.window_size, config.embed_dim));
        assert_eq!(w.w_out.dim(), (config.state_dim, config.embed_dim));
        assert!(w.gain_w.is_some());
    }

    #[test]
    fn test_gain_head_absent_without_learned_gain() {
        let config = EngineConfig {
            learned_gain: false,
            ..cfg()
        };
        let mut rng = StdRng::seed_from_u64(5);
        let w = KalmanFormerWeights::init(&config, &mut rng);
        assert!(w.gain_w.is_none());
        assert!(w.gain_b.is_none());
    }

    #[test]
    fn test_json_roundtrip_is_exact() {
        let dir = std::env::temp_dir().join("kairos_weights_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("plrnn.json");

        let mut rng = StdRng::seed_from_u64(21);
        let w = PlrnnWeights::init(&cfg(), &mut rng);
        w.save(&path).unwrap();
        let back = PlrnnWeights::load(&path).unwrap();

        for (x, y) in w.w.iter().zip(back.w.iter()) {
            assert_eq!(x, y);
        }
        for (x, y) in w.a.iter().zip(back.a.iter()) {
            assert_eq!(x, y);
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_param_count_positive_and_stable() {
        let mut rng = StdRng::seed_from_u64(1);
        let p = PlrnnWeights::init(&cfg(), &mut rng);
        // a(3) + w(9) + b(9) + bias_z(3) + bias_x(3)
        assert_eq!(p.param_count(), 27);

        let k = KalmanFormerWeights::init(&cfg(), &mut rng);
        assert!(k.param_count() > 0);
    }

    #[test]
    fn test_meta_touch_sets_timestamp() {
        let mut meta = WeightsMeta::new(&cfg());
        assert_eq!(meta.trained_at, 0);
        meta.touch();
        assert!(meta.trained_at > 0);
    }
}
