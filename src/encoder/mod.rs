//! Sequence encoder — bounded-window self-attention over embedded
//! observations.
//!
//! The window (default 24 observations) is embedded as
//! `w_obs·obs + positional[pos] + time_features(hour, day_of_week)` and run
//! through a small stack of multi-head attention layers. The last window
//! position is the "current context" the fusion engine reads; the final
//! layer's head-averaged attention matrix is kept for explanations.

pub mod attention;
pub mod embedding;

use ndarray::Array2;

pub use attention::EncoderLayer;

use crate::config::EngineConfig;
use crate::weights::KalmanFormerWeights;

/// Output of one encoder pass over a window.
#[derive(Clone, Debug)]
pub struct EncodedContext {
    /// Per-position embeddings after the full stack, `[len, embed_dim]`.
    pub context: Array2<f32>,

    /// Final-layer attention, averaged over heads, `[len, len]`.
    /// Row `i` is how position `i` distributes its attention.
    pub attention: Array2<f32>,
}

impl EncodedContext {
    /// The current context: the last window position's embedding.
    ///
    /// Panics on an empty context. `encode_window` produces one only for
    /// an empty window, so check `context.nrows()` first on that path.
    pub fn current(&self) -> ndarray::ArrayView1<'_, f32> {
        self.context.row(self.context.nrows() - 1)
    }

    /// Attention row of the last position — the basis for explanations.
    ///
    /// Panics on an empty context, like [`current`](Self::current).
    pub fn current_attention(&self) -> ndarray::ArrayView1<'_, f32> {
        self.attention.row(self.attention.nrows() - 1)
    }
}

/// Encode a window of `(observation, timestamp)` pairs, oldest first.
///
/// Windows longer than `config.window_size` use only the newest
/// `window_size` entries. An empty window yields empty matrices (the
/// insufficient-data policy; callers check before reading `current`).
pub fn encode_window(
    window: &[(ndarray::Array1<f32>, f64)],
    weights: &KalmanFormerWeights,
    config: &EngineConfig,
) -> EncodedContext {
    let take = window.len().min(config.window_size);
    if take == 0 {
        return EncodedContext {
            context: Array2::zeros((0, config.embed_dim)),
            attention: Array2::zeros((0, 0)),
        };
    }
    let window = &window[window.len() - take..];

    let mut x = Array2::zeros((take, config.embed_dim));
    for (pos, (obs, ts)) in window.iter().enumerate() {
        let e = embedding::embed(obs, pos, *ts, weights);
        x.row_mut(pos).assign(&e);
    }

    let mut attention = Array2::zeros((take, take));
    for layer in &weights.layers {
        let (next, attn) = layer.forward(&x, config.num_heads, config.attention_temperature);
        x = next;
        attention = attn;
    }

    EncodedContext {
        context: x,
        attention,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup() -> (EngineConfig, KalmanFormerWeights) {
        let config = EngineConfig::default();
        let mut rng = StdRng::seed_from_u64(17);
        let weights = KalmanFormerWeights::init(&config, &mut rng);
        (config, weights)
    }

    fn window(len: usize) -> Vec<(ndarray::Array1<f32>, f64)> {
        (0..len)
            .map(|i| (arr1(&[0.1 * i as f32, -0.2, 0.3]), i as f64))
            .collect()
    }

    #[test]
    fn test_encode_shapes() {
        let (config, weights) = setup();
        let ctx = encode_window(&window(10), &weights, &config);
        assert_eq!(ctx.context.dim(), (10, config.embed_dim));
        assert_eq!(ctx.attention.dim(), (10, 10));
        assert_eq!(ctx.current().len(), config.embed_dim);
    }

    #[test]
    fn test_window_is_bounded() {
        let (config, weights) = setup();
        let ctx = encode_window(&window(40), &weights, &config);
        assert_eq!(ctx.context.nrows(), config.window_size);
    }

    #[test]
    fn test_empty_window_yields_empty_context() {
        let (config, weights) = setup();
        let ctx = encode_window(&[], &weights, &config);
        assert_eq!(ctx.context.nrows(), 0);
    }

    #[test]
    fn test_current_reads_the_newest_position() {
        let (config, weights) = setup();
        let ctx = encode_window(&window(6), &weights, &config);
        for (a, b) in ctx.current().iter().zip(ctx.context.row(5).iter()) {
            assert_eq!(a, b);
        }
        assert_eq!(ctx.current_attention().len(), 6);
    }

    #[test]
    fn test_attention_rows_are_distributions() {
        let (config, weights) = setup();
        let ctx = encode_window(&window(8), &weights, &config);
        for row in ctx.attention.rows() {
            let sum: f32 = row.sum();
            assert!((sum - 1.0).abs() < 1e-4, "row sum = {}", sum);
            assert!(row.iter().all(|&w| w >= 0.0));
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let (config, weights) = setup();
        let a = encode_window(&window(6), &weights, &config);
        let b = encode_window(&window(6), &weights, &config);
        for (x, y) in a.context.iter().zip(b.context.iter()) {
            assert_eq!(x, y);
        }
    }

    #[test]
    fn test_context_is_finite() {
        let (config, weights) = setup();
        let ctx = encode_window(&window(24), &weights, &config);
        assert!(ctx.context.iter().all(|v| v.is_finite()));
    }
}
