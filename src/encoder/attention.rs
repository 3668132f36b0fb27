//! Multi-head self-attention encoder layer.
//!
//! Standard pre-softmax scaling: `softmax(Q·Kᵗ / (√head_dim · τ))` with τ
//! the configured temperature. Each layer is attention + a two-layer ReLU
//! feed-forward, both wrapped in residual layer-norms. The per-head
//! attention maps are averaged into one `[len, len]` matrix so downstream
//! explanations can read where the encoder looked.

use ndarray::{s, Array1, Array2, ArrayViewMut1};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::weights::xavier;

const LN_EPS: f32 = 1e-6;

/// One encoder layer: multi-head attention + feed-forward, each with a
/// residual layer-norm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncoderLayer {
    pub w_q: Array2<f32>,
    pub w_k: Array2<f32>,
    pub w_v: Array2<f32>,
    pub w_o: Array2<f32>,

    /// Feed-forward up-projection (ff_dim × embed_dim) and bias.
    pub ff_w1: Array2<f32>,
    pub ff_b1: Array1<f32>,

    /// Feed-forward down-projection (embed_dim × ff_dim) and bias.
    pub ff_w2: Array2<f32>,
    pub ff_b2: Array1<f32>,

    pub ln1_gamma: Array1<f32>,
    pub ln1_beta: Array1<f32>,
    pub ln2_gamma: Array1<f32>,
    pub ln2_beta: Array1<f32>,
}

impl EncoderLayer {
    pub(crate) fn init(embed_dim: usize, ff_dim: usize, rng: &mut StdRng) -> Self {
        Self {
            w_q: xavier(embed_dim, embed_dim, rng),
            w_k: xavier(embed_dim, embed_dim, rng),
            w_v: xavier(embed_dim, embed_dim, rng),
            w_o: xavier(embed_dim, embed_dim, rng),
            ff_w1: xavier(ff_dim, embed_dim, rng),
            ff_b1: Array1::zeros(ff_dim),
            ff_w2: xavier(embed_dim, ff_dim, rng),
            ff_b2: Array1::zeros(embed_dim),
            ln1_gamma: Array1::ones(embed_dim),
            ln1_beta: Array1::zeros(embed_dim),
            ln2_gamma: Array1::ones(embed_dim),
            ln2_beta: Array1::zeros(embed_dim),
        }
    }

    /// Run the layer over `x` (`[len, embed_dim]`, one row per position).
    ///
    /// Returns the transformed sequence and the head-averaged attention
    /// matrix. `num_heads` must divide the embedding width; config
    /// validation enforces that before any layer is built.
    pub fn forward(
        &self,
        x: &Array2<f32>,
        num_heads: usize,
        temperature: f32,
    ) -> (Array2<f32>, Array2<f32>) {
        let len = x.nrows();
        let embed = x.ncols();
        let head_dim = embed / num_heads;
        let scale = (head_dim as f32).sqrt() * temperature.max(1e-6);

        let q = x.dot(&self.w_q.t());
        let k = x.dot(&self.w_k.t());
        let v = x.dot(&self.w_v.t());

        let mut concat = Array2::zeros((len, embed));
        let mut attn_sum = Array2::zeros((len, len));

        for h in 0..num_heads {
            let lo = h * head_dim;
            let hi = lo + head_dim;
            let qh = q.slice(s![.., lo..hi]);
            let kh = k.slice(s![.., lo..hi]);
            let vh = v.slice(s![.., lo..hi]);

            let mut scores = qh.dot(&kh.t());
            scores.mapv_inplace(|s| s / scale);
            for mut row in scores.rows_mut() {
                softmax_inplace(&mut row);
            }

            let out = scores.dot(&vh);
            concat.slice_mut(s![.., lo..hi]).assign(&out);
            attn_sum += &scores;
        }
        let attn = attn_sum / num_heads as f32;

        let attended = concat.dot(&self.w_o.t());

        let mut out = Array2::zeros((len, embed));
        for i in 0..len {
            let residual = &x.row(i) + &attended.row(i);
            let normed = layer_norm(&residual, &self.ln1_gamma, &self.ln1_beta);
            let hidden = (self.ff_w1.dot(&normed) + &self.ff_b1).mapv(|v| v.max(0.0));
            let ff = self.ff_w2.dot(&hidden) + &self.ff_b2;
            let final_row = layer_norm(&(&normed + &ff), &self.ln2_gamma, &self.ln2_beta);
            out.row_mut(i).assign(&final_row);
        }

        (out, attn)
    }

    pub fn param_count(&self) -> usize {
        self.w_q.len()
            + self.w_k.len()
            + self.w_v.len()
            + self.w_o.len()
            + self.ff_w1.len()
            + self.ff_b1.len()
            + self.ff_w2.len()
            + self.ff_b2.len()
            + self.ln1_gamma.len()
            + self.ln1_beta.len()
            + self.ln2_gamma.len()
            + self.ln2_beta.len()
    }
}

/// Max-stabilized softmax over one score row.
fn softmax_inplace(row: &mut ArrayViewMut1<'_, f32>) {
    let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
}

/// Layer norm over one embedding row.
pub fn layer_norm(x: &Array1<f32>, gamma: &Array1<f32>, beta: &Array1<f32>) -> Array1<f32> {
    let mean = x.mean().unwrap_or(0.0);
    let var = x.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0);
    let inv = 1.0 / (var + LN_EPS).sqrt();
    let mut out = x.mapv(|v| (v - mean) * inv);
    out *= gamma;
    out += beta;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;
    use rand::SeedableRng;

    fn layer(embed: usize, ff: usize) -> EncoderLayer {
        let mut rng = StdRng::seed_from_u64(42);
        EncoderLayer::init(embed, ff, &mut rng)
    }

    fn sequence(len: usize, embed: usize) -> Array2<f32> {
        Array2::from_shape_fn((len, embed), |(i, j)| ((i * embed + j) as f32 * 0.01).sin())
    }

    #[test]
    fn test_forward_shapes() {
        let l = layer(8, 16);
        let x = sequence(5, 8);
        let (out, attn) = l.forward(&x, 2, 1.0);
        assert_eq!(out.dim(), (5, 8));
        assert_eq!(attn.dim(), (5, 5));
    }

    #[test]
    fn test_attention_rows_normalized() {
        let l = layer(8, 16);
        let x = sequence(6, 8);
        let (_, attn) = l.forward(&x, 4, 1.0);
        for row in attn.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_low_temperature_sharpens_attention() {
        let l = layer(8, 16);
        let x = sequence(6, 8);
        let (_, sharp) = l.forward(&x, 2, 0.25);
        let (_, soft) = l.forward(&x, 2, 4.0);
        let peak = |a: &Array2<f32>| a.iter().copied().fold(f32::MIN, f32::max);
        assert!(peak(&sharp) >= peak(&soft));
    }

    #[test]
    fn test_layer_norm_centers_and_scales() {
        let x = arr1(&[1.0, 2.0, 3.0, 4.0]);
        let gamma = Array1::ones(4);
        let beta = Array1::zeros(4);
        let y = layer_norm(&x, &gamma, &beta);
        let mean = y.mean().unwrap();
        let var = y.mapv(|v| (v - mean) * (v - mean)).mean().unwrap();
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_layer_norm_constant_input_stays_finite() {
        let x = arr1(&[2.0, 2.0, 2.0]);
        let y = layer_norm(&x, &Array1::ones(3), &Array1::zeros(3));
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_forward_output_finite() {
        let l = layer(16, 32);
        let x = sequence(24, 16);
        let (out, _) = l.forward(&x, 4, 1.0);
        assert!(out.iter().all(|v| v.is_finite()));
    }
}
