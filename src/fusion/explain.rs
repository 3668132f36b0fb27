//! Attention explanations.
//!
//! Reads the final-layer, head-averaged attention row of the newest window
//! position and ranks which past observations drove the current estimate.
//! Rows are softmax outputs, so weights are non-negative and sum to one.

use ndarray::{Array2, ArrayView1};
use serde::Serialize;

/// How the current attention mass is shaped over the window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AttentionPattern {
    /// The most recent observations dominate.
    RecencyBias,

    /// Mass concentrates on older, similar episodes.
    PatternMatching,

    /// At least half the mass already sits on the two newest positions,
    /// but without the ramp that marks recency bias.
    Uniform,
}

/// One window position's share of the attention mass.
#[derive(Clone, Debug, Serialize)]
pub struct AttentionInfluence {
    /// Window position, 0 = oldest retained observation.
    pub position: usize,

    /// Timestamp of that observation, epoch hours.
    pub timestamp: f64,

    /// Head-averaged attention weight.
    pub weight: f32,
}

/// Explanation of one estimate: the strongest influences plus a coarse
/// label for the overall shape.
#[derive(Clone, Debug, Serialize)]
pub struct AttentionExplanation {
    /// Up to five positions, strongest first.
    pub top_influences: Vec<AttentionInfluence>,

    pub pattern: AttentionPattern,
}

impl AttentionExplanation {
    fn empty() -> Self {
        Self {
            top_influences: Vec::new(),
            pattern: AttentionPattern::Uniform,
        }
    }
}

/// Build an explanation from an attention matrix and the window timestamps.
///
/// An empty matrix (no window yet) yields an empty ranking.
pub fn explain_attention(attention: &Array2<f32>, timestamps: &[f64]) -> AttentionExplanation {
    let len = attention.nrows();
    if len == 0 {
        return AttentionExplanation::empty();
    }
    let row = attention.row(len - 1);

    let mut ranked: Vec<AttentionInfluence> = row
        .iter()
        .enumerate()
        .map(|(position, &weight)| AttentionInfluence {
            position,
            timestamp: timestamps.get(position).copied().unwrap_or(0.0),
            weight,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(5);

    AttentionExplanation {
        top_influences: ranked,
        pattern: classify(row),
    }
}

/// Classify the shape of one attention row.
///
/// Recency bias: the mean of the last five weights is at least 1.5× the
/// mean of the first five. Otherwise the two newest positions decide:
/// under half the mass there means older episodes carry the estimate
/// (pattern matching); half or more leaves nothing older standing out.
fn classify(row: ArrayView1<'_, f32>) -> AttentionPattern {
    let len = row.len();
    let tail = 5.min(len);

    let recent: f32 = row.iter().rev().take(tail).sum::<f32>() / tail as f32;
    let early: f32 = row.iter().take(tail).sum::<f32>() / tail as f32;
    if recent > 0.0 && recent >= 1.5 * early {
        return AttentionPattern::RecencyBias;
    }

    let near: f32 = row.iter().rev().take(2).sum();
    if near < 0.5 {
        return AttentionPattern::PatternMatching;
    }
    AttentionPattern::Uniform
}
