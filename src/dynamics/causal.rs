//! Causal network extraction from the trained connectivity.
//!
//! The connection matrix `w` tells which dimensions drive which: `w[i][j]`
//! is the influence of dimension `j` on dimension `i` one step later. L1
//! training pressure keeps `w` sparse, so thresholding its entries yields
//! a readable directed graph. The network is recomputed from the live
//! weights on every call and never persisted.

use serde::Serialize;

use crate::config::EngineConfig;
use crate::weights::PlrnnWeights;

/// Absolute weight below which a connection is treated as absent.
pub const EDGE_THRESHOLD: f32 = 0.1;

/// One state dimension as a graph node.
#[derive(Clone, Debug, Serialize)]
pub struct CausalNode {
    pub label: String,

    /// Autoregressive self-weight, from the diagonal `a`.
    pub self_weight: f32,

    /// Normalized L1 row+column mass of `w`; 1.0 marks the most connected
    /// dimension.
    pub centrality: f32,
}

/// A directed influence `from → to`.
#[derive(Clone, Debug, Serialize)]
pub struct CausalEdge {
    pub from: String,
    pub to: String,

    /// Signed connection weight `w[to][from]`.
    pub weight: f32,

    /// Influence lag, one sampling step.
    pub lag_hours: f32,

    /// |weight| relative to the strongest connection, in (0, 1].
    pub significance: f32,
}

/// A two-node reinforcing or dampening cycle.
#[derive(Clone, Debug, Serialize)]
pub struct FeedbackLoop {
    pub a: String,
    pub b: String,

    /// Product of the two directed weights; positive loops amplify.
    pub gain: f32,
}

/// The full extracted graph.
#[derive(Clone, Debug, Serialize)]
pub struct CausalNetwork {
    pub nodes: Vec<CausalNode>,
    pub edges: Vec<CausalEdge>,
    pub loops: Vec<FeedbackLoop>,

    /// Edges present over edges possible (self-connections excluded).
    pub density: f32,

    /// Label of the highest-centrality node.
    pub central_node: Option<String>,
}

/// Extract the causal graph from the current connectivity.
///
/// Self-influence is reported on the node (`self_weight`), not as an edge;
/// off-diagonal entries above `EDGE_THRESHOLD` become edges.
pub fn extract(weights: &PlrnnWeights, config: &EngineConfig) -> CausalNetwork {
    let n = weights.state_dim();
    let label = |i: usize| {
        config
            .dim_labels
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("dim{}", i))
    };

    let mut raw_centrality = vec![0.0_f32; n];
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            raw_centrality[i] += weights.w[[i, j]].abs() + weights.w[[j, i]].abs();
        }
    }
    let max_centrality = raw_centrality.iter().copied().fold(0.0_f32, f32::max);

    let nodes = (0..n)
        .map(|i| CausalNode {
            label: label(i),
            self_weight: weights.a[i],
            centrality: if max_centrality > 0.0 {
                raw_centrality[i] / max_centrality
            } else {
                0.0
            },
        })
        .collect::<Vec<_>>();

    let max_weight = (0..n)
        .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
        .map(|(i, j)| weights.w[[i, j]].abs())
        .fold(0.0_f32, f32::max);

    let mut edges = Vec::new();
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            let w = weights.w[[i, j]];
            if w.abs() > EDGE_THRESHOLD {
                edges.push(CausalEdge {
                    from: label(j),
                    to: label(i),
                    weight: w,
                    lag_hours: config.dt_hours,
                    significance: if max_weight > 0.0 {
                        w.abs() / max_weight
                    } else {
                        0.0
                    },
                });
            }
        }
    }

    let mut loops = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n {
            let forward = weights.w[[j, i]];
            let back = weights.w[[i, j]];
            if forward.abs() > EDGE_THRESHOLD && back.abs() > EDGE_THRESHOLD {
                loops.push(FeedbackLoop {
                    a: label(i),
                    b: label(j),
                    gain: forward * back,
                });
            }
        }
    }

    let possible = n * n.saturating_sub(1);
    let density = if possible > 0 {
        edges.len() as f32 / possible as f32
    } else {
        0.0
    };

    let central_node = nodes
        .iter()
        .max_by(|a, b| {
            a.centrality
                .partial_cmp(&b.centrality)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|node| node.label.clone());

    CausalNetwork {
        nodes,
        edges,
        loops,
        density,
        central_node,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn weights_with_w(w: ndarray::Array2<f32>) -> PlrnnWeights {
        let mut rng = StdRng::seed_from_u64(1);
        let mut weights = PlrnnWeights::init(&EngineConfig::default(), &mut rng);
        weights.w = w;
        weights
    }

    #[test]
    fn test_edges_follow_threshold() {
        let w = arr2(&[[0.0, 0.3, 0.05], [0.0, 0.0, -0.2], [0.09, 0.0, 0.0]]);
        let net = extract(&weights_with_w(w), &EngineConfig::default());

        // 0.3 (arousal→valence) and -0.2 (stress→arousal) survive.
        assert_eq!(net.edges.len(), 2);
        assert!(net
            .edges
            .iter()
            .any(|e| e.from == "arousal" && e.to == "valence"));
        assert!(net
            .edges
            .iter()
            .any(|e| e.from == "stress" && e.to == "arousal" && e.weight < 0.0));
    }

    #[test]
    fn test_lowering_one_entry_removes_exactly_that_edge() {
        let strong = arr2(&[[0.0, 0.3, 0.0], [0.4, 0.0, 0.0], [0.0, 0.0, 0.0]]);
        let net = extract(&weights_with_w(strong.clone()), &EngineConfig::default());
        assert_eq!(net.edges.len(), 2);

        let mut weakened = strong;
        weakened[[0, 1]] = 0.05;
        let net = extract(&weights_with_w(weakened), &EngineConfig::default());
        assert_eq!(net.edges.len(), 1);
        assert!(net.edges[0].from == "valence" && net.edges[0].to == "arousal");
    }

    #[test]
    fn test_two_node_feedback_loop() {
        let w = arr2(&[[0.0, 0.5, 0.0], [-0.3, 0.0, 0.0], [0.0, 0.0, 0.0]]);
        let net = extract(&weights_with_w(w), &EngineConfig::default());

        assert_eq!(net.loops.len(), 1);
        let l = &net.loops[0];
        assert_eq!(l.a, "valence");
        assert_eq!(l.b, "arousal");
        assert!((l.gain - (-0.15)).abs() < 1e-6);
    }

    #[test]
    fn test_centrality_and_central_node() {
        // Dimension 1 touches both others; it must be the central node.
        let w = arr2(&[[0.0, 0.4, 0.0], [0.3, 0.0, 0.3], [0.0, 0.2, 0.0]]);
        let net = extract(&weights_with_w(w), &EngineConfig::default());

        assert_eq!(net.central_node.as_deref(), Some("arousal"));
        let arousal = &net.nodes[1];
        assert!((arousal.centrality - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_density_counts_off_diagonal_pairs() {
        let w = arr2(&[[0.0, 0.3, 0.3], [0.3, 0.0, 0.3], [0.3, 0.3, 0.0]]);
        let net = extract(&weights_with_w(w), &EngineConfig::default());
        assert!((net.density - 1.0).abs() < 1e-6);

        let empty = ndarray::Array2::zeros((3, 3));
        let net = extract(&weights_with_w(empty), &EngineConfig::default());
        assert_eq!(net.edges.len(), 0);
        assert!((net.density).abs() < 1e-6);
    }

    #[test]
    fn test_significance_normalized_to_strongest() {
        let w = arr2(&[[0.0, 0.5, 0.0], [0.25, 0.0, 0.0], [0.0, 0.0, 0.0]]);
        let net = extract(&weights_with_w(w), &EngineConfig::default());

        let strongest = net
            .edges
            .iter()
            .find(|e| (e.weight - 0.5).abs() < 1e-6)
            .unwrap();
        let weaker = net
            .edges
            .iter()
            .find(|e| (e.weight - 0.25).abs() < 1e-6)
            .unwrap();
        assert!((strongest.significance - 1.0).abs() < 1e-6);
        assert!((weaker.significance - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_self_weight_reported_on_nodes() {
        let net = extract(
            &weights_with_w(ndarray::Array2::zeros((3, 3))),
            &EngineConfig::default(),
        );
        for (node, i) in net.nodes.iter().zip(0..3) {
            assert!(node.self_weight > 0.0, "node {} self weight", i);
        }
    }
}
