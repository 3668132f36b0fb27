//! Hand-derived gradients for the piecewise-linear dynamics.
//!
//! No autodiff: the architecture is fixed, so the chain rule is written
//! out once. `forward_cached` keeps the intermediates one backward pass
//! needs; `backward_step` folds one step's gradients into an accumulator
//! and hands back `∂L/∂z` for the step before, which is what truncated
//! BPTT threads back through a window. The clamp is treated as identity
//! in the backward pass (straight-through).

use ndarray::Array1;

use crate::config::EngineConfig;
use crate::math;
use crate::optim::{AdamState, GradientAccumulator};
use crate::weights::PlrnnWeights;

/// Intermediates of one forward step.
#[derive(Clone, Debug)]
pub struct StepCache {
    /// Latent state the step started from.
    pub z: Array1<f32>,

    /// relu(z).
    pub relu_z: Array1<f32>,

    /// Dendritic pre-activation `dend_d·z + dend_bias`.
    pub dend_pre: Option<Array1<f32>>,

    /// Dendritic basis `relu(dend_pre)`.
    pub basis: Option<Array1<f32>>,

    /// Next latent state, clamped.
    pub z_next: Array1<f32>,

    /// Next observation estimate, clamped.
    pub x_next: Array1<f32>,
}

/// One forward step, returning every intermediate the backward pass reads.
pub fn forward_cached(
    weights: &PlrnnWeights,
    config: &EngineConfig,
    z: &Array1<f32>,
    input: Option<&Array1<f32>>,
) -> StepCache {
    let relu_z = z.mapv(|v| v.max(0.0));
    let mut pre = &weights.a * z + weights.w.dot(&relu_z) + &weights.bias_z;

    let (dend_pre, basis) = match (&weights.dend_c, &weights.dend_d, &weights.dend_bias) {
        (Some(c), Some(d), Some(bias)) => {
            let u = d.dot(z) + bias;
            let b = u.mapv(|v| v.max(0.0));
            pre = pre + c.dot(&b);
            (Some(u), Some(b))
        }
        _ => (None, None),
    };
    if let Some(s) = input {
        pre = pre + s;
    }

    let z_next = math::sanitize(pre, config.state_clamp);
    let x_next = math::sanitize(weights.b.dot(&z_next) + &weights.bias_x, config.state_clamp);

    StepCache {
        z: z.clone(),
        relu_z,
        dend_pre,
        basis,
        z_next,
        x_next,
    }
}

/// Fold one step's gradients into `accum`.
///
/// `target` contributes the squared-error observation loss at this step
/// (mean form, so `∂L/∂x = 2(x − t)/n`); `dz_upstream` is `∂L/∂z_next`
/// arriving from the step after. Returns `∂L/∂z` for the step before.
pub fn backward_step(
    weights: &PlrnnWeights,
    cache: &StepCache,
    target: Option<&Array1<f32>>,
    dz_upstream: &Array1<f32>,
    accum: &mut GradientAccumulator,
) -> Array1<f32> {
    let n = cache.z.len() as f32;

    let mut dz_next = dz_upstream.clone();
    if let Some(t) = target {
        let dx = (&cache.x_next - t) * (2.0 / n);
        accum.add("b", &math::outer(&dx, &cache.z_next));
        accum.add("bias_x", &dx);
        dz_next = dz_next + weights.b.t().dot(&dx);
    }

    accum.add("a", &(&dz_next * &cache.z));
    accum.add("w", &math::outer(&dz_next, &cache.relu_z));
    accum.add("bias_z", &dz_next);

    let relu_mask = cache.z.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
    let mut dz_prev = &weights.a * &dz_next + &(weights.w.t().dot(&dz_next) * &relu_mask);

    if let (Some(c), Some(d), Some(pre), Some(basis)) = (
        &weights.dend_c,
        &weights.dend_d,
        &cache.dend_pre,
        &cache.basis,
    ) {
        accum.add("dend_c", &math::outer(&dz_next, basis));
        let mask = pre.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        let du = c.t().dot(&dz_next) * &mask;
        accum.add("dend_d", &math::outer(&du, &cache.z));
        accum.add("dend_bias", &du);
        dz_prev = dz_prev + d.t().dot(&du);
    }

    dz_prev
}

/// L1 pressure on the connectivity (it doubles as the causal graph, so it
/// should stay sparse) and L2 decay on the weight matrices. Biases are
/// exempt.
pub fn add_regularization(
    weights: &PlrnnWeights,
    accum: &mut GradientAccumulator,
    l1: f32,
    l2: f32,
) {
    accum.add(
        "w",
        &weights.w.mapv(|v| {
            let sign = if v > 0.0 {
                1.0
            } else if v < 0.0 {
                -1.0
            } else {
                0.0
            };
            l1 * sign + 2.0 * l2 * v
        }),
    );
    accum.add("a", &weights.a.mapv(|v| 2.0 * l2 * v));
    accum.add("b", &weights.b.mapv(|v| 2.0 * l2 * v));
    if let Some(c) = &weights.dend_c {
        accum.add("dend_c", &c.mapv(|v| 2.0 * l2 * v));
    }
    if let Some(d) = &weights.dend_d {
        accum.add("dend_d", &d.mapv(|v| 2.0 * l2 * v));
    }
}

/// One Adam step over every parameter the accumulator holds.
pub fn apply_gradients(
    weights: &mut PlrnnWeights,
    accum: &GradientAccumulator,
    adam: &mut AdamState,
    lr: f32,
) {
    adam.begin_step();
    if let Some(g) = accum.get("a") {
        adam.apply("a", &mut weights.a, g, lr);
    }
    if let Some(g) = accum.get("w") {
        adam.apply("w", &mut weights.w, g, lr);
    }
    if let Some(g) = accum.get("b") {
        adam.apply("b", &mut weights.b, g, lr);
    }
    if let Some(g) = accum.get("bias_z") {
        adam.apply("bias_z", &mut weights.bias_z, g, lr);
    }
    if let Some(g) = accum.get("bias_x") {
        adam.apply("bias_x", &mut weights.bias_x, g, lr);
    }
    if let Some(c) = &mut weights.dend_c {
        if let Some(g) = accum.get("dend_c") {
            adam.apply("dend_c", c, g, lr);
        }
    }
    if let Some(d) = &mut weights.dend_d {
        if let Some(g) = accum.get("dend_d") {
            adam.apply("dend_d", d, g, lr);
        }
    }
    if let Some(b) = &mut weights.dend_bias {
        if let Some(g) = accum.get("dend_bias") {
            adam.apply("dend_bias", b, g, lr);
        }
    }
}

/// Mean squared error between prediction and target.
pub fn calculate_loss(prediction: &Array1<f32>, target: &Array1<f32>) -> f32 {
    let len = prediction.len().min(target.len());
    if len == 0 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..len {
        let d = prediction[i] - target[i];
        sum += d * d;
    }
    sum / len as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup(dendritic: usize) -> (EngineConfig, PlrnnWeights) {
        let config = EngineConfig {
            dendritic_bases: dendritic,
            ..EngineConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(13);
        let weights = PlrnnWeights::init(&config, &mut rng);
        (config, weights)
    }

    #[test]
    fn test_forward_cached_shapes() {
        let (config, weights) = setup(0);
        let cache = forward_cached(&weights, &config, &arr1(&[0.1, -0.5, 2.0]), None);
        assert_eq!(cache.z_next.len(), 3);
        assert_eq!(cache.x_next.len(), 3);
        assert!(cache.basis.is_none());
        assert!((cache.relu_z[1]).abs() < 1e-9);
    }

    #[test]
    fn test_forward_cached_dendritic_branch() {
        let (config, weights) = setup(4);
        let cache = forward_cached(&weights, &config, &arr1(&[0.5, 0.5, 0.5]), None);
        assert_eq!(cache.basis.as_ref().unwrap().len(), 4);
        assert!(cache.z_next.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_forward_respects_clamp() {
        let (config, mut weights) = setup(0);
        weights.bias_z.fill(1e6);
        let cache = forward_cached(&weights, &config, &arr1(&[0.0, 0.0, 0.0]), None);
        assert!(cache.z_next.iter().all(|&v| v.abs() <= config.state_clamp));
    }

    #[test]
    fn test_loss_zero_iff_equal() {
        let x = arr1(&[0.5, -0.2, 1.0]);
        let y = arr1(&[0.5, -0.2, 0.9]);
        assert_eq!(calculate_loss(&x, &x), 0.0);
        assert!(calculate_loss(&x, &y) > 0.0);
    }

    // Central-difference check of the w gradient on a single step.
    #[test]
    fn test_backward_matches_finite_difference() {
        let (config, mut weights) = setup(0);
        let z = arr1(&[0.4, -0.3, 0.8]);
        let target = arr1(&[0.2, 0.1, -0.5]);

        let cache = forward_cached(&weights, &config, &z, None);
        let mut accum = GradientAccumulator::new();
        let zero = Array1::zeros(3);
        backward_step(&weights, &cache, Some(&target), &zero, &mut accum);
        let analytic = accum.get("w").unwrap().to_vec();

        let eps = 1e-3_f32;
        for (flat, &g) in analytic.iter().enumerate() {
            let (i, j) = (flat / 3, flat % 3);
            let orig = weights.w[[i, j]];

            weights.w[[i, j]] = orig + eps;
            let plus = calculate_loss(&forward_cached(&weights, &config, &z, None).x_next, &target);
            weights.w[[i, j]] = orig - eps;
            let minus =
                calculate_loss(&forward_cached(&weights, &config, &z, None).x_next, &target);
            weights.w[[i, j]] = orig;

            let numeric = (plus - minus) / (2.0 * eps);
            assert!(
                (g - numeric).abs() < 1e-2,
                "w[{},{}]: analytic {} vs numeric {}",
                i,
                j,
                g,
                numeric
            );
        }
    }

    #[test]
    fn test_backward_threads_dz_to_previous_step() {
        let (config, weights) = setup(0);
        let cache = forward_cached(&weights, &config, &arr1(&[0.3, 0.3, 0.3]), None);
        let mut accum = GradientAccumulator::new();
        let up = arr1(&[1.0, 0.0, 0.0]);
        let dz_prev = backward_step(&weights, &cache, None, &up, &mut accum);
        assert_eq!(dz_prev.len(), 3);
        let norm: f32 = dz_prev.iter().map(|v| v * v).sum();
        assert!(norm > 0.0);
    }

    #[test]
    fn test_regularization_targets_connectivity() {
        let (_, weights) = setup(0);
        let mut accum = GradientAccumulator::new();
        add_regularization(&weights, &mut accum, 1e-3, 0.0);
        let w_grad = accum.get("w").unwrap();
        assert!(w_grad.iter().any(|g| g.abs() > 0.0));
        for (g, &v) in w_grad.iter().zip(weights.w.iter()) {
            assert!((g - 1e-3 * v.signum()).abs() < 1e-6 || v == 0.0);
        }
    }

    #[test]
    fn test_apply_gradients_moves_parameters() {
        let (config, mut weights) = setup(0);
        let before = weights.w.clone();

        let cache = forward_cached(&weights, &config, &arr1(&[0.5, 0.5, 0.5]), None);
        let mut accum = GradientAccumulator::new();
        backward_step(
            &weights,
            &cache,
            Some(&arr1(&[1.0, -1.0, 0.0])),
            &Array1::zeros(3),
            &mut accum,
        );
        accum.count_step();

        let mut adam = AdamState::new();
        apply_gradients(&mut weights, &accum, &mut adam, 1e-2);

        let moved: f32 = weights
            .w
            .iter()
            .zip(before.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(moved > 0.0);
        assert_eq!(adam.step_count(), 1);
    }
}
