//! Name-keyed gradient accumulation and Adam with bias correction.
//!
//! Parameters live in typed weight structs; the optimizer sees them as
//! name-keyed flat buffers. Buffers iterate in `ndarray` logical (row-major)
//! order, so a parameter and its moment buffers always line up. One
//! `AdamState` + `GradientAccumulator` pair is scoped to one trainer run.

use std::collections::HashMap;

use ndarray::{Array, Dimension};

/// First-moment decay.
pub const BETA1: f32 = 0.9;

/// Second-moment decay.
pub const BETA2: f32 = 0.999;

/// Denominator epsilon.
pub const EPS: f32 = 1e-8;

/// Per-parameter gradient sums keyed by parameter name.
#[derive(Clone, Debug, Default)]
pub struct GradientAccumulator {
    sums: HashMap<&'static str, Vec<f32>>,
    steps: usize,
}

impl GradientAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one step's gradient for a named parameter.
    pub fn add<D: Dimension>(&mut self, name: &'static str, grad: &Array<f32, D>) {
        let sum = self
            .sums
            .entry(name)
            .or_insert_with(|| vec![0.0; grad.len()]);
        if sum.len() != grad.len() {
            *sum = vec![0.0; grad.len()];
        }
        for (s, g) in sum.iter_mut().zip(grad.iter()) {
            *s += *g;
        }
    }

    /// Record that one more step contributed to the sums.
    pub fn count_step(&mut self) {
        self.steps += 1;
    }

    /// Number of contributing steps.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Multiply every sum by a factor (window normalization).
    pub fn scale(&mut self, factor: f32) {
        for sum in self.sums.values_mut() {
            for s in sum.iter_mut() {
                *s *= factor;
            }
        }
    }

    /// L2 norm over all accumulated gradients.
    pub fn global_norm(&self) -> f32 {
        self.sums
            .values()
            .flat_map(|v| v.iter())
            .map(|g| g * g)
            .sum::<f32>()
            .sqrt()
    }

    /// Rescale so the global norm does not exceed `max_norm`.
    /// Returns the norm before clipping.
    pub fn clip_global_norm(&mut self, max_norm: f32) -> f32 {
        let norm = self.global_norm();
        if norm > max_norm && norm > 0.0 {
            self.scale(max_norm / norm);
        }
        norm
    }

    /// Flat gradient buffer for a named parameter.
    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.sums.get(name).map(|v| v.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    /// Drop all sums and reset the step count.
    pub fn clear(&mut self) {
        self.sums.clear();
        self.steps = 0;
    }
}

/// Adam first/second moment buffers keyed by parameter name, with a global
/// step counter for bias correction.
#[derive(Clone, Debug, Default)]
pub struct AdamState {
    m: HashMap<&'static str, Vec<f32>>,
    v: HashMap<&'static str, Vec<f32>>,
    step: u64,
}

impl AdamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the shared step counter. Call once per optimizer step,
    /// before the per-parameter `apply` calls of that step.
    pub fn begin_step(&mut self) {
        self.step += 1;
    }

    /// Optimizer steps taken so far.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Bias-corrected Adam update of one named parameter in place.
    pub fn apply<D: Dimension>(
        &mut self,
        name: &'static str,
        param: &mut Array<f32, D>,
        grad: &[f32],
        lr: f32,
    ) {
        let n = param.len();
        let m = self.m.entry(name).or_insert_with(|| vec![0.0; n]);
        let v = self.v.entry(name).or_insert_with(|| vec![0.0; n]);
        if m.len() != n {
            *m = vec![0.0; n];
        }
        if v.len() != n {
            *v = vec![0.0; n];
        }

        let t = self.step.max(1) as i32;
        let correction1 = 1.0 - BETA1.powi(t);
        let correction2 = 1.0 - BETA2.powi(t);

        for (i, p) in param.iter_mut().enumerate() {
            let g = grad.get(i).copied().unwrap_or(0.0);
            m[i] = BETA1 * m[i] + (1.0 - BETA1) * g;
            v[i] = BETA2 * v[i] + (1.0 - BETA2) * g * g;
            let m_hat = m[i] / correction1;
            let v_hat = v[i] / correction2;
            *p -= lr * m_hat / (v_hat.sqrt() + EPS);
        }
    }

    /// Forget all moments (fresh run, same instance).
    pub fn reset(&mut self) {
        self.m.clear();
        self.v.clear();
        self.step = 0;
    }
}
