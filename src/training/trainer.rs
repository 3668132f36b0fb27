//! Truncated backpropagation through time over overlapping windows.
//!
//! Each epoch walks fixed-length windows across the prepared sequence.
//! A window is rolled forward once, with each step's starting latent
//! drawn from ground truth with the scheduled teacher-forcing
//! probability, then unrolled backward threading `∂L/∂z` across the
//! free-running boundaries only. Multi-horizon targets past the window
//! end contribute weighted auxiliary chains. One optimizer step per
//! window; the tail of the window list is held out for validation, which
//! drives early stopping and best-weight restoration.

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::dynamics::online::{self, StepCache};
use crate::dynamics::PlrnnEngine;
use crate::error::{EngineError, Result};
use crate::math;
use crate::optim::GradientAccumulator;
use crate::weights::PlrnnWeights;

use super::data::TrainingSequence;
use super::schedule;

/// Every parameter name the accumulator may carry, for cross-accumulator
/// merges.
const PARAM_NAMES: [&str; 8] = [
    "a", "w", "b", "bias_z", "bias_x", "dend_c", "dend_d", "dend_bias",
];

/// Validation improvements smaller than this do not reset patience.
const IMPROVEMENT_EPS: f32 = 1e-6;

/// What a training run did, epoch by epoch.
#[derive(Clone, Debug, Serialize)]
pub struct TrainingReport {
    pub epochs_run: usize,

    /// Mean window loss of the last completed epoch.
    pub final_training_loss: f32,

    /// Best validation loss seen; `None` when no windows were held out.
    pub best_validation_loss: Option<f32>,

    pub train_history: Vec<f32>,
    pub val_history: Vec<f32>,
    pub stopped_early: bool,
}

#[derive(Clone, Copy, Debug)]
struct Window {
    start: usize,
    steps: usize,
}

/// Fit an initialized engine to one subject's sequence.
///
/// The sequence is prepared according to the engine's config
/// (interpolation, normalization), so the caller passes raw data. On
/// return the engine holds the best-validation weights when a validation
/// split existed, otherwise the last-epoch weights. Fewer than two
/// prepared observations is not an error: nothing is fitted and the
/// report comes back zeroed, so cohort pipelines need no per-subject
/// recovery.
pub fn train(engine: &mut PlrnnEngine, sequence: &TrainingSequence) -> Result<TrainingReport> {
    if !engine.is_initialized() {
        return Err(EngineError::Uninitialized);
    }
    let config = engine.config().clone();
    let prepared = sequence.clone().prepare(&config);
    if prepared.len() < 2 {
        debug!(observations = prepared.len(), "no transitions to fit");
        return Ok(TrainingReport {
            epochs_run: 0,
            final_training_loss: 0.0,
            best_validation_loss: None,
            train_history: Vec::new(),
            val_history: Vec::new(),
            stopped_early: false,
        });
    }

    let windows = build_windows(prepared.len(), config.bptt_window, config.bptt_overlap);
    let n_val = ((windows.len() as f32) * config.validation_split).round() as usize;
    let n_val = n_val.min(windows.len().saturating_sub(1));
    let (train_windows, val_windows) = windows.split_at(windows.len() - n_val);
    debug!(
        train = train_windows.len(),
        validation = val_windows.len(),
        observations = prepared.len(),
        "window split"
    );

    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
    let mut train_history = Vec::new();
    let mut val_history = Vec::new();
    let mut best_val: Option<f32> = None;
    let mut best_weights: Option<PlrnnWeights> = None;
    let mut stale = 0usize;
    let mut stopped_early = false;
    let mut epochs_run = 0usize;

    for epoch in 0..config.epochs {
        let lr = schedule::learning_rate(&config, epoch);
        let tf_prob = schedule::teacher_forcing_probability(&config, epoch);

        let mut epoch_loss = 0.0;
        for window in train_windows {
            epoch_loss += train_window(engine, &prepared, *window, tf_prob, lr, &mut rng)?;
        }
        let train_loss = epoch_loss / train_windows.len().max(1) as f32;
        train_history.push(train_loss);
        epochs_run = epoch + 1;

        if val_windows.is_empty() {
            debug!(epoch, lr, tf_prob, train_loss, "epoch complete");
            continue;
        }

        let val_loss = evaluate(engine, &prepared, val_windows)?;
        val_history.push(val_loss);
        debug!(epoch, lr, tf_prob, train_loss, val_loss, "epoch complete");

        if best_val.map_or(true, |b| val_loss < b - IMPROVEMENT_EPS) {
            best_val = Some(val_loss);
            best_weights = Some(engine.export_weights()?);
            stale = 0;
        } else {
            stale += 1;
            if stale >= config.patience {
                info!(epoch, patience = config.patience, "validation stalled, stopping");
                stopped_early = true;
                break;
            }
        }
    }

    if let Some(mut weights) = best_weights {
        weights.meta.validation_loss = best_val;
        weights.meta.touch();
        engine.load_weights(weights)?;
        info!(best_validation_loss = ?best_val, "restored best weights");
    }

    Ok(TrainingReport {
        epochs_run,
        final_training_loss: train_history.last().copied().unwrap_or(0.0),
        best_validation_loss: best_val,
        train_history,
        val_history,
        stopped_early,
    })
}

/// Train one engine per `(config, sequence)` job in parallel. Engines are
/// independent, so subjects scale across threads with no shared state.
pub fn fit_cohort(
    jobs: Vec<(EngineConfig, TrainingSequence)>,
) -> Result<Vec<(PlrnnEngine, TrainingReport)>> {
    jobs.into_par_iter()
        .map(|(config, sequence)| {
            let mut engine = PlrnnEngine::new(config)?;
            engine.initialize();
            let report = train(&mut engine, &sequence)?;
            Ok((engine, report))
        })
        .collect()
}

/// Overlapping windows of `window` transitions with stride
/// `window − overlap`, truncated at the sequence tail.
fn build_windows(len: usize, window: usize, overlap: usize) -> Vec<Window> {
    let max_steps = len.saturating_sub(1);
    let window = window.max(1).min(max_steps.max(1));
    let stride = window.saturating_sub(overlap).max(1);

    let mut out = Vec::new();
    let mut start = 0;
    while start < max_steps {
        let steps = window.min(max_steps - start);
        out.push(Window { start, steps });
        if start + steps >= max_steps {
            break;
        }
        start += stride;
    }
    out
}

struct WindowRoll {
    caches: Vec<StepCache>,
    targets: Vec<Array1<f32>>,
    /// Whether the step's starting latent came from ground truth.
    forced: Vec<bool>,
    /// Mean one-step loss across the window.
    loss: f32,
}

/// Forward-roll one window with per-step teacher-forcing draws.
fn roll_window(
    weights: &PlrnnWeights,
    config: &EngineConfig,
    obs: &[Array1<f32>],
    tf_prob: f32,
    rng: &mut StdRng,
) -> WindowRoll {
    let steps = obs.len().saturating_sub(1);
    let inverse = math::invert(&weights.b);
    let latent_of =
        |o: &Array1<f32>| math::sanitize(inverse.dot(&(o - &weights.bias_x)), config.state_clamp);

    let mut caches = Vec::with_capacity(steps);
    let mut targets = Vec::with_capacity(steps);
    let mut forced = Vec::with_capacity(steps);
    let mut loss = 0.0;

    let mut z = latent_of(&obs[0]);
    let mut input_forced = true;
    for k in 0..steps {
        let cache = online::forward_cached(weights, config, &z, None);
        let target = &obs[k + 1];
        loss += online::calculate_loss(&cache.x_next, target);
        forced.push(input_forced);
        targets.push(target.clone());

        input_forced = rng.gen::<f32>() < tf_prob;
        z = if input_forced {
            latent_of(target)
        } else {
            cache.z_next.clone()
        };
        caches.push(cache);
    }

    WindowRoll {
        caches,
        targets,
        forced,
        loss: if steps > 0 { loss / steps as f32 } else { 0.0 },
    }
}

/// One optimizer step over one window, auxiliary horizons included.
/// Returns the window loss.
fn train_window(
    engine: &mut PlrnnEngine,
    data: &TrainingSequence,
    window: Window,
    tf_prob: f32,
    lr: f32,
    rng: &mut StdRng,
) -> Result<f32> {
    let (weights, adam, config) = engine.training_parts()?;
    let obs = &data.observations[window.start..=window.start + window.steps];
    let roll = roll_window(weights, config, obs, tf_prob, rng);

    let mut accum = GradientAccumulator::new();
    let mut total_loss = roll.loss;
    let mut dz = Array1::zeros(config.state_dim);

    // Auxiliary chains: free-run past the window end toward each horizon
    // target that exists, backprop each chain separately, then fold its
    // weighted gradients and boundary dz into the main pass.
    let end = window.start + window.steps;
    if let Some(last) = roll.caches.last() {
        for (&h, &weight) in config.horizons.iter().zip(config.horizon_weights.iter()) {
            if h == 0 || end + h >= data.observations.len() {
                continue;
            }
            let target = &data.observations[end + h];

            let mut chain = Vec::with_capacity(h);
            let mut z = last.z_next.clone();
            for _ in 0..h {
                let cache = online::forward_cached(weights, config, &z, None);
                z = cache.z_next.clone();
                chain.push(cache);
            }
            total_loss += weight * online::calculate_loss(&chain[chain.len() - 1].x_next, target);

            let mut aux = GradientAccumulator::new();
            let mut dz_chain = Array1::zeros(config.state_dim);
            for (i, cache) in chain.iter().enumerate().rev() {
                let step_target = if i + 1 == chain.len() { Some(target) } else { None };
                dz_chain = online::backward_step(weights, cache, step_target, &dz_chain, &mut aux);
            }
            aux.scale(weight);
            merge(&mut accum, &aux);
            dz = dz + dz_chain * weight;
        }
    }

    // Main window, back to front. Teacher-forced boundaries cut the chain.
    for k in (0..roll.caches.len()).rev() {
        let dz_prev =
            online::backward_step(weights, &roll.caches[k], Some(&roll.targets[k]), &dz, &mut accum);
        dz = if roll.forced[k] {
            Array1::zeros(dz_prev.len())
        } else {
            dz_prev
        };
    }

    accum.scale(1.0 / roll.caches.len().max(1) as f32);
    online::add_regularization(weights, &mut accum, config.l1_weight, config.l2_weight);
    accum.count_step();
    accum.clip_global_norm(config.gradient_clip);
    online::apply_gradients(weights, &accum, adam, lr);
    weights.meta.training_samples += roll.caches.len() as u64;

    Ok(total_loss)
}

/// Deterministic one-step-ahead loss over the held-out windows.
fn evaluate(engine: &mut PlrnnEngine, data: &TrainingSequence, windows: &[Window]) -> Result<f32> {
    let (weights, _, config) = engine.training_parts()?;
    let inverse = math::invert(&weights.b);

    let mut total = 0.0;
    let mut count = 0usize;
    for window in windows {
        let obs = &data.observations[window.start..=window.start + window.steps];
        for k in 0..window.steps {
            let z = math::sanitize(
                inverse.dot(&(&obs[k] - &weights.bias_x)),
                config.state_clamp,
            );
            let cache = online::forward_cached(weights, config, &z, None);
            total += online::calculate_loss(&cache.x_next, &obs[k + 1]);
            count += 1;
        }
    }
    Ok(if count > 0 { total / count as f32 } else { 0.0 })
}

/// Fold one accumulator's sums into another.
fn merge(into: &mut GradientAccumulator, from: &GradientAccumulator) {
    for name in PARAM_NAMES {
        if let Some(g) = from.get(name) {
            into.add(name, &Array1::from_vec(g.to_vec()));
        }
    }
}
