//! What-if simulation on the learned dynamics.
//!
//! An intervention is a sustained push on one observed dimension: the
//! model rolls forward twice from the current state, once untouched and
//! once with the push applied at every step, and the per-step gap between
//! the two trajectories is the predicted effect. Because the comparison
//! runs through the learned connectivity, indirect effects on the other
//! dimensions surface on their own.

use ndarray::Array1;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;

use super::engine::PlrnnEngine;

/// Steps simulated per what-if run (24 hours on the default grid).
const INTERVENTION_STEPS: usize = 24;

/// Effects below this magnitude on a non-target dimension are noise, not
/// side effects.
const SIDE_EFFECT_THRESHOLD: f32 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum InterventionDirection {
    Increase,
    Decrease,
}

/// Final-step change of one dimension relative to baseline.
#[derive(Clone, Debug, Serialize)]
pub struct InterventionEffect {
    pub label: String,
    pub effect: f32,
}

/// Everything the 24-hour what-if run produced.
#[derive(Clone, Debug, Serialize)]
pub struct InterventionOutcome {
    /// Dimension the push was applied to.
    pub target: String,

    pub direction: InterventionDirection,

    /// Simulated span in hours.
    pub horizon_hours: f32,

    /// Final-step effect per dimension, in label order.
    pub effects: Vec<InterventionEffect>,

    /// Signed peak effect seen on the target dimension.
    pub peak_effect: f32,

    /// Hours from now until the peak effect.
    pub time_to_peak_hours: f32,

    /// Hours from the peak until the effect falls under 10% of the peak.
    /// `None` when it never does within the simulated span.
    pub decay_hours: Option<f32>,

    /// Labels of non-target dimensions whose final effect exceeds the
    /// side-effect threshold.
    pub side_effects: Vec<String>,
}

impl PlrnnEngine {
    /// Simulate pushing `target` up or down by `magnitude` for 24 hours.
    ///
    /// The push enters the latent update as a constant input, so the
    /// outcome reflects the learned cross-dimension couplings rather than
    /// a naive additive shift. `magnitude` is taken by absolute value; the
    /// sign comes from `direction`.
    pub fn simulate_intervention(
        &self,
        target: &str,
        direction: InterventionDirection,
        magnitude: f32,
    ) -> Result<InterventionOutcome> {
        let config = self.config();
        let idx = config.dim_index(target)?;

        let signed = match direction {
            InterventionDirection::Increase => magnitude.abs(),
            InterventionDirection::Decrease => -magnitude.abs(),
        };
        let mut push = Array1::zeros(config.state_dim);
        push[idx] = signed;

        let state = self.current_state();
        let baseline = self.rollout(state, INTERVENTION_STEPS, None)?;
        let intervened = self.rollout(state, INTERVENTION_STEPS, Some(&push))?;

        // Per-step target-dimension gap, skipping the shared start.
        let mut peak_effect = 0.0f32;
        let mut peak_step = 0usize;
        for k in 1..=INTERVENTION_STEPS {
            let delta = intervened[k].observed[idx] - baseline[k].observed[idx];
            if delta.abs() > peak_effect.abs() {
                peak_effect = delta;
                peak_step = k;
            }
        }

        let dt = config.dt_hours;
        let decay_hours = if peak_step > 0 {
            let floor = 0.1 * peak_effect.abs();
            ((peak_step + 1)..=INTERVENTION_STEPS)
                .find(|&k| {
                    (intervened[k].observed[idx] - baseline[k].observed[idx]).abs() <= floor
                })
                .map(|k| (k - peak_step) as f32 * dt)
        } else {
            None
        };

        let last = INTERVENTION_STEPS;
        let effects: Vec<InterventionEffect> = (0..config.state_dim)
            .map(|i| InterventionEffect {
                label: config
                    .dim_labels
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("dim{}", i)),
                effect: intervened[last].observed[i] - baseline[last].observed[i],
            })
            .collect();

        let side_effects = effects
            .iter()
            .enumerate()
            .filter(|(i, e)| *i != idx && e.effect.abs() > SIDE_EFFECT_THRESHOLD)
            .map(|(_, e)| e.label.clone())
            .collect();

        debug!(
            target,
            peak = peak_effect,
            peak_step,
            "intervention simulated"
        );

        Ok(InterventionOutcome {
            target: target.to_string(),
            direction,
            horizon_hours: INTERVENTION_STEPS as f32 * dt,
            effects,
            peak_effect,
            time_to_peak_hours: peak_step as f32 * dt,
            decay_hours,
            side_effects,
        })
    }
}
