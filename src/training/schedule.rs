//! Per-epoch learning-rate and teacher-forcing schedules.
//!
//! Every schedule starts with a short linear warmup, then hands off to the
//! configured decay. All of it is a pure function of `(config, epoch)` so
//! resuming a run at any epoch reproduces the same values.

use crate::config::{EngineConfig, LrSchedule};

/// Warmup spans `min(5, epochs / 4)` epochs.
pub fn warmup_epochs(config: &EngineConfig) -> usize {
    5.min(config.epochs / 4)
}

/// Learning rate for an epoch: linear ramp during warmup, then the
/// configured decay, never below `lr_min` for the decaying schedules.
pub fn learning_rate(config: &EngineConfig, epoch: usize) -> f32 {
    let base = config.learning_rate;
    let warmup = warmup_epochs(config);
    if epoch < warmup {
        return base * (epoch + 1) as f32 / warmup as f32;
    }

    let decayed = epoch - warmup;
    match config.lr_schedule {
        LrSchedule::Constant => base,
        LrSchedule::Step => {
            let halvings = (decayed / 10) as i32;
            (base * 0.5f32.powi(halvings)).max(config.lr_min)
        }
        LrSchedule::Exponential => (base * 0.95f32.powi(decayed as i32)).max(config.lr_min),
        LrSchedule::Cosine => {
            let span = config.epochs.saturating_sub(warmup).max(1);
            let progress = (decayed as f32 / span as f32).min(1.0);
            let min = config.lr_min.min(base);
            min + 0.5 * (base - min) * (1.0 + (std::f32::consts::PI * progress).cos())
        }
    }
}

/// Probability that a rollout step is clamped to ground truth:
/// `teacher_forcing · decay^epoch`, clamped into [0, 1].
pub fn teacher_forcing_probability(config: &EngineConfig, epoch: usize) -> f32 {
    (config.teacher_forcing * config.teacher_forcing_decay.powi(epoch as i32)).clamp(0.0, 1.0)
}
