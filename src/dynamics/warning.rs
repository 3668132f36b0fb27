//! Early-warning signals of an approaching state transition.
//!
//! Systems nearing a tipping point recover from perturbations more slowly.
//! That shows up in a sliding history as rising lag-1 autocorrelation,
//! rising variance, flickering between attractor basins, and dimensions
//! tightening together. All four detectors compare the oldest `window`
//! samples against the newest `window` samples; anything shorter than two
//! full windows carries no verdict and yields an empty Vec.

use ndarray::Array1;
use serde::Serialize;

use crate::config::EngineConfig;

/// Minimum window length for the statistics to mean anything.
const MIN_WINDOW: usize = 4;

/// Autocorrelation must rise by this much and exceed 0.5 to fire.
const AC_RISE: f32 = 0.1;
const AC_LEVEL: f32 = 0.5;

/// Late/early variance ratio that fires the variance detector.
const VAR_RATIO: f32 = 1.5;

/// Late/early rate ratios for flickering and connectivity.
const FLICKER_RATIO: f32 = 1.3;
const CONNECTIVITY_RATIO: f32 = 1.3;

/// Hours-to-transition estimates are capped here.
const MAX_HORIZON_HOURS: f32 = 48.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum WarningKind {
    /// Lag-1 autocorrelation rising: slower recovery from perturbations.
    Autocorrelation,

    /// Variance inflating.
    Variance,

    /// Rapid switching around the local mean.
    Flickering,

    /// Cross-dimension correlations tightening.
    Connectivity,
}

/// One detected signal.
#[derive(Clone, Debug, Serialize)]
pub struct EarlyWarningSignal {
    pub kind: WarningKind,

    /// Index of the dimension the signal is attributed to.
    pub dimension: usize,

    /// Label of that dimension.
    pub label: String,

    /// How far past its threshold the detector sits; always > 0.
    pub strength: f32,

    /// Rough time-to-transition estimate, where the detector has one.
    pub estimated_hours_to_transition: Option<f32>,

    /// Bounded confidence in (0, 1).
    pub confidence: f32,

    pub recommendation: String,
}

/// Scan a history for early-warning signals.
///
/// `history` is ordered oldest to newest, one observation vector per
/// sample; `window` is the sub-window length for the early/late split.
pub fn detect_early_warnings(
    history: &[Array1<f32>],
    window: usize,
    config: &EngineConfig,
) -> Vec<EarlyWarningSignal> {
    let mut signals = Vec::new();
    if window < MIN_WINDOW || history.len() < 2 * window {
        return signals;
    }

    let n = history[0].len();
    let early = &history[..window];
    let late = &history[history.len() - window..];

    for dim in 0..n {
        let e: Vec<f32> = early.iter().map(|v| v[dim]).collect();
        let l: Vec<f32> = late.iter().map(|v| v[dim]).collect();
        let label = dim_label(config, dim);

        let ac_early = lag1_autocorrelation(&e);
        let ac_late = lag1_autocorrelation(&l);
        if ac_late - ac_early > AC_RISE && ac_late > AC_LEVEL {
            let strength = ac_late - ac_early;
            let hours = (config.dt_hours / (1.0 - ac_late).max(1e-3)).min(MAX_HORIZON_HOURS);
            signals.push(EarlyWarningSignal {
                kind: WarningKind::Autocorrelation,
                dimension: dim,
                label: label.clone(),
                strength,
                estimated_hours_to_transition: Some(hours),
                confidence: strength.tanh(),
                recommendation:
                    "critical slowing down: responses recover more slowly; increase monitoring frequency"
                        .to_string(),
            });
        }

        let var_early = variance(&e);
        let var_late = variance(&l);
        if var_early > 1e-9 && var_late / var_early > VAR_RATIO {
            let strength = var_late / var_early - VAR_RATIO;
            signals.push(EarlyWarningSignal {
                kind: WarningKind::Variance,
                dimension: dim,
                label: label.clone(),
                strength,
                estimated_hours_to_transition: None,
                confidence: strength.tanh(),
                recommendation:
                    "rising variance; review recent stressors and consider preventive support"
                        .to_string(),
            });
        }

        let floor = 1.0 / (window as f32 - 1.0);
        let zc_early = zero_crossing_rate(&e).max(floor);
        let zc_late = zero_crossing_rate(&l);
        if zc_late / zc_early > FLICKER_RATIO {
            let strength = zc_late / zc_early - FLICKER_RATIO;
            signals.push(EarlyWarningSignal {
                kind: WarningKind::Flickering,
                dimension: dim,
                label,
                strength,
                estimated_hours_to_transition: None,
                confidence: strength.tanh(),
                recommendation: "state flickering between attractors; watch for rapid switches"
                    .to_string(),
            });
        }
    }

    if n >= 2 {
        if let Some(signal) = connectivity_signal(early, late, n, config) {
            signals.push(signal);
        }
    }

    signals
}

/// Mean pairwise |correlation| rising across the split. The signal is
/// attributed to the dimension whose mean coupling to the others grew the
/// most.
fn connectivity_signal(
    early: &[Array1<f32>],
    late: &[Array1<f32>],
    n: usize,
    config: &EngineConfig,
) -> Option<EarlyWarningSignal> {
    let mut early_mean = vec![0.0_f32; n];
    let mut late_mean = vec![0.0_f32; n];

    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            let ei: Vec<f32> = early.iter().map(|v| v[i]).collect();
            let ej: Vec<f32> = early.iter().map(|v| v[j]).collect();
            let li: Vec<f32> = late.iter().map(|v| v[i]).collect();
            let lj: Vec<f32> = late.iter().map(|v| v[j]).collect();
            early_mean[i] += correlation(&ei, &ej).abs() / (n - 1) as f32;
            late_mean[i] += correlation(&li, &lj).abs() / (n - 1) as f32;
        }
    }

    let early_total: f32 = early_mean.iter().sum::<f32>() / n as f32;
    let late_total: f32 = late_mean.iter().sum::<f32>() / n as f32;
    if early_total <= 1e-6 || late_total / early_total <= CONNECTIVITY_RATIO {
        return None;
    }

    let dimension = (0..n)
        .max_by(|&a, &b| {
            let da = late_mean[a] - early_mean[a];
            let db = late_mean[b] - early_mean[b];
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(0);

    let strength = late_total / early_total - CONNECTIVITY_RATIO;
    Some(EarlyWarningSignal {
        kind: WarningKind::Connectivity,
        dimension,
        label: dim_label(config, dimension),
        strength,
        estimated_hours_to_transition: None,
        confidence: strength.tanh(),
        recommendation: "dimensions are tightening together; a system-wide shift may be near"
            .to_string(),
    })
}

fn dim_label(config: &EngineConfig, dim: usize) -> String {
    config
        .dim_labels
        .get(dim)
        .cloned()
        .unwrap_or_else(|| format!("dim{}", dim))
}

fn mean(x: &[f32]) -> f32 {
    if x.is_empty() {
        return 0.0;
    }
    x.iter().sum::<f32>() / x.len() as f32
}

fn variance(x: &[f32]) -> f32 {
    if x.len() < 2 {
        return 0.0;
    }
    let m = mean(x);
    x.iter().map(|v| (v - m) * (v - m)).sum::<f32>() / x.len() as f32
}

/// Lag-1 autocorrelation; 0 for flat or too-short series.
fn lag1_autocorrelation(x: &[f32]) -> f32 {
    if x.len() < 2 {
        return 0.0;
    }
    let m = mean(x);
    let denom: f32 = x.iter().map(|v| (v - m) * (v - m)).sum();
    if denom < 1e-9 {
        return 0.0;
    }
    let num: f32 = x.windows(2).map(|p| (p[0] - m) * (p[1] - m)).sum();
    num / denom
}

/// Sign changes around the window mean, per sample pair.
fn zero_crossing_rate(x: &[f32]) -> f32 {
    if x.len() < 2 {
        return 0.0;
    }
    let m = mean(x);
    let crossings = x
        .windows(2)
        .filter(|p| (p[0] - m) * (p[1] - m) < 0.0)
        .count();
    crossings as f32 / (x.len() - 1) as f32
}

/// Pearson correlation; 0 when either side is flat.
fn correlation(x: &[f32], y: &[f32]) -> f32 {
    let len = x.len().min(y.len());
    if len < 2 {
        return 0.0;
    }
    let mx = mean(&x[..len]);
    let my = mean(&y[..len]);
    let mut num = 0.0;
    let mut dx = 0.0;
    let mut dy = 0.0;
    for i in 0..len {
        let a = x[i] - mx;
        let b = y[i] - my;
        num += a * b;
        dx += a * a;
        dy += b * b;
    }
    if dx < 1e-9 || dy < 1e-9 {
        return 0.0;
    }
    num / (dx * dy).sqrt()
}
