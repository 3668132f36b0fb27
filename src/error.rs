//! Error kinds for the forecasting engines.
//!
//! The policy split:
//! - Caller mistakes (no weights, bad label, wrong vector length) are typed
//!   errors, fatal only to the offending call.
//! - Numerical degeneracy never surfaces here — `math` substitutes
//!   identity/zero/clamped values and logs a warning instead.
//! - Insufficient data is not an error either: detectors return empty
//!   results so batch pipelines need no per-item recovery.

use thiserror::Error;

/// All recoverable error kinds the engines produce.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A model method was called before `initialize()` or `load_weights()`.
    #[error("model not initialized: call initialize() or load_weights() first")]
    Uninitialized,

    /// An intervention/explanation referenced a dimension label that is not
    /// in the configured label set.
    #[error("unknown dimension label '{0}'")]
    UnknownDimension(String),

    /// An observation vector did not match the configured state dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Training sequence timestamps must be strictly increasing.
    #[error("non-monotonic timestamp at index {index}")]
    NonMonotonicTimestamps { index: usize },

    /// A sequence was constructed with no observations at all.
    #[error("training corpus is empty")]
    EmptySequence,

    /// Invalid configuration (inconsistent field combination).
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Weight file I/O failure.
    #[error("weights i/o: {0}")]
    WeightsIo(#[from] std::io::Error),

    /// Weight file parse/encode failure.
    #[error("weights format: {0}")]
    WeightsFormat(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
