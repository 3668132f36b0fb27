//! Latent dynamics: the PLRNN engine, its gradients, and the analyses
//! that read the learned parameters back out.
//!
//! `engine` owns state and orchestration; `online` holds the shared
//! forward/backward step math; `warning`, `causal` and `intervention`
//! interpret a trained model.

pub mod causal;
pub mod engine;
pub mod intervention;
pub mod online;
pub mod warning;

pub use causal::{CausalEdge, CausalNetwork, CausalNode, FeedbackLoop};
pub use engine::{Forecast, ForecastHorizon, PlrnnEngine};
pub use intervention::{InterventionDirection, InterventionEffect, InterventionOutcome};
pub use online::calculate_loss;
pub use warning::{detect_early_warnings, EarlyWarningSignal, WarningKind};
