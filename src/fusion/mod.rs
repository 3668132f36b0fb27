//! State fusion: Kalman branch + attention branch, blended.

pub mod engine;
pub mod explain;

pub use engine::{FusionForecast, KalmanFormer};
pub use explain::{AttentionExplanation, AttentionInfluence, AttentionPattern};
