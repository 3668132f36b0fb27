//! # KAIROS
//!
//! **Hybrid temporal forecasting for momentary self-report series** — a
//! Kalman/attention/PLRNN stack built for short, irregularly sampled,
//! noisy psychological time series (a few hundred points per subject,
//! not millions).
//!
//! ## Components
//!
//! 1. **Kalman core** — linear-Gaussian predict/update with analytic gain
//! 2. **Sequence encoder** — windowed multi-head self-attention over
//!    embedded observations with circadian/weekly time features
//! 3. **KalmanFormer** — fusion of filter posterior and attention
//!    context through a learned sigmoid gain and blended estimate
//! 4. **PLRNN** — piecewise-linear latent dynamics with optional
//!    dendritic basis expansion, trained by truncated BPTT
//! 5. **Early warnings** — autocorrelation/variance/flicker/connectivity
//!    precursors of state transitions
//! 6. **Causal reads** — connectivity graph, feedback loops, and 24-hour
//!    what-if intervention simulation from the learned weights
//!
//! ## Shape
//!
//! - `f32` values in `ndarray` buffers; timestamps in `f64` hours
//! - one engine instance per subject, synchronous throughout
//! - every stochastic path seeded through `StdRng` from the config
//! - numerical degradation logs and substitutes, never panics

pub mod config;
pub mod dynamics;
pub mod encoder;
pub mod error;
pub mod filter;
pub mod fusion;
pub mod math;
pub mod optim;
pub mod state;
pub mod training;
pub mod weights;
