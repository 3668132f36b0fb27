//! Offline fitting: sequence preparation, schedules, and the
//! truncated-BPTT trainer.

pub mod data;
pub mod schedule;
pub mod trainer;

pub use data::{synthetic_sequence, synthetic_sequence_with_transition, TrainingSequence};
pub use trainer::{fit_cohort, train, TrainingReport};
