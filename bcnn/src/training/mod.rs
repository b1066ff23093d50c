//! Iteration-based GAN training.
//!
//! - `trainer`: the loop, shared state and resumable snapshots
//! - `trigger`: interval and early-stopping triggers
//! - `extensions`: learning-rate schedule, network snapshots and reports
//! - `validator`: validation metrics and example figures

pub mod extensions;
pub mod trainer;
pub mod trigger;
pub mod validator;

pub use extensions::{
    LinearShift, LogReport, PlotReport, PrintReport, ProgressBar, SnapshotObject, SnapshotTarget,
};
pub use trainer::{Extension, LogEntry, TrainState, Trainer};
pub use trigger::{resolve_frequency, EarlyStoppingTrigger, IntervalTrigger};
pub use validator::Validator;
