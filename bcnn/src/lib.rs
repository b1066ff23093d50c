//! Bayesian U-Net image-to-image translation trained as a conditional GAN,
//! with Monte-Carlo dropout for per-pixel uncertainty.

pub mod config;
pub mod data;
pub mod error;
pub mod inference;
pub mod models;
pub mod training;
pub mod updater;
pub mod utils;
pub mod visualizer;

pub use config::*;
pub use error::{BcnnError, BcnnResult};
pub use inference::{find_latest_snapshot, Inferencer, Predictions};
pub use models::{BayesianUNet, McSampler, PatchDiscriminator, Regressor};
pub use updater::{adam, GanUpdater, Observation};
pub use visualizer::{percentile, Colormap, ImageVisualizer};
