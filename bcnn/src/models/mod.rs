//! Networks: building blocks, the Bayesian U-Net generator, the patch
//! discriminator, the regression head and the Monte-Carlo sampler.

pub mod discriminator;
pub mod layers;
pub mod mc_sampler;
pub mod regressor;
pub mod unet;

pub use discriminator::PatchDiscriminator;
pub use layers::{ConvUnit, ConvUnitConfig, UpConvUnit, UpConvUnitConfig};
pub use mc_sampler::{ChannelReduce, McSampler};
pub use regressor::{l1_loss, Regressor};
pub use unet::BayesianUNet;
