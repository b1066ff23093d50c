//! Configuration module.
//!
//! - `core`: network configurations (generator, discriminator, conv params)
//! - `enums`: building-block selectors used by those configurations

pub mod core;
pub mod enums;

pub use core::{BayesianUNetConfig, ConvParam, PatchDiscriminatorConfig};

pub use enums::{
    Activation, BiasInit, Dropout, GanLoss, Normalization, PaddingMode, Pooling, WeightInit,
};
