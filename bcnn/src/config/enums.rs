//! Enumeration types for layer hyperparameters.
//!
//! Each enum selects one building block of the networks; payloads carry the
//! block's scalar hyperparameter.

use burn::prelude::*;

/// How the border is padded before a convolution.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum PaddingMode {
    /// Zero padding.
    Zeros,
    /// Reflection padding (border mirrored without repeating the edge).
    Reflect,
}

/// Initializer for convolution weights.
#[derive(Config, Debug, PartialEq)]
pub enum WeightInit {
    /// Burn's default (Kaiming uniform).
    Default,
    /// Zero-mean normal distribution with the given standard deviation.
    Normal(f64),
    /// Bilinear interpolation kernel; only meaningful for up-convolutions.
    Bilinear,
}

/// Initializer for convolution biases.
#[derive(Config, Debug, PartialEq)]
pub enum BiasInit {
    /// All zeros.
    Zero,
    /// Zero-mean normal distribution with the given standard deviation.
    Normal(f64),
}

/// Down-sampling between contracting levels.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum Pooling {
    /// No down-sampling.
    None,
    /// Strided convolution with the given stride.
    Stride(usize),
    /// Max pooling with the given window and stride.
    Max(usize),
}

/// Normalization applied after a convolution.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum Normalization {
    /// No normalization.
    None,
    /// Batch normalization over `[N, H, W]`.
    Batch,
}

/// Non-linearity applied after normalization.
#[derive(Config, Debug, PartialEq)]
pub enum Activation {
    /// Identity.
    None,
    /// Rectified linear unit.
    Relu,
    /// Leaky ReLU with the given negative slope.
    LeakyRelu(f64),
    /// Hyperbolic tangent.
    Tanh,
}

/// Dropout applied after the activation.
#[derive(Config, Debug, PartialEq)]
pub enum Dropout {
    /// No dropout.
    None,
    /// Standard dropout, active only while training on an autodiff backend.
    Standard(f64),
    /// Monte-Carlo dropout, active at inference time as well.
    McDropout(f64),
}

/// Adversarial objective used by the updater.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum GanLoss {
    /// Non-saturating binary cross-entropy on logits.
    Dcgan,
    /// Least-squares objective.
    Lsgan,
}

impl std::str::FromStr for GanLoss {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dcgan" => Ok(Self::Dcgan),
            "lsgan" => Ok(Self::Lsgan),
            other => Err(format!("unknown GAN loss `{other}` (expected `dcgan` or `lsgan`)")),
        }
    }
}
