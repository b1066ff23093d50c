//! Core configuration structures for the networks.
//!
//! These replace the nested hyperparameter dictionaries of the model zoo with
//! typed, serializable configs. Defaults reproduce the pix2pix setup used by the
//! map synthesis driver.

use std::path::Path;

use burn::prelude::*;

use super::enums::*;
use crate::error::{BcnnError, BcnnResult};

/// Convolution hyperparameters shared by every conv unit of a network.
#[derive(Config, Debug)]
pub struct ConvParam {
    /// Square kernel size.
    #[config(default = "3")]
    pub kernel_size: usize,
    /// Stride of the convolution.
    #[config(default = "1")]
    pub stride: usize,
    /// Padding on every side.
    #[config(default = "1")]
    pub padding: usize,
    /// Border handling for the padding.
    #[config(default = "PaddingMode::Zeros")]
    pub padding_mode: PaddingMode,
    /// Weight initializer.
    #[config(default = "WeightInit::Normal(0.02)")]
    pub init: WeightInit,
    /// Whether the convolution has a bias term.
    #[config(default = "true")]
    pub bias: bool,
    /// Bias initializer.
    #[config(default = "BiasInit::Zero")]
    pub bias_init: BiasInit,
    /// Divide weights by their spectral norm on every forward pass.
    #[config(default = "false")]
    pub spectral_norm: bool,
}

impl ConvParam {
    fn validate(&self, what: &str) -> BcnnResult<()> {
        if self.kernel_size == 0 || self.stride == 0 {
            return Err(BcnnError::InvalidConfiguration {
                reason: format!("{what}: kernel size and stride must be positive"),
            });
        }
        if self.padding_mode == PaddingMode::Reflect && self.padding >= self.kernel_size {
            return Err(BcnnError::InvalidConfiguration {
                reason: format!(
                    "{what}: reflection padding {} must be smaller than kernel size {}",
                    self.padding, self.kernel_size
                ),
            });
        }
        Ok(())
    }
}

/// Configuration of the Bayesian U-Net generator.
///
/// The contracting path runs `nlayer` levels with `nfilter[i]` channels; the
/// expansive path mirrors it back to level 0. Dropout is inserted at the
/// levels flagged in `dropout_enables`.
#[derive(Config, Debug)]
pub struct BayesianUNetConfig {
    /// Number of input channels.
    #[config(default = "3")]
    pub in_channels: usize,
    /// Number of output channels.
    #[config(default = "3")]
    pub out_channels: usize,
    /// Number of resolution levels.
    #[config(default = "8")]
    pub nlayer: usize,
    /// Channels per level.
    #[config(default = "vec![64, 128, 256, 512, 512, 512, 512, 512]")]
    pub nfilter: Vec<usize>,
    /// Conv units per contracting level.
    #[config(default = "1")]
    pub ninner: usize,
    /// Convolution used inside every level.
    #[config(
        default = "ConvParam::new().with_kernel_size(3).with_padding(1).with_padding_mode(PaddingMode::Reflect).with_bias(false)"
    )]
    pub conv: ConvParam,
    /// Down-sampling between contracting levels.
    #[config(default = "Pooling::Stride(2)")]
    pub pool: Pooling,
    /// Up-convolution between expansive levels.
    #[config(
        default = "ConvParam::new().with_kernel_size(4).with_stride(2).with_padding(1).with_bias(false)"
    )]
    pub upconv: ConvParam,
    /// Normalization after every conv unit.
    #[config(default = "Normalization::Batch")]
    pub norm: Normalization,
    /// Activation of the contracting path.
    #[config(default = "Activation::LeakyRelu(0.2)")]
    pub activation: Activation,
    /// Dropout of the contracting path.
    #[config(default = "Dropout::None")]
    pub dropout: Dropout,
    /// Per-level switch for dropout in both paths.
    #[config(default = "vec![false, false, false, false, true, true, true, false]")]
    pub dropout_enables: Vec<bool>,
    /// Skip normalization on the first conv unit.
    #[config(default = "true")]
    pub preserve_color: bool,
    /// Conv units per expansive level after the skip concatenation.
    #[config(default = "0")]
    pub exp_ninner: usize,
    /// Activation of the expansive path.
    #[config(default = "Activation::Relu")]
    pub exp_activation: Activation,
    /// Dropout of the expansive path.
    #[config(default = "Dropout::McDropout(0.5)")]
    pub exp_dropout: Dropout,
}

impl BayesianUNetConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err(BcnnError::InvalidConfiguration)` if list lengths disagree with
    /// `nlayer`, a size is zero, or the pooling factor differs from the
    /// up-convolution stride.
    pub fn validate(&self) -> BcnnResult<()> {
        if self.nlayer == 0 {
            return Err(BcnnError::InvalidConfiguration {
                reason: "nlayer must be at least 1".to_string(),
            });
        }
        if self.nfilter.len() != self.nlayer {
            return Err(BcnnError::InvalidConfiguration {
                reason: format!(
                    "nfilter has {} entries but nlayer is {}",
                    self.nfilter.len(),
                    self.nlayer
                ),
            });
        }
        if self.dropout_enables.len() != self.nlayer {
            return Err(BcnnError::InvalidConfiguration {
                reason: format!(
                    "dropout_enables has {} entries but nlayer is {}",
                    self.dropout_enables.len(),
                    self.nlayer
                ),
            });
        }
        if self.nfilter.contains(&0) || self.in_channels == 0 || self.out_channels == 0 {
            return Err(BcnnError::InvalidConfiguration {
                reason: "channel counts must be positive".to_string(),
            });
        }
        if self.ninner == 0 {
            return Err(BcnnError::InvalidConfiguration {
                reason: "ninner must be at least 1".to_string(),
            });
        }
        if self.conv.stride != 1 {
            return Err(BcnnError::InvalidConfiguration {
                reason: "inner convolutions must keep the resolution (stride 1)".to_string(),
            });
        }
        let factor = match self.pool {
            Pooling::None => 1,
            Pooling::Stride(factor) | Pooling::Max(factor) => factor,
        };
        if factor == 0 {
            return Err(BcnnError::InvalidConfiguration {
                reason: "pooling factor must be positive".to_string(),
            });
        }
        if self.nlayer > 1 && factor != self.upconv.stride {
            return Err(BcnnError::InvalidConfiguration {
                reason: format!(
                    "pooling factor {factor} must match the up-convolution stride {}",
                    self.upconv.stride
                ),
            });
        }
        self.conv.validate("conv")?;
        self.upconv.validate("upconv")?;
        Ok(())
    }

    /// Number of down-sampling steps between the input and the bottleneck.
    pub const fn depth(&self) -> usize {
        self.nlayer - 1
    }

    /// Saves the configuration as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_args(&self, path: impl AsRef<Path>) -> BcnnResult<()> {
        self.save(path)?;
        Ok(())
    }
}

/// Configuration of the patch discriminator.
#[derive(Config, Debug)]
pub struct PatchDiscriminatorConfig {
    /// Number of input channels (condition and image concatenated).
    #[config(default = "6")]
    pub in_channels: usize,
    /// Number of logit channels.
    #[config(default = "1")]
    pub out_channels: usize,
    /// Number of down-sampling conv units.
    #[config(default = "4")]
    pub nlayer: usize,
    /// Channels of the first unit; doubled per level up to eight times this value.
    #[config(default = "64")]
    pub nfilter: usize,
    /// Extra stride-1 conv units per level.
    #[config(default = "0")]
    pub ninner: usize,
    /// Convolution of the down-sampling units.
    #[config(
        default = "ConvParam::new().with_kernel_size(4).with_stride(2).with_padding(1).with_spectral_norm(true)"
    )]
    pub conv: ConvParam,
    /// Normalization after every unit but the first.
    #[config(default = "Normalization::None")]
    pub norm: Normalization,
    /// Activation after every unit.
    #[config(default = "Activation::LeakyRelu(0.2)")]
    pub activation: Activation,
    /// Dropout after every unit.
    #[config(default = "Dropout::None")]
    pub dropout: Dropout,
    /// Skip normalization on the first unit.
    #[config(default = "true")]
    pub preserve_color: bool,
    /// Power iterations per forward pass when spectral normalization is enabled.
    #[config(default = "1")]
    pub power_iterations: usize,
}

impl PatchDiscriminatorConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err(BcnnError::InvalidConfiguration)` on zero sizes or inconsistent padding.
    pub fn validate(&self) -> BcnnResult<()> {
        if self.nlayer == 0 || self.nfilter == 0 || self.in_channels == 0 || self.out_channels == 0
        {
            return Err(BcnnError::InvalidConfiguration {
                reason: "discriminator sizes must be positive".to_string(),
            });
        }
        self.conv.validate("discriminator conv")
    }

    /// Channels of level `level`.
    pub fn channels(&self, level: usize) -> usize {
        self.nfilter * (1usize << level.min(3))
    }

    /// Saves the configuration as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_args(&self, path: impl AsRef<Path>) -> BcnnResult<()> {
        self.save(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_generator_is_valid() {
        let config = BayesianUNetConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.depth(), 7);
    }

    #[test]
    fn mismatched_filter_list_is_rejected() {
        let config = BayesianUNetConfig::new().with_nlayer(3);

        match config.validate() {
            Err(BcnnError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("nfilter has 8 entries"));
            }
            other => panic!("Expected InvalidConfiguration error, got {other:?}"),
        }
    }

    #[test]
    fn pooling_must_match_upconv_stride() {
        let config = BayesianUNetConfig::new()
            .with_nlayer(2)
            .with_nfilter(vec![4, 8])
            .with_dropout_enables(vec![false, false])
            .with_pool(Pooling::None);

        match config.validate() {
            Err(BcnnError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("pooling factor 1"), "{reason}");
            }
            other => panic!("Expected InvalidConfiguration error, got {other:?}"),
        }
        assert!(config
            .with_upconv(ConvParam::new().with_kernel_size(3).with_padding(1))
            .validate()
            .is_ok());
    }

    #[test]
    fn reflection_padding_must_fit_kernel() {
        let config = BayesianUNetConfig::new().with_conv(
            ConvParam::new()
                .with_kernel_size(1)
                .with_padding(1)
                .with_padding_mode(PaddingMode::Reflect),
        );

        assert!(config.validate().is_err());
    }

    #[test]
    fn discriminator_channels_are_capped() {
        let config = PatchDiscriminatorConfig::new();
        let channels: Vec<usize> = (0..6).map(|level| config.channels(level)).collect();
        assert_eq!(channels, vec![64, 128, 256, 512, 512, 512]);
    }

    #[test]
    fn config_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let config = BayesianUNetConfig::new().with_nlayer(3).with_nfilter(vec![4, 8, 16]);

        config.save_args(&path).unwrap();
        let loaded = BayesianUNetConfig::load(&path).unwrap();

        assert_eq!(loaded.nfilter, vec![4, 8, 16]);
        assert_eq!(loaded.exp_dropout, Dropout::McDropout(0.5));
    }
}
