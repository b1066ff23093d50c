//! Patch discriminator.
//!
//! Emits one logit per receptive-field patch of the concatenated
//! (condition, image) input.

use burn::prelude::*;

use super::layers::{ConvUnit, ConvUnitConfig};
use crate::{
    config::{Activation, ConvParam, Dropout, Normalization, PatchDiscriminatorConfig},
    error::BcnnResult,
};

impl PatchDiscriminatorConfig {
    /// Initializes a new `PatchDiscriminator`.
    ///
    /// # Errors
    ///
    /// Returns `BcnnError::InvalidConfiguration` if the configuration is invalid.
    pub fn init<B: Backend>(&self, device: &B::Device) -> BcnnResult<PatchDiscriminator<B>> {
        self.validate()?;

        let inner = ConvParam::new()
            .with_kernel_size(3)
            .with_stride(1)
            .with_padding(1)
            .with_padding_mode(self.conv.padding_mode.clone())
            .with_init(self.conv.init.clone())
            .with_bias(self.conv.bias)
            .with_bias_init(self.conv.bias_init.clone())
            .with_spectral_norm(self.conv.spectral_norm);

        let mut units = Vec::with_capacity(self.nlayer * (1 + self.ninner));
        let mut in_channels = self.in_channels;
        for level in 0..self.nlayer {
            let out_channels = self.channels(level);
            let norm = if level == 0 && self.preserve_color {
                Normalization::None
            } else {
                self.norm.clone()
            };
            units.push(
                ConvUnitConfig::new(in_channels, out_channels, self.conv.clone())
                    .with_norm(norm)
                    .with_activation(self.activation.clone())
                    .with_dropout(self.dropout.clone())
                    .with_power_iterations(self.power_iterations)
                    .init(device),
            );
            for _ in 0..self.ninner {
                units.push(
                    ConvUnitConfig::new(out_channels, out_channels, inner.clone())
                        .with_norm(self.norm.clone())
                        .with_activation(self.activation.clone())
                        .with_dropout(self.dropout.clone())
                        .with_power_iterations(self.power_iterations)
                        .init(device),
                );
            }
            in_channels = out_channels;
        }

        let logits = ConvUnitConfig::new(in_channels, self.out_channels, inner)
            .with_activation(Activation::None)
            .with_dropout(Dropout::None)
            .with_power_iterations(self.power_iterations)
            .init(device);

        Ok(PatchDiscriminator { units, logits })
    }
}

/// Convolutional patch discriminator with optional spectral normalization.
#[derive(Module, Debug)]
pub struct PatchDiscriminator<B: Backend> {
    units: Vec<ConvUnit<B>>,
    logits: ConvUnit<B>,
}

impl<B: Backend> PatchDiscriminator<B> {
    /// # Shapes
    /// - input: `[N, C_in, H, W]`
    /// - output: `[N, C_out, H / 2^nlayer, W / 2^nlayer]` for the default stride-2 units
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = self.units.iter().fold(x, |h, unit| unit.forward(h));
        self.logits.forward(h)
    }

    /// Scores a (condition, image) pair by concatenating them along channels.
    pub fn forward_pair(&self, condition: Tensor<B, 4>, image: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward(Tensor::cat(vec![condition, image], 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Distribution};

    type TestBackend = NdArray<f32>;

    #[test]
    fn default_discriminator_patch_grid() {
        let device = Default::default();
        let model = PatchDiscriminatorConfig::new()
            .with_nfilter(4)
            .init::<TestBackend>(&device)
            .unwrap();

        let condition = Tensor::<TestBackend, 4>::random([2, 3, 32, 32], Distribution::Default, &device);
        let image = Tensor::<TestBackend, 4>::random([2, 3, 32, 32], Distribution::Default, &device);

        assert_eq!(model.forward_pair(condition, image).dims(), [2, 1, 2, 2]);
    }

    #[test]
    fn inner_units_keep_resolution() {
        let device = Default::default();
        let model = PatchDiscriminatorConfig::new()
            .with_nlayer(2)
            .with_nfilter(4)
            .with_ninner(1)
            .with_norm(Normalization::Batch)
            .init::<TestBackend>(&device)
            .unwrap();

        assert_eq!(model.units.len(), 4);
        assert!(model.units.iter().all(ConvUnit::is_spectral));
        let x = Tensor::<TestBackend, 4>::zeros([1, 6, 16, 16], &device);
        assert_eq!(model.forward(x).dims(), [1, 1, 4, 4]);
    }

    #[test]
    fn zero_layers_are_rejected() {
        let device = Default::default();
        let result = PatchDiscriminatorConfig::new()
            .with_nlayer(0)
            .init::<TestBackend>(&device);
        assert!(result.is_err());
    }
}
