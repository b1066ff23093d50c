//! # Bayesian U-Net
//!
//! A U-Net generator whose expansive path carries Monte-Carlo dropout, so that
//! repeated forward passes on the same input sample the predictive
//! distribution.
//!
//! ```text
//! level 0   units ---------------------------------- concat -> units -> 1x1
//! level 1     pool -> units ----------- concat -> units -> upconv
//!  ...                 ...                  ...
//! level n-1              pool -> units -> upconv
//! ```

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
};

use super::layers::{ConvUnit, ConvUnitConfig, UpConvUnit, UpConvUnitConfig};
use crate::{
    config::{BayesianUNetConfig, ConvParam, Dropout, Normalization, Pooling},
    error::{BcnnError, BcnnResult},
};

/// Down-sampling at the entry of a contracting level.
#[derive(Module, Debug)]
pub enum PoolStage<B: Backend> {
    /// Strided convolution unit.
    Conv(ConvUnit<B>),
    /// Max pooling.
    Max(MaxPool2d),
}

impl<B: Backend> PoolStage<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Conv(unit) => unit.forward(x),
            Self::Max(pool) => pool.forward(x),
        }
    }
}

/// One level of the contracting path.
#[derive(Module, Debug)]
pub struct ContractLevel<B: Backend> {
    pool: Option<PoolStage<B>>,
    units: Vec<ConvUnit<B>>,
}

impl<B: Backend> ContractLevel<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        };
        self.units.iter().fold(x, |x, unit| unit.forward(x))
    }
}

/// One level of the expansive path.
#[derive(Module, Debug)]
pub struct ExpandLevel<B: Backend> {
    upconv: UpConvUnit<B>,
    units: Vec<ConvUnit<B>>,
}

impl<B: Backend> ExpandLevel<B> {
    fn forward(&self, x: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.upconv.forward(x);
        let x = Tensor::cat(vec![x, skip], 1);
        self.units.iter().fold(x, |x, unit| unit.forward(x))
    }
}

impl BayesianUNetConfig {
    /// Initializes a new `BayesianUNet`.
    ///
    /// # Errors
    ///
    /// Returns `BcnnError::InvalidConfiguration` if the configuration is invalid.
    pub fn init<B: Backend>(&self, device: &B::Device) -> BcnnResult<BayesianUNet<B>> {
        self.validate()?;

        let dropout_at = |level: usize, dropout: &Dropout| {
            if self.dropout_enables[level] {
                dropout.clone()
            } else {
                Dropout::None
            }
        };
        let unit = |in_channels: usize, out_channels: usize, norm: Normalization, dropout: Dropout| {
            ConvUnitConfig::new(in_channels, out_channels, self.conv.clone())
                .with_norm(norm)
                .with_activation(self.activation.clone())
                .with_dropout(dropout)
                .init(device)
        };

        let mut contract = Vec::with_capacity(self.nlayer);
        for level in 0..self.nlayer {
            let out_channels = self.nfilter[level];
            let mut in_channels = if level == 0 {
                self.in_channels
            } else {
                self.nfilter[level - 1]
            };

            let pool = match (level, &self.pool) {
                (0, _) | (_, Pooling::None) => None,
                (_, Pooling::Stride(stride)) => {
                    let param = ConvParam::new()
                        .with_kernel_size(2 * stride)
                        .with_stride(*stride)
                        .with_padding(stride / 2)
                        .with_padding_mode(self.conv.padding_mode.clone())
                        .with_init(self.conv.init.clone())
                        .with_bias(self.conv.bias)
                        .with_bias_init(self.conv.bias_init.clone());
                    let stage = ConvUnitConfig::new(in_channels, out_channels, param)
                        .with_norm(self.norm.clone())
                        .with_activation(self.activation.clone())
                        .init(device);
                    in_channels = out_channels;
                    Some(PoolStage::Conv(stage))
                }
                (_, Pooling::Max(size)) => Some(PoolStage::Max(
                    MaxPool2dConfig::new([*size, *size])
                        .with_strides([*size, *size])
                        .init(),
                )),
            };

            let mut units = Vec::with_capacity(self.ninner);
            for i in 0..self.ninner {
                let norm = if level == 0 && i == 0 && self.preserve_color {
                    Normalization::None
                } else {
                    self.norm.clone()
                };
                let source = if i == 0 { in_channels } else { out_channels };
                units.push(unit(source, out_channels, norm, dropout_at(level, &self.dropout)));
            }
            contract.push(ContractLevel { pool, units });
        }

        let mut expand = Vec::with_capacity(self.nlayer - 1);
        for level in 0..self.nlayer - 1 {
            let channels = self.nfilter[level];
            // Without inner units the concatenation feeds the next up-convolution.
            let source = if self.exp_ninner == 0 && level + 1 < self.nlayer - 1 {
                2 * self.nfilter[level + 1]
            } else {
                self.nfilter[level + 1]
            };
            let upconv = UpConvUnitConfig::new(source, channels, self.upconv.clone())
                .with_norm(self.norm.clone())
                .with_activation(self.exp_activation.clone())
                .with_dropout(dropout_at(level, &self.exp_dropout))
                .init(device);

            let units = (0..self.exp_ninner)
                .map(|i| {
                    let source = if i == 0 { 2 * channels } else { channels };
                    ConvUnitConfig::new(source, channels, self.conv.clone())
                        .with_norm(self.norm.clone())
                        .with_activation(self.exp_activation.clone())
                        .init(device)
                })
                .collect();
            expand.push(ExpandLevel { upconv, units });
        }

        let head_channels = match (self.nlayer, self.exp_ninner) {
            (1, _) | (_, 1..) => self.nfilter[0],
            (_, 0) => 2 * self.nfilter[0],
        };
        let head = Conv2dConfig::new([head_channels, self.out_channels], [1, 1]).init(device);

        tracing::debug!(
            nlayer = self.nlayer,
            in_channels = self.in_channels,
            out_channels = self.out_channels,
            "initialized Bayesian U-Net"
        );

        Ok(BayesianUNet {
            contract,
            expand,
            head,
        })
    }
}

/// U-Net generator with Monte-Carlo dropout in the expansive path.
#[derive(Module, Debug)]
pub struct BayesianUNet<B: Backend> {
    contract: Vec<ContractLevel<B>>,
    expand: Vec<ExpandLevel<B>>,
    head: Conv2d<B>,
}

impl<B: Backend> BayesianUNet<B> {
    /// Runs the network. The output is linear (no final activation).
    ///
    /// # Shapes
    /// - input: `[N, C_in, H, W]` with `H` and `W` divisible by `2^(nlayer-1)`
    /// - output: `[N, C_out, H, W]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut skips = Vec::with_capacity(self.contract.len());
        let mut h = x;
        for level in &self.contract {
            h = level.forward(h);
            skips.push(h.clone());
        }
        // The deepest level feeds the expansive path directly.
        skips.pop();

        for (level, skip) in self.expand.iter().zip(skips).rev() {
            h = level.forward(h, skip);
        }
        self.head.forward(h)
    }

    /// Number of resolution levels.
    pub fn nlayer(&self) -> usize {
        self.contract.len()
    }

    /// Stops gradient tracking for every layer of the named kind.
    ///
    /// Only `"upconv"` is recognized; it freezes the transposed convolutions
    /// and leaves their normalization trainable.
    ///
    /// # Errors
    ///
    /// Returns `BcnnError::InvalidConfiguration` for unknown layer kinds.
    pub fn freeze_layers(mut self, kind: &str) -> BcnnResult<Self> {
        if kind != "upconv" {
            return Err(BcnnError::InvalidConfiguration {
                reason: format!("cannot freeze unknown layer kind `{kind}`"),
            });
        }
        for (level, stage) in self.expand.iter_mut().enumerate() {
            stage.upconv = stage.upconv.clone().freeze_deconv();
            tracing::info!(layer = %format!("expand.{level}.upconv.deconv"), "freeze");
        }
        Ok(self)
    }

    /// Up-convolution weights, from level 0 upwards.
    pub fn upconv_weights(&self) -> Vec<Tensor<B, 4>> {
        self.expand.iter().map(|level| level.upconv.weight()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeightInit;
    use burn::{
        backend::{Autodiff, NdArray},
        module::AutodiffModule,
        tensor::Distribution,
    };

    type TestBackend = NdArray<f32>;
    type TrainBackend = Autodiff<TestBackend>;

    fn small_config() -> BayesianUNetConfig {
        BayesianUNetConfig::new()
            .with_nlayer(3)
            .with_nfilter(vec![4, 8, 8])
            .with_dropout_enables(vec![false, true, false])
    }

    #[test]
    fn output_matches_input_resolution() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device).unwrap();

        let x = Tensor::<TestBackend, 4>::random([2, 3, 16, 16], Distribution::Default, &device);
        assert_eq!(model.forward(x).dims(), [2, 3, 16, 16]);
        assert_eq!(model.nlayer(), 3);
    }

    #[test]
    fn max_pooling_and_expansive_units() {
        let device = Default::default();
        let model = small_config()
            .with_pool(Pooling::Max(2))
            .with_exp_ninner(2)
            .with_out_channels(1)
            .init::<TestBackend>(&device)
            .unwrap();

        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 8, 8], &device);
        assert_eq!(model.forward(x).dims(), [1, 1, 8, 8]);
    }

    #[test]
    fn mc_dropout_makes_inference_stochastic() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device).unwrap();

        let x = Tensor::<TestBackend, 4>::random([1, 3, 8, 8], Distribution::Default, &device);
        let diff: f32 = (model.forward(x.clone()) - model.forward(x))
            .abs()
            .sum()
            .into_scalar();
        assert!(diff > 0.0);
    }

    #[test]
    fn no_dropout_is_deterministic() {
        let device = Default::default();
        let model = small_config()
            .with_dropout_enables(vec![false; 3])
            .init::<TrainBackend>(&device)
            .unwrap()
            .valid();

        let x = Tensor::<TestBackend, 4>::random([1, 3, 8, 8], Distribution::Default, &device);
        let diff: f32 = (model.forward(x.clone()) - model.forward(x))
            .abs()
            .sum()
            .into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn frozen_upconv_receives_no_gradient() {
        let device = Default::default();
        let model = small_config()
            .with_upconv(
                ConvParam::new()
                    .with_kernel_size(4)
                    .with_stride(2)
                    .with_padding(1)
                    .with_bias(false)
                    .with_init(WeightInit::Bilinear),
            )
            .init::<TrainBackend>(&device)
            .unwrap()
            .freeze_layers("upconv")
            .unwrap();

        let x = Tensor::<TrainBackend, 4>::ones([1, 3, 8, 8], &device);
        let grads = model.forward(x).sum().backward();

        for weight in model.upconv_weights() {
            assert!(weight.grad(&grads).is_none());
        }
        for stage in &model.expand {
            let gamma = stage.upconv.norm_gamma().unwrap();
            assert!(gamma.grad(&grads).is_some());
        }
        assert!(model.head.weight.val().grad(&grads).is_some());
    }

    #[test]
    fn unknown_freeze_kind_is_rejected() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device).unwrap();
        assert!(model.freeze_layers("conv").is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let device = Default::default();
        let result = BayesianUNetConfig::new()
            .with_nlayer(2)
            .init::<TestBackend>(&device);
        assert!(result.is_err());
    }
}
