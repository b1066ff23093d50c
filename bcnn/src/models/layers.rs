//! Building blocks shared by the generator and the discriminator.
//!
//! A conv unit is `pad -> conv -> norm -> activation -> dropout`, where every
//! stage after the convolution is optional and selected by the config enums.

use burn::{
    module::{Ignored, Param, RunningState},
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        BatchNorm, BatchNormConfig, Dropout as DropoutLayer, DropoutConfig, Initializer,
        PaddingConfig2d,
    },
    prelude::*,
    tensor::{
        activation::{leaky_relu, relu, tanh},
        module::conv2d,
        ops::ConvOptions,
        Distribution,
    },
};
use burn_extra_ops::{
    bilinear_kernel, spectral_normalize, McDropout, McDropoutConfig, TensorExtraOps,
};

use crate::config::{Activation, BiasInit, ConvParam, Dropout, Normalization, PaddingMode, WeightInit};

const SPECTRAL_EPS: f64 = 1e-12;

fn initializer(init: &WeightInit) -> Option<Initializer> {
    match init {
        WeightInit::Normal(std) => Some(Initializer::Normal {
            mean: 0.0,
            std: *std,
        }),
        WeightInit::Default | WeightInit::Bilinear => None,
    }
}

fn init_bias<B: Backend>(
    bias: Option<Param<Tensor<B, 1>>>,
    bias_init: &BiasInit,
    channels: usize,
    device: &B::Device,
) -> Option<Param<Tensor<B, 1>>> {
    bias.map(|bias| match bias_init {
        BiasInit::Zero => Param::from_tensor(Tensor::zeros([channels], device)),
        BiasInit::Normal(std) => Param::from_tensor(Tensor::random(
            [channels],
            Distribution::Normal(0.0, *std),
            device,
        )),
    })
}

/// Dropout stage of a unit.
#[derive(Module, Debug)]
pub enum DropoutStage<B: Backend> {
    /// Dropout active only during autodiff training.
    Standard(DropoutLayer),
    /// Dropout active in every forward pass.
    Mc(McDropout<B>),
}

impl<B: Backend> DropoutStage<B> {
    fn new(dropout: &Dropout) -> Option<Self> {
        match dropout {
            Dropout::None => None,
            Dropout::Standard(prob) => Some(Self::Standard(DropoutConfig::new(*prob).init())),
            Dropout::McDropout(prob) => {
                Some(Self::Mc(McDropoutConfig::new().with_prob(*prob).init()))
            }
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Standard(dropout) => dropout.forward(x),
            Self::Mc(dropout) => dropout.forward(x),
        }
    }
}

/// Applies a configured activation.
pub fn activate<B: Backend>(activation: &Activation, x: Tensor<B, 4>) -> Tensor<B, 4> {
    match activation {
        Activation::None => x,
        Activation::Relu => relu(x),
        Activation::LeakyRelu(slope) => leaky_relu(x, *slope),
        Activation::Tanh => tanh(x),
    }
}

/// Configuration of a `ConvUnit`.
#[derive(Config, Debug)]
pub struct ConvUnitConfig {
    /// Input channels.
    pub in_channels: usize,
    /// Output channels.
    pub out_channels: usize,
    /// Convolution hyperparameters.
    pub conv: ConvParam,
    /// Normalization after the convolution.
    #[config(default = "Normalization::None")]
    pub norm: Normalization,
    /// Activation after the normalization.
    #[config(default = "Activation::None")]
    pub activation: Activation,
    /// Dropout after the activation.
    #[config(default = "Dropout::None")]
    pub dropout: Dropout,
    /// Power iterations when spectral normalization is enabled.
    #[config(default = "1")]
    pub power_iterations: usize,
}

impl ConvUnitConfig {
    /// Initializes a new `ConvUnit`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvUnit<B> {
        let conv = &self.conv;
        let (inner_padding, reflect) = match conv.padding_mode {
            PaddingMode::Zeros => (conv.padding, 0),
            PaddingMode::Reflect => (0, conv.padding),
        };

        let mut config = Conv2dConfig::new(
            [self.in_channels, self.out_channels],
            [conv.kernel_size, conv.kernel_size],
        )
        .with_stride([conv.stride, conv.stride])
        .with_padding(PaddingConfig2d::Explicit(inner_padding, inner_padding))
        .with_bias(conv.bias);
        if let Some(init) = initializer(&conv.init) {
            config = config.with_initializer(init);
        }
        let mut layer = config.init(device);
        layer.bias = init_bias(layer.bias, &conv.bias_init, self.out_channels, device);

        let norm = match self.norm {
            Normalization::Batch => Some(BatchNormConfig::new(self.out_channels).init(device)),
            Normalization::None => None,
        };
        let spectral_u = conv.spectral_norm.then(|| {
            RunningState::new(Tensor::random(
                [self.out_channels, 1],
                Distribution::Normal(0.0, 1.0),
                device,
            ))
        });

        ConvUnit {
            conv: layer,
            norm,
            dropout: DropoutStage::new(&self.dropout),
            activation: Ignored(self.activation.clone()),
            spectral_u,
            reflect,
            stride: conv.stride,
            padding: inner_padding,
            spectral_iterations: self.power_iterations.max(1),
        }
    }
}

/// `pad -> conv -> norm -> activation -> dropout`.
#[derive(Module, Debug)]
pub struct ConvUnit<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<BatchNorm<B, 2>>,
    dropout: Option<DropoutStage<B>>,
    activation: Ignored<Activation>,
    /// Left singular vector estimate `[C_out, 1]`, advanced on every forward pass.
    spectral_u: Option<RunningState<Tensor<B, 2>>>,
    reflect: usize,
    stride: usize,
    padding: usize,
    spectral_iterations: usize,
}

impl<B: Backend> ConvUnit<B> {
    /// # Shapes
    /// - input: `[N, C_in, H, W]`
    /// - output: `[N, C_out, H', W']`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let r = self.reflect;
        let x = if r > 0 {
            x.reflect_pad((r, r, r, r))
        } else {
            x
        };

        let x = if let Some(state) = &self.spectral_u {
            let (weight, u) = spectral_normalize(
                self.conv.weight.val(),
                state.value(),
                self.spectral_iterations,
                SPECTRAL_EPS,
            );
            state.update(u);
            conv2d(
                x,
                weight,
                self.conv.bias.as_ref().map(Param::val),
                ConvOptions::new(
                    [self.stride, self.stride],
                    [self.padding, self.padding],
                    [1, 1],
                    1,
                ),
            )
        } else {
            self.conv.forward(x)
        };

        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        let x = activate(&self.activation.0, x);
        match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        }
    }

    /// Whether the weights are divided by their spectral norm.
    pub const fn is_spectral(&self) -> bool {
        self.spectral_u.is_some()
    }
}

/// Configuration of an `UpConvUnit`.
#[derive(Config, Debug)]
pub struct UpConvUnitConfig {
    /// Input channels.
    pub in_channels: usize,
    /// Output channels.
    pub out_channels: usize,
    /// Transposed-convolution hyperparameters.
    pub conv: ConvParam,
    /// Normalization after the transposed convolution.
    #[config(default = "Normalization::None")]
    pub norm: Normalization,
    /// Activation after the normalization.
    #[config(default = "Activation::None")]
    pub activation: Activation,
    /// Dropout after the activation.
    #[config(default = "Dropout::None")]
    pub dropout: Dropout,
}

impl UpConvUnitConfig {
    /// Initializes a new `UpConvUnit`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> UpConvUnit<B> {
        let conv = &self.conv;
        let mut config = ConvTranspose2dConfig::new(
            [self.in_channels, self.out_channels],
            [conv.kernel_size, conv.kernel_size],
        )
        .with_stride([conv.stride, conv.stride])
        .with_padding([conv.padding, conv.padding])
        .with_bias(conv.bias);
        if let Some(init) = initializer(&conv.init) {
            config = config.with_initializer(init);
        }
        let mut layer = config.init(device);
        if conv.init == WeightInit::Bilinear {
            layer.weight = Param::from_tensor(bilinear_kernel(
                self.in_channels,
                self.out_channels,
                conv.kernel_size,
                device,
            ));
        }
        layer.bias = init_bias(layer.bias, &conv.bias_init, self.out_channels, device);

        let norm = match self.norm {
            Normalization::Batch => Some(BatchNormConfig::new(self.out_channels).init(device)),
            Normalization::None => None,
        };

        UpConvUnit {
            deconv: layer,
            norm,
            dropout: DropoutStage::new(&self.dropout),
            activation: Ignored(self.activation.clone()),
        }
    }
}

/// `deconv -> norm -> activation -> dropout`.
#[derive(Module, Debug)]
pub struct UpConvUnit<B: Backend> {
    deconv: ConvTranspose2d<B>,
    norm: Option<BatchNorm<B, 2>>,
    dropout: Option<DropoutStage<B>>,
    activation: Ignored<Activation>,
}

impl<B: Backend> UpConvUnit<B> {
    /// # Shapes
    /// - input: `[N, C_in, H, W]`
    /// - output: `[N, C_out, H * stride, W * stride]` for `kernel = 2 * stride`, `padding = stride / 2`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.deconv.forward(x);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        let x = activate(&self.activation.0, x);
        match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        }
    }

    /// The transposed-convolution weight `[C_in, C_out, k, k]`.
    pub fn weight(&self) -> Tensor<B, 4> {
        self.deconv.weight.val()
    }

    /// Stops gradient tracking for the transposed convolution only; the
    /// normalization keeps training.
    #[must_use]
    pub fn freeze_deconv(mut self) -> Self {
        self.deconv = self.deconv.no_grad();
        self
    }

    /// Scale parameter of the normalization, if any.
    pub fn norm_gamma(&self) -> Option<Tensor<B, 1>> {
        self.norm.as_ref().map(|norm| norm.gamma.val())
    }
}
