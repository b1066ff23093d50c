//! Monte-Carlo sampling of the predictive distribution.
//!
//! The regressor is evaluated `mc_iteration` times on the same input; with
//! dropout active at inference time the spread of the outputs estimates the
//! model uncertainty.

use burn::prelude::*;

use super::regressor::Regressor;

/// Optional reduction over the channel axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelReduce {
    /// Keep every channel.
    #[default]
    None,
    /// Average the channels into a single one.
    Mean,
}

impl ChannelReduce {
    fn apply<B: Backend>(self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::None => x,
            Self::Mean => x.mean_dim(1),
        }
    }
}

/// Draws repeated stochastic predictions and summarizes them.
#[derive(Debug, Clone)]
pub struct McSampler<B: Backend> {
    model: Regressor<B>,
    mc_iteration: usize,
    reduce_mean: ChannelReduce,
    reduce_var: ChannelReduce,
}

impl<B: Backend> McSampler<B> {
    /// Creates a sampler drawing `mc_iteration` passes (at least one).
    pub fn new(model: Regressor<B>, mc_iteration: usize) -> Self {
        Self {
            model,
            mc_iteration: mc_iteration.max(1),
            reduce_mean: ChannelReduce::None,
            reduce_var: ChannelReduce::Mean,
        }
    }

    /// Sets the channel reduction of the mean.
    #[must_use]
    pub const fn with_reduce_mean(mut self, reduce: ChannelReduce) -> Self {
        self.reduce_mean = reduce;
        self
    }

    /// Sets the channel reduction of the variance.
    #[must_use]
    pub const fn with_reduce_var(mut self, reduce: ChannelReduce) -> Self {
        self.reduce_var = reduce;
        self
    }

    /// Number of stochastic passes.
    pub const fn mc_iteration(&self) -> usize {
        self.mc_iteration
    }

    /// Returns the sample mean and the population variance of the passes.
    ///
    /// # Shapes
    /// - input: `[N, C_in, H, W]`
    /// - mean: `[N, C_out, H, W]` (`[N, 1, H, W]` with `ChannelReduce::Mean`)
    /// - variance: `[N, 1, H, W]` by default
    pub fn sample(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let samples: Vec<Tensor<B, 4>> = (0..self.mc_iteration)
            .map(|_| self.model.forward(x.clone()))
            .collect();
        let samples: Tensor<B, 5> = Tensor::stack(samples, 0);

        let mean = samples.clone().mean_dim(0);
        let variance = (samples - mean.clone()).powf_scalar(2.0).mean_dim(0);

        let mean: Tensor<B, 4> = mean.squeeze(0);
        let variance: Tensor<B, 4> = variance.squeeze(0);
        (self.reduce_mean.apply(mean), self.reduce_var.apply(variance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BayesianUNetConfig;
    use burn::{backend::NdArray, tensor::Distribution};

    type TestBackend = NdArray<f32>;

    fn regressor(dropout: bool) -> Regressor<TestBackend> {
        let device = Default::default();
        let predictor = BayesianUNetConfig::new()
            .with_nlayer(2)
            .with_nfilter(vec![4, 8])
            .with_dropout_enables(vec![dropout, dropout])
            .init::<TestBackend>(&device)
            .unwrap();
        Regressor::new(predictor)
    }

    fn input() -> Tensor<TestBackend, 4> {
        Tensor::random([2, 3, 8, 8], Distribution::Default, &Default::default())
    }

    #[test]
    fn single_pass_has_zero_variance() {
        let sampler = McSampler::new(regressor(true), 1);
        let (mean, variance) = sampler.sample(input());

        assert_eq!(mean.dims(), [2, 3, 8, 8]);
        assert_eq!(variance.dims(), [2, 1, 8, 8]);
        assert_eq!(variance.abs().sum().into_scalar(), 0.0);
    }

    #[test]
    fn deterministic_model_has_zero_variance() {
        let sampler = McSampler::new(regressor(false), 5);
        let (_, variance) = sampler.sample(input());

        assert!(variance.max().into_scalar() < 1e-10);
    }

    #[test]
    fn dropout_yields_positive_variance_and_bounded_mean() {
        let sampler = McSampler::new(regressor(true), 8).with_reduce_var(ChannelReduce::None);
        let (mean, variance) = sampler.sample(input());

        assert_eq!(variance.dims(), [2, 3, 8, 8]);
        assert!(variance.sum().into_scalar() > 0.0);
        assert!(mean.abs().max().into_scalar() <= 1.0);
    }

    #[test]
    fn zero_iterations_fall_back_to_one() {
        assert_eq!(McSampler::new(regressor(false), 0).mc_iteration(), 1);
    }
}
