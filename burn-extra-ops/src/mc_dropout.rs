//! # Monte-Carlo Dropout
//!
//! Dropout that stays active at inference time. Burn's `nn::Dropout` is a no-op
//! on non-autodiff backends, which makes it useless for sampling a predictive
//! distribution from a trained network. This module always draws a fresh mask.

use burn::{prelude::*, tensor::Distribution};

/// Configuration for the `McDropout` module.
#[derive(Config, Debug)]
pub struct McDropoutConfig {
    /// The probability of zeroing an element.
    #[config(default = "0.5")]
    pub prob: f64,
}

impl McDropoutConfig {
    /// Initializes a new `McDropout` module.
    pub const fn init<B: Backend>(&self) -> McDropout<B> {
        McDropout {
            prob: self.prob,
            _phantom: std::marker::PhantomData,
        }
    }
}

/// Dropout that samples a mask on every forward pass, in training and in inference.
#[derive(Module, Debug)]
pub struct McDropout<B: Backend> {
    prob: f64,
    _phantom: std::marker::PhantomData<B>,
}

impl<B: Backend> McDropout<B> {
    /// Drop probability.
    pub const fn prob(&self) -> f64 {
        self.prob
    }

    /// Applies an element-wise Bernoulli mask scaled by `1 / (1 - prob)`.
    ///
    /// # Shapes
    /// - input: `[...]`
    /// - output: `[...]`
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        if self.prob <= 0.0 {
            return x;
        }
        if self.prob >= 1.0 {
            return x.zeros_like();
        }
        let keep_prob = 1.0 - self.prob;
        let mask = Tensor::random(x.shape(), Distribution::Bernoulli(keep_prob), &x.device());

        x * mask / keep_prob
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    type TestBackend = NdArray;

    #[test]
    fn zero_prob_is_identity() {
        let device = NdArrayDevice::default();
        let dropout = McDropoutConfig::new().with_prob(0.0).init::<TestBackend>();
        let x = Tensor::<TestBackend, 4>::ones([2, 3, 4, 4], &device);

        let diff = (dropout.forward(x.clone()) - x).abs().sum();
        assert_eq!(diff.into_scalar(), 0.0);
    }

    #[test]
    fn active_without_autodiff() {
        let device = NdArrayDevice::default();
        let dropout = McDropoutConfig::new().with_prob(0.5).init::<TestBackend>();
        let x = Tensor::<TestBackend, 2>::ones([64, 64], &device);

        let output = dropout.forward(x);
        let values = output.into_data().to_vec::<f32>().unwrap();

        let dropped = values.iter().filter(|v| **v == 0.0).count();
        let kept = values.iter().filter(|v| (**v - 2.0).abs() < 1e-6).count();
        assert_eq!(dropped + kept, 64 * 64, "values are either dropped or rescaled");
        let rate = dropped as f64 / (64.0 * 64.0);
        assert!((rate - 0.5).abs() < 0.1, "drop rate {rate} far from 0.5");
    }

    #[test]
    fn two_passes_differ() {
        let device = NdArrayDevice::default();
        let dropout = McDropoutConfig::new().init::<TestBackend>();
        let x = Tensor::<TestBackend, 2>::ones([32, 32], &device);

        let a = dropout.forward(x.clone());
        let b = dropout.forward(x);
        let diff = (a - b).abs().sum().into_scalar();
        assert!(diff > 0.0);
    }
}
