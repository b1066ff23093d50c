//! Regression head around the generator.

use burn::{prelude::*, tensor::activation::tanh};

use super::unet::BayesianUNet;

/// Mean absolute error.
pub fn l1_loss<B: Backend>(y: Tensor<B, 4>, t: Tensor<B, 4>) -> Tensor<B, 1> {
    (y - t).abs().mean()
}

/// Wraps a predictor with a `tanh` output activation and an L1 objective.
#[derive(Module, Debug)]
pub struct Regressor<B: Backend> {
    predictor: BayesianUNet<B>,
}

impl<B: Backend> Regressor<B> {
    /// Creates a new regressor around `predictor`.
    pub const fn new(predictor: BayesianUNet<B>) -> Self {
        Self { predictor }
    }

    /// The wrapped predictor.
    pub const fn predictor(&self) -> &BayesianUNet<B> {
        &self.predictor
    }

    /// Returns the predictor, e.g. to freeze some of its layers.
    pub fn into_predictor(self) -> BayesianUNet<B> {
        self.predictor
    }

    /// `tanh(predictor(x))`, values in `[-1, 1]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        tanh(self.predictor.forward(x))
    }

    /// Training objective between a prediction and its target.
    pub fn loss(&self, y: Tensor<B, 4>, t: Tensor<B, 4>) -> Tensor<B, 1> {
        l1_loss(y, t)
    }

    /// Validation metric; the mean absolute error, lower is better.
    pub fn accuracy(&self, y: Tensor<B, 4>, t: Tensor<B, 4>) -> Tensor<B, 1> {
        l1_loss(y, t)
    }
}
