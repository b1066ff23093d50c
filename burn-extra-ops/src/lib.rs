//! Additional operations for the Burn deep learning framework
//!
//! This crate provides operations that are commonly used in deep learning but are not
//! yet available in the core Burn framework.

use burn::prelude::*;

mod bilinear;
mod mc_dropout;
mod reflect_pad;
mod spectral_norm;

// Convenient re-exports
pub use bilinear::bilinear_kernel;
pub use mc_dropout::{McDropout, McDropoutConfig};
pub use reflect_pad::reflect_pad2d;
pub use spectral_norm::{power_iteration, spectral_norm_estimate, spectral_normalize};

/// Additional operations for Burn tensors
pub trait TensorExtraOps<B: Backend> {
    /// Pad height and width by reflection: `(top, bottom, left, right)`
    fn reflect_pad(self, padding: (usize, usize, usize, usize)) -> Self;
}

impl<B: Backend> TensorExtraOps<B> for Tensor<B, 4> {
    fn reflect_pad(self, padding: (usize, usize, usize, usize)) -> Self {
        reflect_pad2d(self, padding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{ndarray::NdArray, Autodiff},
        tensor::Tensor,
    };

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn reflect_pad_method() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 4>::random(
            [2, 3, 4, 5],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        let padded = tensor.reflect_pad((1, 1, 1, 1));
        assert_eq!(padded.dims(), [2, 3, 6, 7]);
    }
}
