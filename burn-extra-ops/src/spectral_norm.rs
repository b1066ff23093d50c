//! # Spectral Normalization
//!
//! Divides a weight tensor by an estimate of its largest singular value
//! (Miyato et al., 2018). The estimate comes from power iteration on the
//! weight viewed as a `[out, rest]` matrix. Callers that normalize on every
//! forward pass keep the left singular vector `u` between calls, so one
//! iteration per pass is enough to track the weights as they train.
//! The singular vectors are computed on detached weights; gradients flow
//! through `sigma = u^T W v` only.

use burn::prelude::*;

/// Normalizes `weight` (`[out, ...]`) by its spectral norm, starting the power
/// iteration from `u` (`[out, 1]`).
///
/// Returns the normalized weight and the detached `u` to pass to the next call.
pub fn spectral_normalize<B: Backend, const D: usize>(
    weight: Tensor<B, D>,
    u: Tensor<B, 2>,
    n_power_iterations: usize,
    eps: f64,
) -> (Tensor<B, D>, Tensor<B, 2>) {
    let (sigma, u) = power_iteration(weight.clone(), u, n_power_iterations, eps);
    (weight / sigma.reshape([1; D]), u)
}

/// Estimates the largest singular value of `weight` viewed as `[out, rest]`,
/// starting from a constant vector.
///
/// Returns a single-element tensor that stays attached to the graph of `weight`.
pub fn spectral_norm_estimate<B: Backend, const D: usize>(
    weight: Tensor<B, D>,
    n_power_iterations: usize,
    eps: f64,
) -> Tensor<B, 1> {
    let u = Tensor::<B, 2>::ones([weight.dims()[0], 1], &weight.device());
    power_iteration(weight, u, n_power_iterations, eps).0
}

/// Runs `n_power_iterations` (at least one) steps from `u` and returns
/// `(sigma, u)`.
pub fn power_iteration<B: Backend, const D: usize>(
    weight: Tensor<B, D>,
    u: Tensor<B, 2>,
    n_power_iterations: usize,
    eps: f64,
) -> (Tensor<B, 1>, Tensor<B, 2>) {
    let dims = weight.dims();
    let rows = dims[0];
    let cols = dims.iter().skip(1).product::<usize>().max(1);

    let matrix = weight.reshape([rows, cols]);
    let detached = matrix.clone().detach();

    let mut u = l2_normalize(u.detach(), eps);
    let mut v = l2_normalize(detached.clone().transpose().matmul(u.clone()), eps);
    for step in 0..n_power_iterations.max(1) {
        if step > 0 {
            v = l2_normalize(detached.clone().transpose().matmul(u), eps);
        }
        u = l2_normalize(detached.clone().matmul(v.clone()), eps);
    }

    let sigma = u.clone().transpose().matmul(matrix).matmul(v).reshape([1]);
    (sigma, u)
}

fn l2_normalize<B: Backend>(x: Tensor<B, 2>, eps: f64) -> Tensor<B, 2> {
    let norm = x.clone().powf_scalar(2.0).sum().sqrt().add_scalar(eps);
    x / norm.reshape([1, 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};

    type TestBackend = NdArray;

    fn gapped_matrix(device: &NdArrayDevice) -> Tensor<TestBackend, 2> {
        Tensor::from_floats(
            [
                [3.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 0.5, 0.0],
            ],
            device,
        )
    }

    #[test]
    fn diagonal_matrix_norm_is_largest_entry() {
        let device = NdArrayDevice::default();
        let sigma = spectral_norm_estimate(gapped_matrix(&device), 20, 1e-12).into_scalar();

        assert!((sigma - 3.0).abs() < 1e-3, "sigma = {sigma}");
    }

    #[test]
    fn persistent_vector_converges_one_step_at_a_time() {
        let device = NdArrayDevice::default();
        let weight = gapped_matrix(&device);
        let mut u = Tensor::<TestBackend, 2>::from_floats([[0.1], [1.0], [1.0]], &device);

        let (first, _) = power_iteration(weight.clone(), u.clone(), 1, 1e-12);
        let first = first.into_scalar();
        assert!(first < 2.9, "one step from a poor start is already exact: {first}");

        let mut sigma = 0.0;
        for _ in 0..20 {
            let (estimate, next) = power_iteration(weight.clone(), u, 1, 1e-12);
            sigma = estimate.into_scalar();
            u = next;
        }
        assert!((sigma - 3.0).abs() < 1e-3, "sigma = {sigma}");
    }

    #[test]
    fn normalized_weight_has_unit_norm() {
        let device = NdArrayDevice::default();
        let weight = Tensor::<TestBackend, 4>::random(
            [8, 4, 3, 3],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let u = Tensor::ones([8, 1], &device);

        let (normalized, _) = spectral_normalize(weight, u, 200, 1e-12);
        let sigma = spectral_norm_estimate(normalized, 200, 1e-12).into_scalar();

        assert!((sigma - 1.0).abs() < 1e-2, "sigma = {sigma}");
    }

    #[test]
    fn gradient_reaches_weight() {
        type AdBackend = Autodiff<NdArray>;
        let device = NdArrayDevice::default();
        let weight = Tensor::<AdBackend, 2>::random(
            [4, 6],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        )
        .require_grad();
        let u = Tensor::ones([4, 1], &device);

        let (normalized, _) = spectral_normalize(weight.clone(), u, 3, 1e-12);
        let grads = normalized.sum().backward();

        assert!(weight.grad(&grads).is_some());
    }
}
