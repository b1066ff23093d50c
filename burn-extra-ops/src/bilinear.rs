//! Bilinear up-sampling kernels for transposed convolutions.

use burn::{prelude::*, tensor::TensorData};

/// Builds a `[in_channels, out_channels, k, k]` transposed-convolution weight that
/// performs bilinear interpolation channel by channel.
///
/// Off-diagonal channel pairs are zero, so with `in_channels == out_channels` and
/// stride `k / 2` the layer acts as a bilinear up-sampler.
pub fn bilinear_kernel<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let factor = ((kernel_size + 1) / 2) as f32;
    let center = if kernel_size % 2 == 1 {
        factor - 1.0
    } else {
        factor - 0.5
    };

    let mut filter = Vec::with_capacity(kernel_size * kernel_size);
    for row in 0..kernel_size {
        for col in 0..kernel_size {
            let wy = 1.0 - libm::fabsf(row as f32 - center) / factor;
            let wx = 1.0 - libm::fabsf(col as f32 - center) / factor;
            filter.push(wy * wx);
        }
    }

    let plane = kernel_size * kernel_size;
    let mut weights = vec![0.0f32; in_channels * out_channels * plane];
    for channel in 0..in_channels.min(out_channels) {
        let offset = (channel * out_channels + channel) * plane;
        weights[offset..offset + plane].copy_from_slice(&filter);
    }

    Tensor::from_data(
        TensorData::new(weights, [in_channels, out_channels, kernel_size, kernel_size]),
        device,
    )
}
