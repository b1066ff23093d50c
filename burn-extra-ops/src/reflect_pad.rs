//! # Reflection Padding
//!
//! Burn only ships constant padding. Reflection padding mirrors the border
//! without repeating the edge pixel, matching `torch.nn.ReflectionPad2d`.

use burn::prelude::*;

/// Pads the last two dimensions of a `[N, C, H, W]` tensor by reflection.
///
/// `padding` is `(top, bottom, left, right)`. Each amount must be smaller than
/// the corresponding spatial size.
///
/// # Panics
///
/// Panics if a padding amount is not smaller than the dimension it pads.
pub fn reflect_pad2d<B: Backend>(
    x: Tensor<B, 4>,
    padding: (usize, usize, usize, usize),
) -> Tensor<B, 4> {
    let (top, bottom, left, right) = padding;
    let x = reflect_dim(x, 2, top, bottom);
    reflect_dim(x, 3, left, right)
}

fn reflect_dim<B: Backend>(x: Tensor<B, 4>, dim: usize, before: usize, after: usize) -> Tensor<B, 4> {
    if before == 0 && after == 0 {
        return x;
    }
    let size = x.dims()[dim];
    assert!(
        before < size && after < size,
        "reflection padding ({before}, {after}) must be smaller than dimension size {size}"
    );

    let mut parts = Vec::with_capacity(3);
    if before > 0 {
        parts.push(narrow(x.clone(), dim, 1, before).flip([dim as isize]));
    }
    parts.push(x.clone());
    if after > 0 {
        parts.push(narrow(x, dim, size - after - 1, after).flip([dim as isize]));
    }
    Tensor::cat(parts, dim)
}

fn narrow<B: Backend>(x: Tensor<B, 4>, dim: usize, start: usize, len: usize) -> Tensor<B, 4> {
    let dims = x.dims();
    let mut ranges = dims.map(|d| 0..d);
    ranges[dim] = start..start + len;
    x.slice(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    type TestBackend = NdArray;

    #[test]
    fn mirrors_without_edge_repeat() {
        let device = NdArrayDevice::default();
        let x = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0, 3.0, 4.0], &device)
            .reshape([1, 1, 1, 4]);

        let padded = reflect_pad2d(x, (0, 0, 2, 1));
        let values = padded.into_data().to_vec::<f32>().unwrap();

        assert_eq!(values, vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0]);
    }

    #[test]
    fn pads_both_spatial_dims() {
        let device = NdArrayDevice::default();
        let x = Tensor::<TestBackend, 4>::ones([2, 3, 5, 6], &device);

        let padded = reflect_pad2d(x, (1, 1, 2, 2));

        assert_eq!(padded.dims(), [2, 3, 7, 10]);
    }

    #[test]
    #[should_panic(expected = "must be smaller")]
    fn rejects_oversized_padding() {
        let device = NdArrayDevice::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);

        let _ = reflect_pad2d(x, (2, 0, 0, 0));
    }
}
