//! Batching of image pairs into tensors.

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Tensor},
};

use super::dataset::PairItem;

/// A batch of image pairs.
#[derive(Debug, Clone)]
pub struct PairBatch<B: Backend> {
    /// Inputs `[N, C, H, W]`.
    pub x: Tensor<B, 4>,
    /// Targets `[N, C, H, W]`.
    pub t: Tensor<B, 4>,
}

impl<B: Backend> PairBatch<B> {
    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.x.dims()[0]
    }

    /// Whether the batch holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stacks `PairItem`s into a `PairBatch` on the target device.
#[derive(Clone, Default)]
pub struct PairBatcher<B: Backend> {
    _phantom: std::marker::PhantomData<B>,
}

impl<B: Backend> PairBatcher<B> {
    /// Create a new pair batcher.
    pub const fn new() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, PairItem, PairBatch<B>> for PairBatcher<B> {
    fn batch(&self, items: Vec<PairItem>, device: &B::Device) -> PairBatch<B> {
        let mut xs = Vec::with_capacity(items.len());
        let mut ts = Vec::with_capacity(items.len());

        for item in items {
            xs.push(item.image.to_tensor::<B>(device));
            ts.push(item.label.to_tensor::<B>(device));
        }

        PairBatch {
            x: Tensor::stack(xs, 0),
            t: Tensor::stack(ts, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::image::ImageArray;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn stacks_along_batch_dimension() {
        let device = Default::default();
        let items = (0..3)
            .map(|i| PairItem {
                image: ImageArray::new(3, 2, 2, vec![i as f32; 12]).unwrap(),
                label: ImageArray::new(1, 2, 2, vec![-(i as f32); 4]).unwrap(),
            })
            .collect();

        let batch: PairBatch<TestBackend> = PairBatcher::new().batch(items, &device);

        assert_eq!(batch.x.dims(), [3, 3, 2, 2]);
        assert_eq!(batch.t.dims(), [3, 1, 2, 2]);
        assert_eq!(batch.len(), 3);
        let second: f32 = batch.x.slice([1..2, 0..1, 0..1, 0..1]).into_scalar();
        assert_eq!(second, 1.0);
    }
}
