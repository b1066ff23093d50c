//! Data pipeline: image I/O, normalization, augmentation, datasets and batching.

pub mod augmentor;
pub mod batcher;
pub mod dataset;
pub mod image;
pub mod normalizer;

pub use augmentor::{AugmentOp, DataAugmentor};
pub use batcher::{PairBatch, PairBatcher};
pub use dataset::{train_valid_split, ImageDataset, PairFiles, PairItem, PairTemplates, Subset};
pub use image::{load_image, save_image, ImageArray, ImageMeta};
pub use normalizer::{NormOp, Normalizer};
