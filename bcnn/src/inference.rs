//! Monte-Carlo inference over a dataset and snapshot lookup.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    prelude::*,
};
use walkdir::WalkDir;

use crate::{
    data::{ImageArray, PairBatch, PairBatcher, Subset},
    error::{BcnnError, BcnnResult},
    models::McSampler,
};

/// Returns the path in `dir` whose name is `prefix` followed by the largest
/// 8-digit iteration number. Any suffix after the digits (such as a file
/// extension) is allowed.
///
/// # Errors
///
/// Returns `BcnnError::SnapshotNotFound` if nothing matches.
pub fn find_latest_snapshot(prefix: &str, dir: impl AsRef<Path>) -> BcnnResult<PathBuf> {
    let dir = dir.as_ref();
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?;
            let digits = name.strip_prefix(prefix)?.get(..8)?;
            if !digits.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let iteration: u64 = digits.parse().ok()?;
            Some((iteration, entry.into_path()))
        })
        .max_by_key(|(iteration, _)| *iteration)
        .map(|(_, path)| path)
        .ok_or_else(|| BcnnError::SnapshotNotFound {
            prefix: prefix.to_string(),
            dir: dir.to_path_buf(),
        })
}

/// Per-sample prediction means and variance maps.
#[derive(Debug, Clone, Default)]
pub struct Predictions {
    /// Predicted images `[C, H, W]`, in dataset order.
    pub pred: Vec<ImageArray>,
    /// Variance maps `[1, H, W]`, in dataset order.
    pub uncert: Vec<ImageArray>,
}

/// Runs an `McSampler` over a dataset in order, without shuffling.
pub struct Inferencer<B: Backend> {
    loader: Arc<dyn DataLoader<B, PairBatch<B>>>,
    sampler: McSampler<B>,
    expected: usize,
}

impl<B: Backend> Inferencer<B> {
    /// Creates an inferencer over `dataset` with mini-batches of `batch_size`.
    pub fn new(dataset: Subset, sampler: McSampler<B>, batch_size: usize) -> Self {
        let expected = dataset.len();
        let loader = DataLoaderBuilder::new(PairBatcher::<B>::new())
            .batch_size(batch_size.max(1))
            .build(dataset);
        Self {
            loader,
            sampler,
            expected,
        }
    }

    /// Predicts every sample.
    ///
    /// # Errors
    ///
    /// Returns an error if a prediction cannot be read back from the device, or
    /// `BcnnError::Dataset` if the loader stopped before the last sample.
    pub fn run(&self) -> BcnnResult<Predictions> {
        let mut predictions = Predictions::default();
        for (step, batch) in self.loader.iter().enumerate() {
            let n = batch.len();
            let (mean, variance) = self.sampler.sample(batch.x);
            for i in 0..n {
                let pred = mean.clone().slice([i..i + 1]).squeeze::<3>(0);
                let uncert = variance.clone().slice([i..i + 1]).squeeze::<3>(0);
                predictions.pred.push(ImageArray::from_tensor(pred)?);
                predictions.uncert.push(ImageArray::from_tensor(uncert)?);
            }
            tracing::debug!(step, samples = predictions.pred.len(), "inference batch done");
        }
        if predictions.pred.len() != self.expected {
            return Err(BcnnError::Dataset {
                message: format!(
                    "predicted {} of {} samples; a sample failed to load",
                    predictions.pred.len(),
                    self.expected
                ),
            });
        }
        Ok(predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BayesianUNetConfig,
        data::{save_image, ImageDataset, ImageMeta, PairTemplates},
        models::Regressor,
    };
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn inferencer(root: &Path, n: usize) -> Inferencer<TestBackend> {
        let train = root.join("train");
        std::fs::create_dir_all(&train).unwrap();
        for i in 0..n {
            let array = ImageArray::new(3, 8, 8, vec![i as f32 * 0.1; 192]).unwrap();
            for half in ["a", "b"] {
                save_image(train.join(format!("{i:03}_{half}.mha")), &array, &ImageMeta::default())
                    .unwrap();
            }
        }
        let templates =
            PairTemplates::new("{root}/train/{patient}_a.mha", "{root}/train/{patient}_b.mha");
        let dataset = ImageDataset::new(root, &["*"], &templates, None, None).unwrap();

        let predictor = BayesianUNetConfig::new()
            .with_nlayer(2)
            .with_nfilter(vec![4, 8])
            .with_dropout_enables(vec![false, true])
            .init::<TestBackend>(&Default::default())
            .unwrap();
        let sampler = McSampler::new(Regressor::new(predictor), 2);
        Inferencer::new(Subset::full(Arc::new(dataset)), sampler, 1)
    }

    #[test]
    fn predicts_every_sample_in_order() {
        let root = tempfile::tempdir().unwrap();
        let predictions = inferencer(root.path(), 3).run().unwrap();

        assert_eq!(predictions.pred.len(), 3);
        assert_eq!(predictions.uncert.len(), 3);
        assert_eq!(predictions.uncert[0].shape(), [1, 8, 8]);
    }

    #[test]
    fn sample_lost_after_scan_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let inferencer = inferencer(root.path(), 4);
        std::fs::write(root.path().join("train/002_a.mha"), b"garbage").unwrap();

        match inferencer.run() {
            Err(BcnnError::Dataset { message }) => assert!(message.contains("2 of 4"), "{message}"),
            other => panic!("Expected dataset error, got {:?}", other.map(|p| p.pred.len())),
        }
    }

    #[test]
    fn latest_snapshot_has_highest_iteration() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "generator_iter_00000100.mpk",
            "generator_iter_00002000.mpk",
            "generator_iter_00000300.mpk",
            "discriminator_iter_00009000.mpk",
            "generator_iter_latest.mpk",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let latest = find_latest_snapshot("generator_iter_", dir.path()).unwrap();
        assert_eq!(latest.file_name().unwrap(), "generator_iter_00002000.mpk");
    }

    #[test]
    fn snapshot_directories_match_too() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("snapshot_iter_00000005")).unwrap();
        std::fs::create_dir(dir.path().join("snapshot_iter_00000010")).unwrap();

        let latest = find_latest_snapshot("snapshot_iter_", dir.path()).unwrap();
        assert!(latest.ends_with("snapshot_iter_00000010"));
    }

    #[test]
    fn missing_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        match find_latest_snapshot("generator_iter_", dir.path()) {
            Err(BcnnError::SnapshotNotFound { prefix, .. }) => assert_eq!(prefix, "generator_iter_"),
            other => panic!("Expected SnapshotNotFound, got {other:?}"),
        }
    }
}
