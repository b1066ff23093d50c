use std::sync::Arc;

use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::AutodiffModule,
    optim::Optimizer,
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};

use super::{
    trainer::{Extension, TrainState},
    trigger::IntervalTrigger,
};
use crate::{
    data::{ImageArray, PairBatch, PairBatcher, Subset},
    error::BcnnResult,
    models::{PatchDiscriminator, Regressor},
    visualizer::{Colormap, ImageVisualizer},
};

/// Evaluates the generator on the validation set and saves example figures.
///
/// Reports `validation/main/loss` and `validation/main/accuracy` into the
/// current observation and writes `validation/iter_{iteration:08}.png` with
/// the columns input, prediction and target.
pub struct Validator<B: AutodiffBackend> {
    loader: Arc<dyn DataLoader<B::InnerBackend, PairBatch<B::InnerBackend>>>,
    trigger: IntervalTrigger,
    n_vis: usize,
    visualizer: ImageVisualizer,
}

impl<B: AutodiffBackend> Validator<B> {
    /// Validates on `dataset` whenever `trigger` fires. Batches are shuffled
    /// with `seed` so the figures show varying samples.
    pub fn new(
        dataset: Subset,
        batch_size: usize,
        trigger: IntervalTrigger,
        n_vis: usize,
        seed: u64,
    ) -> Self {
        let loader = DataLoaderBuilder::new(PairBatcher::<B::InnerBackend>::new())
            .batch_size(batch_size.max(1))
            .shuffle(seed)
            .build(dataset);
        let clim = Some((-1.0, 1.0));
        let visualizer = ImageVisualizer::new()
            .with("x", clim, Colormap::Gray)
            .with("y", clim, Colormap::Gray)
            .with("t", clim, Colormap::Gray);
        Self {
            loader,
            trigger,
            n_vis,
            visualizer,
        }
    }

    /// Mean loss and accuracy over all batches (`None` without batches) plus up
    /// to `n_vis` figure rows.
    fn evaluate(
        &self,
        generator: &Regressor<B::InnerBackend>,
    ) -> BcnnResult<(Option<(f64, f64)>, Vec<Vec<ImageArray>>)> {
        let (mut loss_sum, mut accuracy_sum, mut batches) = (0.0, 0.0, 0usize);
        let mut rows = Vec::new();

        for batch in self.loader.iter() {
            let PairBatch { x, t } = batch;
            let n = x.dims()[0];
            let y = generator.forward(x.clone());
            loss_sum += generator
                .loss(y.clone(), t.clone())
                .into_scalar()
                .elem::<f64>();
            accuracy_sum += generator
                .accuracy(y.clone(), t.clone())
                .into_scalar()
                .elem::<f64>();
            batches += 1;

            for i in 0..n.min(self.n_vis.saturating_sub(rows.len())) {
                let row = [&x, &y, &t]
                    .into_iter()
                    .map(|tensor| {
                        ImageArray::from_tensor(tensor.clone().slice([i..i + 1]).squeeze::<3>(0))
                    })
                    .collect::<BcnnResult<Vec<_>>>()?;
                rows.push(row);
            }
        }

        let means = (batches > 0).then(|| {
            let batches = batches as f64;
            (loss_sum / batches, accuracy_sum / batches)
        });
        Ok((means, rows))
    }
}

impl<B, OG, OD> Extension<B, OG, OD> for Validator<B>
where
    B: AutodiffBackend,
    OG: Optimizer<Regressor<B>, B>,
    OD: Optimizer<PatchDiscriminator<B>, B>,
{
    fn name(&self) -> &str {
        "validation"
    }

    fn trigger(&self) -> IntervalTrigger {
        self.trigger
    }

    fn run(&mut self, state: &mut TrainState<B, OG, OD>) -> BcnnResult<()> {
        let generator = state.updater.generator().valid();
        let (means, rows) = self.evaluate(&generator)?;
        let Some((loss, accuracy)) = means else {
            tracing::warn!(iteration = state.iteration, "validation loader produced no batches");
            return Ok(());
        };

        state
            .observation
            .insert("validation/main/loss".to_string(), loss);
        state
            .observation
            .insert("validation/main/accuracy".to_string(), accuracy);

        if !rows.is_empty() {
            let path = state
                .out
                .join("validation")
                .join(format!("iter_{:08}.png", state.iteration));
            self.visualizer.save(&rows, &path)?;
        }

        tracing::info!(
            iteration = state.iteration,
            loss,
            accuracy,
            "validation done"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BayesianUNetConfig,
        data::{save_image, ImageDataset, PairTemplates},
    };
    use burn::backend::{Autodiff, NdArray};

    type TrainBackend = Autodiff<NdArray<f32>>;
    type TestBackend = NdArray<f32>;

    fn subset(root: &std::path::Path, indices: Vec<usize>) -> Subset {
        let train = root.join("train");
        std::fs::create_dir_all(&train).unwrap();
        for i in 0..3 {
            let array = ImageArray::new(3, 8, 8, vec![0.1 * i as f32; 192]).unwrap();
            for half in ["a", "b"] {
                save_image(
                    train.join(format!("{i:03}_{half}.mha")),
                    &array,
                    &crate::data::ImageMeta::default(),
                )
                .unwrap();
            }
        }
        let templates =
            PairTemplates::new("{root}/train/{patient}_a.mha", "{root}/train/{patient}_b.mha");
        let dataset = ImageDataset::new(root, &["*"], &templates, None, None).unwrap();
        Subset::new(std::sync::Arc::new(dataset), indices)
    }

    fn generator() -> Regressor<TestBackend> {
        let predictor = BayesianUNetConfig::new()
            .with_nlayer(2)
            .with_nfilter(vec![4, 8])
            .with_dropout_enables(vec![false, false])
            .init::<TestBackend>(&Default::default())
            .unwrap();
        Regressor::new(predictor)
    }

    #[test]
    fn empty_validation_set_reports_nothing() {
        let root = tempfile::tempdir().unwrap();
        let validator =
            Validator::<TrainBackend>::new(subset(root.path(), vec![]), 2, IntervalTrigger::new(1), 2, 0);

        let (means, rows) = validator.evaluate(&generator()).unwrap();

        assert!(means.is_none());
        assert!(rows.is_empty());
    }

    #[test]
    fn validation_means_and_rows() {
        let root = tempfile::tempdir().unwrap();
        let validator = Validator::<TrainBackend>::new(
            subset(root.path(), vec![0, 1, 2]),
            2,
            IntervalTrigger::new(1),
            2,
            0,
        );

        let (means, rows) = validator.evaluate(&generator()).unwrap();
        let (loss, accuracy) = means.unwrap();

        assert!(loss >= 0.0);
        assert!(accuracy.is_finite());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 3);
    }
}
