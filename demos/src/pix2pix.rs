//! Map synthesis with pix2pix and Monte-Carlo dropout uncertainty.
//!
//! The generator is a Bayesian U-Net trained against a patch discriminator.
//! After training, the latest generator snapshot is sampled repeatedly with
//! dropout active to estimate per-pixel predictive variance.

use std::{
    fs,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use bcnn_burn::{
    adam,
    config::{
        Activation, BayesianUNetConfig, BiasInit, ConvParam, Dropout, GanLoss, Normalization,
        PaddingMode, PatchDiscriminatorConfig, Pooling, WeightInit,
    },
    data::{
        load_image, train_valid_split, AugmentOp, DataAugmentor, ImageArray, ImageDataset,
        NormOp, Normalizer, PairBatcher, PairFiles, PairTemplates, Subset,
    },
    find_latest_snapshot,
    models::{BayesianUNet, McSampler, PatchDiscriminator, Regressor},
    percentile,
    training::{
        resolve_frequency, EarlyStoppingTrigger, IntervalTrigger, LinearShift, LogReport,
        PlotReport, PrintReport, ProgressBar, SnapshotObject, SnapshotTarget, Trainer, Validator,
    },
    utils::{fixed_seed, save_args},
    Colormap, GanUpdater, ImageVisualizer, Inferencer, Predictions,
};
use burn::{
    data::dataloader::{DataLoaderBuilder, Dataset},
    module::Module,
    prelude::Backend,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};
use clap::Parser;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::backend::{create_device, get_backend_name, SelectedBackend, TrainBackend};

/// Keys reported by the log and print reports.
pub const LOG_KEYS: [&str; 4] = ["loss_gen", "loss_cond", "loss_dis", "validation/main/accuracy"];

/// Number of validation samples drawn into each validation figure.
const N_VIS: usize = 20;

/// Command line arguments.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(
    author,
    version,
    about = "Example: Uncertainty estimates with adversarial training in image synthesis",
    long_about = None
)]
pub struct Args {
    /// Directory to dataset
    #[arg(short = 'd', long = "data_root", default_value = "./preprocessed")]
    pub data_root: PathBuf,

    /// Number of images in each mini-batch
    #[arg(short = 'b', long = "batchsize", default_value_t = 5)]
    pub batchsize: usize,

    /// Number of training iterations
    #[arg(short = 'i', long = "iteration", default_value_t = 200_000)]
    pub iteration: usize,

    /// Frequency of taking a snapshot (-1: iteration / 80)
    #[arg(
        short = 'f',
        long = "frequency",
        default_value_t = -1,
        allow_negative_numbers = true
    )]
    pub frequency: i64,

    /// Device name; the backend itself is chosen by cargo features
    #[arg(short = 'g', long = "gpu", default_value = "cuda:0")]
    pub gpu: String,

    /// Directory to output the result
    #[arg(short = 'o', long = "out", default_value = "logs")]
    pub out: PathBuf,

    /// Resume the training from a snapshot directory
    #[arg(short = 'r', long = "resume", default_value = "")]
    pub resume: String,

    /// Enable data augmentation during validation
    #[arg(long = "valid_augment")]
    pub valid_augment: bool,

    /// Ratio of validation data to training data
    #[arg(long = "valid_split_ratio", default_value_t = 0.1)]
    pub valid_split_ratio: f64,

    /// Learning rate
    #[arg(long = "lr", default_value_t = 4e-4)]
    pub lr: f64,

    /// Weight of conditional loss
    #[arg(long = "alpha", default_value_t = 50.0)]
    pub alpha: f64,

    /// Exponential decay rate of the first order moment in Adam
    #[arg(long = "beta", default_value_t = 0.5)]
    pub beta: f32,

    /// Weight of L2 regularization (non-positive disables it)
    #[arg(long = "decay", default_value_t = -1.0, allow_negative_numbers = true)]
    pub decay: f32,

    /// Number of Monte-Carlo samples
    #[arg(long = "mc_iteration", default_value_t = 15)]
    pub mc_iteration: usize,

    /// Countdown for early stopping of training (-1: never)
    #[arg(long = "pinfall", default_value_t = -1, allow_negative_numbers = true)]
    pub pinfall: i64,

    /// Disables updating the up-convolutional weights
    #[arg(long = "freeze_upconv")]
    pub freeze_upconv: bool,

    /// Switch to the testing phase on test dataset
    #[arg(long = "test_on_test")]
    pub test_on_test: bool,

    /// Switch to the testing phase on valid dataset
    #[arg(long = "test_on_valid")]
    pub test_on_valid: bool,

    /// Fix the random seed
    #[arg(long = "seed", default_value_t = 0)]
    pub seed: u64,

    /// Adversarial objective: dcgan or lsgan
    #[arg(long = "gan_loss", default_value = "dcgan")]
    pub gan_loss: String,

    /// Number of data loader workers
    #[arg(long = "num_workers", default_value_t = 1)]
    pub num_workers: usize,
}

impl Args {
    /// Parsed `--gan_loss`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown objective name.
    pub fn gan_loss(&self) -> Result<GanLoss> {
        self.gan_loss.parse().map_err(anyhow::Error::msg)
    }

    /// Early-stopping patience; `None` never stops early.
    pub fn patience(&self) -> Option<usize> {
        if self.pinfall == -1 {
            None
        } else {
            Some(self.pinfall.max(1) as usize)
        }
    }
}

/// Bayesian U-Net generator of the map synthesis setup.
pub fn build_generator() -> BayesianUNetConfig {
    let conv = ConvParam::new()
        .with_kernel_size(3)
        .with_stride(1)
        .with_padding(1)
        .with_padding_mode(PaddingMode::Reflect)
        .with_init(WeightInit::Normal(0.02))
        .with_bias(false);
    let upconv = ConvParam::new()
        .with_kernel_size(4)
        .with_stride(2)
        .with_padding(1)
        .with_padding_mode(PaddingMode::Zeros)
        .with_init(WeightInit::Normal(0.02))
        .with_bias(false);

    BayesianUNetConfig::new()
        .with_in_channels(3)
        .with_out_channels(3)
        .with_nlayer(8)
        .with_nfilter(vec![64, 128, 256, 512, 512, 512, 512, 512])
        .with_ninner(1)
        .with_conv(conv)
        .with_pool(Pooling::Stride(2))
        .with_upconv(upconv)
        .with_norm(Normalization::Batch)
        .with_activation(Activation::LeakyRelu(0.2))
        .with_dropout(Dropout::None)
        .with_dropout_enables(vec![false, false, false, false, true, true, true, false])
        .with_preserve_color(true)
        .with_exp_ninner(0)
        .with_exp_activation(Activation::Relu)
        .with_exp_dropout(Dropout::McDropout(0.5))
}

/// Spectrally normalized patch discriminator on (condition, image) pairs.
pub fn build_discriminator() -> PatchDiscriminatorConfig {
    let conv = ConvParam::new()
        .with_kernel_size(4)
        .with_stride(2)
        .with_padding(1)
        .with_padding_mode(PaddingMode::Zeros)
        .with_init(WeightInit::Normal(0.02))
        .with_bias(true)
        .with_bias_init(BiasInit::Zero)
        .with_spectral_norm(true);

    PatchDiscriminatorConfig::new()
        .with_in_channels(3 * 2)
        .with_out_channels(1)
        .with_nlayer(4)
        .with_nfilter(64)
        .with_ninner(1)
        .with_conv(conv)
        .with_norm(Normalization::None)
        .with_activation(Activation::LeakyRelu(0.2))
        .with_dropout(Dropout::None)
        .with_preserve_color(true)
}

/// Input normalization. The images are stored in `[-1, 1]` already.
pub fn get_normalizer() -> Normalizer {
    Normalizer::new().with(NormOp::subtract(0.0))
}

/// Training augmentation: jitter by resize-and-crop, random flips on both axes.
pub fn get_augmentor() -> DataAugmentor {
    DataAugmentor::new()
        .with(AugmentOp::resize_crop((286, 286), (256, 256)))
        .with(AugmentOp::flip(1))
        .with(AugmentOp::flip(2))
}

/// Datasets used by the driver.
pub struct Splits {
    /// Training view (augmented).
    pub train: Subset,
    /// Validation view; augmented only with `--valid_augment`.
    pub valid: Subset,
    /// Pairs under `{root}/val`, when that directory exists.
    pub test: Option<Subset>,
}

/// Scans `{root}/train` and splits it, and loads `{root}/val` as test set.
///
/// # Errors
///
/// Returns an error if the training pairs cannot be found or split.
pub fn get_dataset(
    data_root: &Path,
    valid_split_ratio: f64,
    valid_augment: bool,
    normalizer: Option<Normalizer>,
    augmentor: Option<DataAugmentor>,
    seed: u64,
) -> Result<Splits> {
    let train_templates =
        PairTemplates::new("{root}/train/{patient}_a.mha", "{root}/train/{patient}_b.mha");
    let dataset = ImageDataset::new(data_root, &["*"], &train_templates, normalizer.clone(), augmentor)
        .with_context(|| format!("Failed to load training pairs from {}", data_root.display()))?
        .with_seed(seed);
    let (train, valid) = train_valid_split(dataset, valid_split_ratio, seed)?;
    let valid = if valid_augment {
        valid
    } else {
        valid.without_augmentor()
    };

    let test = if data_root.join("val").is_dir() {
        let test_templates =
            PairTemplates::new("{root}/val/{patient}_a.mha", "{root}/val/{patient}_b.mha");
        let dataset = ImageDataset::new(data_root, &["*"], &test_templates, normalizer, None)
            .with_context(|| format!("Failed to load test pairs from {}", data_root.display()))?
            .with_seed(seed);
        Some(Subset::full(Arc::new(dataset)))
    } else {
        None
    };

    Ok(Splits { train, valid, test })
}

/// Trains `generator` adversarially and writes logs and snapshots to `--out`.
///
/// # Errors
///
/// Returns an error if a network, a file or the training loop fails.
pub fn train_phase<B: AutodiffBackend>(
    generator: BayesianUNet<B>,
    discriminator_config: &PatchDiscriminatorConfig,
    train: Subset,
    valid: Subset,
    args: &Args,
    device: &B::Device,
) -> Result<()> {
    tracing::info!(train = train.len(), valid = valid.len(), "# samples");

    let train_loader = DataLoaderBuilder::new(PairBatcher::<B>::new())
        .batch_size(args.batchsize)
        .shuffle(args.seed)
        .num_workers(args.num_workers)
        .build(train);

    let model = Regressor::new(generator);
    let discriminator = discriminator_config.init::<B>(device)?;
    discriminator_config.save_args(args.out.join("discriminator.json"))?;

    let optimizers = (
        adam(args.beta, args.decay).init::<B, Regressor<B>>(),
        adam(args.beta, args.decay).init::<B, PatchDiscriminator<B>>(),
    );
    let updater = GanUpdater::new(
        model,
        discriminator,
        optimizers,
        args.gan_loss()?,
        args.alpha,
        args.lr,
    );

    let frequency = resolve_frequency(args.frequency, args.iteration);
    let every = IntervalTrigger::new(frequency);
    let stop_trigger = EarlyStoppingTrigger::new(
        "validation/main/loss",
        args.iteration,
        frequency,
        args.patience(),
    );
    tracing::info!(frequency, patience = ?args.patience(), "triggers");

    let mut trainer = Trainer::new(updater, train_loader, stop_trigger, &args.out);

    let log_keys: Vec<String> = LOG_KEYS.iter().map(ToString::to_string).collect();
    let mut print_keys = vec!["iteration".to_string()];
    print_keys.extend(log_keys.iter().cloned());
    print_keys.push("elapsed_time".to_string());

    trainer
        .extend(LinearShift::new(
            (args.lr, 0.0),
            (args.iteration / 2, args.iteration),
        ))
        .extend(Validator::<B>::new(
            valid,
            args.batchsize,
            every,
            N_VIS,
            args.seed,
        ))
        .extend(SnapshotObject::new(
            SnapshotTarget::Generator,
            "generator_iter_",
            every,
        ))
        .extend(SnapshotObject::new(
            SnapshotTarget::Discriminator,
            "discriminator_iter_",
            every,
        ))
        .extend(LogReport::new(
            Some(log_keys.clone()),
            IntervalTrigger::new(100),
        ))
        .snapshot_on(every);
    for plot_key in ["loss", "accuracy"] {
        trainer.extend(PlotReport::new(
            PlotReport::select_keys(&log_keys, plot_key),
            format!("{plot_key}.png"),
            every,
        ));
    }
    trainer
        .extend(PrintReport::new(print_keys))
        .extend(ProgressBar::new(100));

    if !args.resume.is_empty() {
        trainer
            .resume(Path::new(&args.resume), device)
            .with_context(|| format!("Failed to resume from {}", args.resume))?;
    }

    trainer.run()?;
    Ok(())
}

/// Per-sample test results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleSummary {
    /// Position in the test set.
    pub index: usize,
    /// Input image path relative to the common directory of all inputs.
    pub image: String,
    /// Mean absolute error in `[0, 1]` intensity units.
    pub mae: f64,
    /// Mean predictive variance.
    pub pv: f64,
}

/// Contents of `test/summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSummary {
    /// Results per sample.
    pub samples: Vec<SampleSummary>,
    /// Mean of the per-sample MAE.
    pub mae: f64,
    /// Mean of the per-sample PV.
    pub pv: f64,
}

/// Samples the latest generator snapshot on `test` and writes figures and a
/// summary to `<out>/test`.
///
/// # Errors
///
/// Returns an error if no snapshot exists or a file cannot be read or written.
pub fn test_phase<B: Backend>(
    generator: BayesianUNet<B>,
    test: Subset,
    args: &Args,
    device: &B::Device,
) -> Result<TestSummary> {
    tracing::info!(test = test.len(), "# samples");

    let snapshot = find_latest_snapshot("generator_iter_", &args.out)?;
    let generator = generator
        .load_file(snapshot.clone(), &CompactRecorder::new(), device)
        .with_context(|| format!("Failed to load snapshot {}", snapshot.display()))?;
    tracing::info!(snapshot = %snapshot.display(), "Loaded a snapshot");

    let sampler = McSampler::new(Regressor::new(generator), args.mc_iteration);
    let files = test.files();
    let predictions = Inferencer::new(test, sampler, args.batchsize).run()?;

    evaluate(&predictions, &files, &args.out.join("test"))
}

/// Writes one five-panel figure per sample (input, prediction, ground truth,
/// variance, error) and `summary.json` into `dir`.
///
/// # Errors
///
/// Returns an error if an image cannot be loaded, shapes disagree or a file
/// cannot be written.
pub fn evaluate(predictions: &Predictions, files: &PairFiles, dir: &Path) -> Result<TestSummary> {
    fs::create_dir_all(dir)?;

    let all_uncert: Vec<f32> = predictions
        .uncert
        .iter()
        .flat_map(|u| u.data().iter().copied())
        .collect();
    let uncert_clim = (0.0, percentile(&all_uncert, 95.0));
    let unit = Some((0.0, 1.0));
    let visualizer = ImageVisualizer::new()
        .with("image", unit, Colormap::Gray)
        .with("pred", unit, Colormap::Gray)
        .with("label", unit, Colormap::Gray)
        .with("uncert", Some(uncert_clim), Colormap::Jet)
        .with("error", unit, Colormap::Jet);

    let common = common_path(&files.image);
    let to_unit = |v: f32| (v + 1.0) / 2.0;
    let mut samples = Vec::with_capacity(predictions.pred.len());

    let pairs = files.image.iter().zip(&files.label);
    for (index, ((pred, uncert), (image_file, label_file))) in predictions
        .pred
        .iter()
        .zip(&predictions.uncert)
        .zip(pairs)
        .enumerate()
    {
        let (image, _) = load_image(image_file)
            .with_context(|| format!("Failed to load {}", image_file.display()))?;
        let (label, _) = load_image(label_file)
            .with_context(|| format!("Failed to load {}", label_file.display()))?;
        let image = image.map(to_unit);
        let label = label.map(to_unit);
        let pred = pred.clone().map(to_unit);

        if pred.shape() != label.shape() {
            bail!(
                "Prediction shape {:?} does not match label shape {:?} of {}",
                pred.shape(),
                label.shape(),
                label_file.display()
            );
        }
        let diff = ImageArray::new(
            pred.channels(),
            pred.height(),
            pred.width(),
            pred.data()
                .iter()
                .zip(label.data())
                .map(|(p, l)| (p - l).abs())
                .collect(),
        )?;
        let mae = f64::from(diff.mean());
        let pv = f64::from(uncert.mean());

        visualizer.save(
            &[vec![image, pred, label, uncert.clone(), diff.channel_mean()]],
            dir.join(format!("{index:03}.png")),
        )?;

        let relative = image_file
            .strip_prefix(&common)
            .ok()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| ".".to_string(), |p| p.display().to_string());
        tracing::info!(index, image = %relative, mae, pv, "test sample");
        samples.push(SampleSummary {
            index,
            image: relative,
            mae,
            pv,
        });
    }

    let count = samples.len().max(1) as f64;
    let summary = TestSummary {
        mae: samples.iter().map(|s| s.mae).sum::<f64>() / count,
        pv: samples.iter().map(|s| s.pv).sum::<f64>() / count,
        samples,
    };
    fs::write(dir.join("summary.json"), serde_json::to_string_pretty(&summary)?)?;
    tracing::info!(
        samples = summary.samples.len(),
        mae = summary.mae,
        pv = summary.pv,
        "test finished"
    );
    Ok(summary)
}

/// Longest common leading directory of `paths` (the path itself for one entry).
pub fn common_path(paths: &[PathBuf]) -> PathBuf {
    let mut iter = paths.iter();
    let Some(first) = iter.next() else {
        return PathBuf::new();
    };
    let mut common: Vec<Component> = first.components().collect();
    for path in iter {
        let shared = common
            .iter()
            .zip(path.components())
            .take_while(|(a, b)| **a == *b)
            .count();
        common.truncate(shared);
    }
    common.iter().collect()
}

/// Runs the driver with the map synthesis networks and augmentation.
///
/// # Errors
///
/// See [`run_with`].
pub fn run(args: &Args) -> Result<()> {
    run_with(args, &build_generator(), &build_discriminator(), get_augmentor())
}

/// Runs the test phase or the training phase selected by `args`.
///
/// # Errors
///
/// Returns an error on `--test_on_test`, unusable data, or a failing phase.
pub fn run_with(
    args: &Args,
    generator_config: &BayesianUNetConfig,
    discriminator_config: &PatchDiscriminatorConfig,
    augmentor: DataAugmentor,
) -> Result<()> {
    tracing::info!(
        gpu = %args.gpu,
        backend = get_backend_name(),
        batchsize = args.batchsize,
        "setup"
    );
    fs::create_dir_all(&args.out)
        .with_context(|| format!("Failed to create {}", args.out.display()))?;

    let device = create_device();
    let mut rng = fixed_seed::<TrainBackend>(args.seed);
    let data_seed: u64 = rng.random();

    let normalizer = get_normalizer();
    let splits = get_dataset(
        &args.data_root,
        args.valid_split_ratio,
        args.valid_augment,
        Some(normalizer.clone()),
        Some(augmentor.clone()),
        data_seed,
    )?;

    if args.test_on_test {
        bail!("This example is under construction. Please tune the hyperparameters first..");
    }

    if args.test_on_valid {
        let generator = generator_config.init::<SelectedBackend>(&device)?;
        test_phase(generator, splits.valid, args, &device)?;
    } else {
        save_args(args, &args.out)?;
        generator_config.save_args(args.out.join("model.json"))?;
        normalizer.summary(args.out.join("norm.json"))?;
        augmentor.summary(args.out.join("augment.json"))?;

        let mut generator = generator_config.init::<TrainBackend>(&device)?;
        if args.freeze_upconv {
            generator = generator.freeze_layers("upconv")?;
        }
        train_phase(
            generator,
            discriminator_config,
            splits.train,
            splits.valid,
            args,
            &device,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["train_and_test_pix2pix"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn defaults_match_the_map_synthesis_setup() {
        let args = parse(&[]);

        assert_eq!(args.data_root, PathBuf::from("./preprocessed"));
        assert_eq!(args.batchsize, 5);
        assert_eq!(args.iteration, 200_000);
        assert_eq!(args.frequency, -1);
        assert_eq!(args.mc_iteration, 15);
        assert_eq!(args.patience(), None);
        assert!(matches!(args.gan_loss().unwrap(), GanLoss::Dcgan));
        assert_eq!(resolve_frequency(args.frequency, args.iteration), 2500);
    }

    #[test]
    fn snake_case_flags_and_negative_values() {
        let args = parse(&[
            "--valid_split_ratio",
            "0.2",
            "--pinfall",
            "0",
            "--decay",
            "-1",
            "--gan_loss",
            "lsgan",
            "-f",
            "-1",
        ]);

        assert_eq!(args.valid_split_ratio, 0.2);
        assert_eq!(args.patience(), Some(1));
        assert_eq!(args.decay, -1.0);
        assert!(matches!(args.gan_loss().unwrap(), GanLoss::Lsgan));
    }

    #[test]
    fn networks_are_valid() {
        assert!(build_generator().validate().is_ok());
        assert!(build_discriminator().validate().is_ok());
        assert_eq!(get_augmentor().ops().len(), 3);
    }

    #[test]
    fn common_path_of_files() {
        let files = vec![
            PathBuf::from("/data/val/1_a.mha"),
            PathBuf::from("/data/val/2_a.mha"),
        ];
        assert_eq!(common_path(&files), PathBuf::from("/data/val"));
        assert_eq!(common_path(&files[..1]), PathBuf::from("/data/val/1_a.mha"));
        assert_eq!(common_path(&[]), PathBuf::new());
    }
}
