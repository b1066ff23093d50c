//! End-to-end run of the driver on a tiny synthetic dataset.

use std::path::Path;

use bcnn_burn::{
    config::{BayesianUNetConfig, PatchDiscriminatorConfig},
    data::{save_image, AugmentOp, DataAugmentor, ImageArray, ImageMeta},
};
use bcnn_demos::pix2pix::{run_with, Args, TestSummary};
use clap::Parser;

const SIZE: usize = 16;

fn write_dataset(root: &Path, n: usize) {
    let dir = root.join("train");
    std::fs::create_dir_all(&dir).unwrap();
    for id in 0..n {
        let data: Vec<f32> = (0..3 * SIZE * SIZE)
            .map(|i| ((i + id * 7) % 17) as f32 / 8.0 - 1.0)
            .collect();
        let image = ImageArray::new(3, SIZE, SIZE, data).unwrap();
        let label = image.clone().map(|v| -v);
        save_image(dir.join(format!("{id:03}_a.mha")), &image, &ImageMeta::default()).unwrap();
        save_image(dir.join(format!("{id:03}_b.mha")), &label, &ImageMeta::default()).unwrap();
    }
}

fn tiny_generator() -> BayesianUNetConfig {
    BayesianUNetConfig::new()
        .with_nlayer(2)
        .with_nfilter(vec![4, 8])
        .with_dropout_enables(vec![false, true])
}

fn tiny_discriminator() -> PatchDiscriminatorConfig {
    PatchDiscriminatorConfig::new()
        .with_nlayer(2)
        .with_nfilter(4)
        .with_ninner(1)
}

fn flips() -> DataAugmentor {
    DataAugmentor::new()
        .with(AugmentOp::flip(1))
        .with(AugmentOp::flip(2))
}

fn args(root: &Path, out: &Path, extra: &[&str]) -> Args {
    let root = root.to_string_lossy().to_string();
    let out = out.to_string_lossy().to_string();
    let mut argv = vec![
        "train_and_test_pix2pix",
        "-d",
        &root,
        "-o",
        &out,
        "-b",
        "2",
        "-f",
        "2",
        "--valid_split_ratio",
        "0.25",
        "--mc_iteration",
        "2",
    ];
    argv.extend_from_slice(extra);
    Args::parse_from(argv)
}

#[test]
fn train_resume_and_test_on_valid() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_dataset(data.path(), 8);

    let train = args(data.path(), out.path(), &["-i", "4"]);
    run_with(&train, &tiny_generator(), &tiny_discriminator(), flips()).unwrap();

    for name in [
        "args",
        "model.json",
        "discriminator.json",
        "norm.json",
        "augment.json",
        "generator_iter_00000004.mpk",
        "discriminator_iter_00000004.mpk",
        "snapshot_iter_00000004/trainer_state.json",
        "validation/iter_00000002.png",
    ] {
        assert!(out.path().join(name).exists(), "missing {name}");
    }

    let snapshot = out.path().join("snapshot_iter_00000004");
    let snapshot = snapshot.to_string_lossy().to_string();
    let resume = args(data.path(), out.path(), &["-i", "6", "-r", &snapshot]);
    run_with(&resume, &tiny_generator(), &tiny_discriminator(), flips()).unwrap();
    assert!(out.path().join("generator_iter_00000006.mpk").exists());
    let state = std::fs::read_to_string(out.path().join("snapshot_iter_00000006/trainer_state.json")).unwrap();
    let state: serde_json::Value = serde_json::from_str(&state).unwrap();
    assert_eq!(state["iteration"], 6);

    let test = args(data.path(), out.path(), &["--test_on_valid"]);
    run_with(&test, &tiny_generator(), &tiny_discriminator(), flips()).unwrap();

    let text = std::fs::read_to_string(out.path().join("test/summary.json")).unwrap();
    let summary: TestSummary = serde_json::from_str(&text).unwrap();
    assert_eq!(summary.samples.len(), 2);
    assert!(summary.mae.is_finite() && summary.mae >= 0.0);
    assert!(summary.pv >= 0.0);
    assert!(out.path().join("test/000.png").is_file());
    assert!(out.path().join("test/001.png").is_file());
}

#[test]
fn test_on_test_is_guarded() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_dataset(data.path(), 4);

    let guarded = args(data.path(), out.path(), &["--test_on_test"]);
    let err = run_with(&guarded, &tiny_generator(), &tiny_discriminator(), flips()).unwrap_err();
    assert!(err.to_string().contains("under construction"));
}
