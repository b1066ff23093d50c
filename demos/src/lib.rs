//! Demos for `bcnn-burn`.
//!
//! ## Available Demos
//!
//! - `train_and_test_pix2pix`: trains a Bayesian U-Net with a patch
//!   discriminator on paired map images, then evaluates predictive
//!   uncertainty with Monte-Carlo dropout
//!
//! ## Usage
//!
//! ```bash
//! # Train
//! cargo run --release --bin train_and_test_pix2pix -- -d ./preprocessed -o logs
//!
//! # Evaluate the latest generator snapshot on the validation split
//! cargo run --release --bin train_and_test_pix2pix -- -d ./preprocessed -o logs --test_on_valid
//!
//! # Train on the GPU
//! cargo run --release --bin train_and_test_pix2pix --features wgpu --no-default-features
//! ```

pub mod backend;
pub mod pix2pix;

pub use backend::{create_device, get_backend_name, SelectedBackend, SelectedDevice, TrainBackend};
pub use pix2pix::Args;
