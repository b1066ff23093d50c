//! Map synthesis example: pix2pix training and Monte-Carlo uncertainty test.
//!
//! ## Usage
//!
//! ```bash
//! # Train with the default setup
//! cargo run --release --bin train_and_test_pix2pix -- -d ./preprocessed -o logs
//!
//! # Evaluate the latest generator snapshot on the validation split
//! cargo run --release --bin train_and_test_pix2pix -- -o logs --test_on_valid
//! ```
//!
//! Log verbosity follows `RUST_LOG` and defaults to `info`.

use anyhow::Result;
use bcnn_demos::{pix2pix, Args};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let args = Args::parse();
    pix2pix::run(&args)
}
