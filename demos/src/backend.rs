//! Compile-time backend choice for the map synthesis driver.
//!
//! `cuda` wins over `wgpu`; without either feature the driver runs on the
//! `ndarray` CPU backend. The `--gpu` flag only shows up in the log.

use burn::backend::Autodiff;
use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "cuda")] {
        pub type SelectedBackend = burn::backend::Cuda;
        const BACKEND_NAME: &str = "cuda";
    } else if #[cfg(feature = "wgpu")] {
        pub type SelectedBackend = burn::backend::Wgpu;
        const BACKEND_NAME: &str = "wgpu";
    } else {
        pub type SelectedBackend = burn::backend::NdArray;
        const BACKEND_NAME: &str = "ndarray";
    }
}

/// Device of [`SelectedBackend`].
pub type SelectedDevice = <SelectedBackend as burn::prelude::Backend>::Device;

/// Networks are trained on this; validation and testing use [`SelectedBackend`].
pub type TrainBackend = Autodiff<SelectedBackend>;

/// The default device of the selected backend.
pub fn create_device() -> SelectedDevice {
    Default::default()
}

/// Short backend name for the log.
pub const fn get_backend_name() -> &'static str {
    BACKEND_NAME
}
