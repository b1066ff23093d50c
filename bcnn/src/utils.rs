//! Small run helpers shared by the training and test phases.

use std::{fs, path::Path};

use burn::prelude::Backend;
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;

use crate::error::BcnnResult;

/// Seeds the backend and returns a host RNG seeded the same way.
pub fn fixed_seed<B: Backend>(seed: u64) -> StdRng {
    B::seed(seed);
    StdRng::seed_from_u64(seed)
}

/// Writes `args` as pretty JSON to `<out>/args`, creating `out` if needed.
///
/// # Errors
///
/// Returns an error if serialization or writing fails.
pub fn save_args<T: Serialize>(args: &T, out: impl AsRef<Path>) -> BcnnResult<()> {
    let out = out.as_ref();
    fs::create_dir_all(out)?;
    fs::write(out.join("args"), serde_json::to_string_pretty(args)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use rand::Rng;

    #[test]
    fn same_seed_same_stream() {
        let a: u64 = fixed_seed::<NdArray<f32>>(7).random();
        let b: u64 = fixed_seed::<NdArray<f32>>(7).random();
        assert_eq!(a, b);
    }

    #[test]
    fn args_are_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("run");

        save_args(&serde_json::json!({ "batchsize": 1, "gpu": -1 }), &out).unwrap();

        let text = fs::read_to_string(out.join("args")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["batchsize"], 1);
    }
}
