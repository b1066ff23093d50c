//! Input normalization.
//!
//! A `Normalizer` is an ordered list of per-channel intensity operations that
//! is applied to the input image of every sample (never to the label).

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use super::image::ImageArray;
use crate::error::{BcnnError, BcnnResult};

/// A single normalization step.
///
/// `Subtract2D` and `Divide2D` take either one value for all channels or one
/// value per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum NormOp {
    /// Clamps values to `[min, max]`.
    Clip2D { min: f32, max: f32 },
    /// Subtracts a constant.
    Subtract2D { values: Vec<f32> },
    /// Divides by a constant.
    Divide2D { values: Vec<f32> },
}

impl NormOp {
    /// Clip to `[min, max]`.
    pub const fn clip(min: f32, max: f32) -> Self {
        Self::Clip2D { min, max }
    }

    /// Subtract a scalar from every channel.
    pub fn subtract(value: f32) -> Self {
        Self::Subtract2D {
            values: vec![value],
        }
    }

    /// Divide every channel by a scalar.
    pub fn divide(value: f32) -> Self {
        Self::Divide2D {
            values: vec![value],
        }
    }

    fn validate(&self) -> BcnnResult<()> {
        match self {
            Self::Clip2D { min, max } if !(min <= max) => Err(BcnnError::InvalidConfiguration {
                reason: format!("Clip2D needs min <= max, got [{min}, {max}]"),
            }),
            Self::Subtract2D { values } | Self::Divide2D { values } if values.is_empty() => {
                Err(BcnnError::InvalidConfiguration {
                    reason: format!("{self:?} needs at least one value"),
                })
            }
            _ => Ok(()),
        }
    }

    fn apply(&self, mut array: ImageArray) -> ImageArray {
        let per_channel = |values: &[f32], c: usize| -> f32 {
            if values.len() == 1 {
                values[0]
            } else {
                values.get(c).copied().unwrap_or(0.0)
            }
        };
        match self {
            Self::Clip2D { min, max } => array.map(|v| v.max(*min).min(*max)),
            Self::Subtract2D { values } => {
                for c in 0..array.channels() {
                    let value = per_channel(values, c);
                    array.plane_mut(c).iter_mut().for_each(|v| *v -= value);
                }
                array
            }
            Self::Divide2D { values } => {
                for c in 0..array.channels() {
                    let value = per_channel(values, c);
                    let value = if value == 0.0 { 1.0 } else { value };
                    array.plane_mut(c).iter_mut().for_each(|v| *v /= value);
                }
                array
            }
        }
    }
}

/// Ordered chain of normalization steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    ops: Vec<NormOp>,
}

impl Normalizer {
    /// An empty normalizer (identity).
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step.
    pub fn add(&mut self, op: NormOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Builder-style `add`.
    #[must_use]
    pub fn with(mut self, op: NormOp) -> Self {
        self.ops.push(op);
        self
    }

    /// The configured steps.
    pub fn ops(&self) -> &[NormOp] {
        &self.ops
    }

    /// Checks every step.
    ///
    /// # Errors
    ///
    /// Returns `BcnnError::InvalidConfiguration` for a clip range with
    /// `min > max` or an empty value list.
    pub fn validate(&self) -> BcnnResult<()> {
        self.ops.iter().try_for_each(NormOp::validate)
    }

    /// Runs every step in order.
    pub fn apply(&self, array: ImageArray) -> ImageArray {
        self.ops.iter().fold(array, |acc, op| op.apply(acc))
    }

    /// Writes the steps as a JSON list.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn summary(&self, path: impl AsRef<Path>) -> BcnnResult<()> {
        fs::write(path, serde_json::to_string_pretty(&self.ops)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ImageArray {
        ImageArray::new(2, 1, 3, vec![-2.0, 0.0, 4.0, 1.0, 2.0, 3.0]).unwrap()
    }

    #[test]
    fn ops_apply_in_order() {
        let normalizer = Normalizer::new()
            .with(NormOp::clip(-1.0, 3.0))
            .with(NormOp::subtract(1.0))
            .with(NormOp::divide(2.0));

        let out = normalizer.apply(sample());

        assert_eq!(out.data(), &[-1.0, -0.5, 1.0, 0.0, 0.5, 1.0]);
    }

    #[test]
    fn per_channel_values() {
        let mut normalizer = Normalizer::new();
        normalizer.add(NormOp::Subtract2D {
            values: vec![1.0, 2.0],
        });

        let out = normalizer.apply(sample());

        assert_eq!(out.data(), &[-3.0, -1.0, 3.0, -1.0, 0.0, 1.0]);
    }

    #[test]
    fn subtract_zero_is_identity() {
        let normalizer = Normalizer::new().with(NormOp::subtract(0.0));
        assert_eq!(normalizer.apply(sample()), sample());
    }

    #[test]
    fn inverted_clip_range_is_rejected() {
        let normalizer = Normalizer::new().with(NormOp::clip(1.0, -1.0));

        match normalizer.validate() {
            Err(BcnnError::InvalidConfiguration { reason }) => assert!(reason.contains("Clip2D")),
            other => panic!("Expected InvalidConfiguration error, got {other:?}"),
        }
        assert!(Normalizer::new().with(NormOp::clip(-1.0, 1.0)).validate().is_ok());
    }

    #[test]
    fn summary_names_each_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("norm.json");
        Normalizer::new()
            .with(NormOp::subtract(0.0))
            .summary(&path)
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json[0]["name"], "Subtract2D");
        assert_eq!(json[0]["values"][0], 0.0);
    }
}
