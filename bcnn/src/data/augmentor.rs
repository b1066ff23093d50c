//! Joint data augmentation for image/label pairs.
//!
//! Every operation draws its random parameters once per call and applies the
//! same geometric transform to the input image and the label, so pairs stay
//! aligned.

use std::{fs, path::Path};

use image::{
    imageops::{self, FilterType},
    ImageBuffer, Luma,
};
use imageproc::geometric_transformations::{warp, Interpolation, Projection};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::image::{plane_to_buffer, ImageArray};
use crate::error::BcnnResult;

/// A single augmentation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum AugmentOp {
    /// Bilinear resize to `resize_size` followed by a random crop of `crop_size`.
    /// Sizes are `(height, width)`.
    ResizeCrop2D {
        resize_size: (usize, usize),
        crop_size: (usize, usize),
    },
    /// Random flip along `axis` with probability 0.5. Axes follow the CHW layout:
    /// 1 flips rows (vertical), 2 flips columns (horizontal).
    Flip2D { axis: usize },
    /// Random rotation (degrees), translation (fraction of the size) and zoom.
    Affine2D {
        rotation: f32,
        translate: (f32, f32),
        zoom: (f32, f32),
    },
}

impl AugmentOp {
    /// Resize then crop.
    pub const fn resize_crop(resize_size: (usize, usize), crop_size: (usize, usize)) -> Self {
        Self::ResizeCrop2D {
            resize_size,
            crop_size,
        }
    }

    /// Flip along a CHW axis.
    pub const fn flip(axis: usize) -> Self {
        Self::Flip2D { axis }
    }

    fn apply<R: Rng>(
        &self,
        image: ImageArray,
        label: ImageArray,
        rng: &mut R,
    ) -> (ImageArray, ImageArray) {
        match self {
            Self::ResizeCrop2D {
                resize_size,
                crop_size,
            } => {
                let (rh, rw) = *resize_size;
                let (ch, cw) = (crop_size.0.min(rh), crop_size.1.min(rw));
                let top = rng.random_range(0..=rh - ch);
                let left = rng.random_range(0..=rw - cw);
                let resize_crop = |array: ImageArray| {
                    crop(&resize(&array, rh, rw), top, left, ch, cw)
                };
                (resize_crop(image), resize_crop(label))
            }
            Self::Flip2D { axis } => {
                if rng.random_bool(0.5) {
                    (flip(&image, *axis), flip(&label, *axis))
                } else {
                    (image, label)
                }
            }
            Self::Affine2D {
                rotation,
                translate,
                zoom,
            } => {
                let angle = if *rotation > 0.0 {
                    rng.random_range(-*rotation..=*rotation)
                } else {
                    0.0
                };
                let ty = if translate.0 > 0.0 {
                    rng.random_range(-translate.0..=translate.0)
                } else {
                    0.0
                };
                let tx = if translate.1 > 0.0 {
                    rng.random_range(-translate.1..=translate.1)
                } else {
                    0.0
                };
                let scale = if zoom.1 > zoom.0 {
                    rng.random_range(zoom.0..=zoom.1)
                } else {
                    zoom.0
                };
                let scale = if scale > 0.0 { scale } else { 1.0 };
                let projection = affine_projection(
                    (image.height(), image.width()),
                    angle.to_radians(),
                    (ty, tx),
                    scale,
                );
                (
                    warp_array(&image, &projection, Interpolation::Bilinear),
                    warp_array(&label, &projection, Interpolation::Nearest),
                )
            }
        }
    }
}

/// Ordered chain of augmentation steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataAugmentor {
    ops: Vec<AugmentOp>,
}

impl DataAugmentor {
    /// An empty augmentor (identity).
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step.
    pub fn add(&mut self, op: AugmentOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Builder-style `add`.
    #[must_use]
    pub fn with(mut self, op: AugmentOp) -> Self {
        self.ops.push(op);
        self
    }

    /// The configured steps.
    pub fn ops(&self) -> &[AugmentOp] {
        &self.ops
    }

    /// Applies every step in order to the pair.
    pub fn apply<R: Rng>(
        &self,
        image: ImageArray,
        label: ImageArray,
        rng: &mut R,
    ) -> (ImageArray, ImageArray) {
        self.ops
            .iter()
            .fold((image, label), |(image, label), op| op.apply(image, label, rng))
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

/// Bilinear resize of every channel.
pub fn resize(array: &ImageArray, height: usize, width: usize) -> ImageArray {
    if array.height() == height && array.width() == width {
        return array.clone();
    }
    let mut data = Vec::with_capacity(array.channels() * height * width);
    for c in 0..array.channels() {
        let plane = plane_to_buffer(array, c);
        let resized = imageops::resize(&plane, width as u32, height as u32, FilterType::Triangle);
        data.extend_from_slice(resized.as_raw());
    }
    ImageArray::new(array.channels(), height, width, data)
        .unwrap_or_else(|_| ImageArray::zeros(array.channels(), height, width))
}

/// Crops a `height x width` window whose top-left corner is `(top, left)`.
pub fn crop(array: &ImageArray, top: usize, left: usize, height: usize, width: usize) -> ImageArray {
    let mut out = ImageArray::zeros(array.channels(), height, width);
    for c in 0..array.channels() {
        let src = array.plane(c);
        let dst = out.plane_mut(c);
        for row in 0..height {
            let from = (top + row) * array.width() + left;
            dst[row * width..(row + 1) * width].copy_from_slice(&src[from..from + width]);
        }
    }
    out
}

/// Reverses the order of rows (`axis == 1`) or columns (`axis == 2`).
/// Other axes leave the array unchanged.
pub fn flip(array: &ImageArray, axis: usize) -> ImageArray {
    let (h, w) = (array.height(), array.width());
    let mut out = array.clone();
    for c in 0..array.channels() {
        let src = array.plane(c);
        let dst = out.plane_mut(c);
        for row in 0..h {
            for col in 0..w {
                let (r, k) = match axis {
                    1 => (h - 1 - row, col),
                    2 => (row, w - 1 - col),
                    _ => (row, col),
                };
                dst[row * w + col] = src[r * w + k];
            }
        }
    }
    out
}

/// Rotation (radians) and zoom about the image centre followed by a shift given
/// as a fraction of `(height, width)`.
fn affine_projection(
    (height, width): (usize, usize),
    angle: f32,
    (ty, tx): (f32, f32),
    scale: f32,
) -> Projection {
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    Projection::translate(cx + tx * width as f32, cy + ty * height as f32)
        * Projection::rotate(angle)
        * Projection::scale(scale, scale)
        * Projection::translate(-cx, -cy)
}

/// Warps every channel with `projection`.
///
/// Each plane is mapped linearly onto the `u16` range of its own minimum and
/// maximum, so two-valued planes come back exactly under nearest sampling.
/// Pixels mapped from outside the source take the plane minimum.
fn warp_array(array: &ImageArray, projection: &Projection, interpolation: Interpolation) -> ImageArray {
    let (h, w) = (array.height(), array.width());
    let mut out = ImageArray::zeros(array.channels(), h, w);
    for c in 0..array.channels() {
        let src = array.plane(c);
        if src.is_empty() {
            continue;
        }
        let (lo, hi) = src
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let step = if hi > lo { (hi - lo) / f32::from(u16::MAX) } else { 1.0 };

        let quantized: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_fn(w as u32, h as u32, |x, y| {
                Luma([((src[y as usize * w + x as usize] - lo) / step).round() as u16])
            });
        let warped = warp(&quantized, projection, interpolation, Luma([0]));

        for (dst, pixel) in out.plane_mut(c).iter_mut().zip(warped.pixels()) {
            *dst = lo + f32::from(pixel.0[0]) * step;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn ramp(channels: usize, height: usize, width: usize) -> ImageArray {
        let data = (0..channels * height * width).map(|v| v as f32).collect();
        ImageArray::new(channels, height, width, data).unwrap()
    }

    #[test]
    fn flips_follow_chw_axes() {
        let array = ramp(1, 2, 3);

        assert_eq!(flip(&array, 1).data(), &[3.0, 4.0, 5.0, 0.0, 1.0, 2.0]);
        assert_eq!(flip(&array, 2).data(), &[2.0, 1.0, 0.0, 5.0, 4.0, 3.0]);
        assert_eq!(flip(&array, 0), array);
    }

    #[test]
    fn pair_stays_aligned_under_random_ops() {
        let augmentor = DataAugmentor::new()
            .with(AugmentOp::resize_crop((12, 12), (8, 8)))
            .with(AugmentOp::flip(1))
            .with(AugmentOp::flip(2));
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..10 {
            let image = ramp(3, 10, 10);
            let label = image.clone();
            let (image, label) = augmentor.apply(image, label, &mut rng);

            assert_eq!(image.shape(), [3, 8, 8]);
            assert_eq!(image, label);
        }
    }

    #[test]
    fn resize_keeps_constant_images_constant() {
        let array = ImageArray::new(2, 4, 4, vec![0.25; 32]).unwrap();
        let resized = resize(&array, 7, 5);

        assert_eq!(resized.shape(), [2, 7, 5]);
        assert!(resized.data().iter().all(|v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn crop_extracts_window() {
        let array = ramp(1, 4, 4);
        let window = crop(&array, 1, 2, 2, 2);

        assert_eq!(window.data(), &[6.0, 7.0, 10.0, 11.0]);
    }

    #[test]
    fn identity_affine_is_lossless() {
        let projection = affine_projection((5, 6), 0.0, (0.0, 0.0), 1.0);
        let array = ramp(2, 5, 6);

        let nearest = warp_array(&array, &projection, Interpolation::Nearest);
        for (a, b) in nearest.data().iter().zip(array.data()) {
            assert!((a - b).abs() < 1e-2, "{a} != {b}");
        }

        // Bilinear sampling needs a right and lower neighbour.
        let bilinear = warp_array(&array, &projection, Interpolation::Bilinear);
        for c in 0..2 {
            for row in 0..4 {
                for col in 0..5 {
                    let i = row * 6 + col;
                    let (a, b) = (bilinear.plane(c)[i], array.plane(c)[i]);
                    assert!((a - b).abs() < 1e-2, "{a} != {b}");
                }
            }
        }
    }

    #[test]
    fn rotated_binary_label_stays_binary() {
        let data = (0..16 * 16)
            .map(|i| ((i / 16 / 4 + i % 16 / 4) % 2) as f32)
            .collect();
        let label = ImageArray::new(1, 16, 16, data).unwrap();
        let image = label.clone();
        let augmentor = DataAugmentor::new().with(AugmentOp::Affine2D {
            rotation: 30.0,
            translate: (0.1, 0.1),
            zoom: (0.9, 1.1),
        });
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..5 {
            let (image, label) = augmentor.apply(image.clone(), label.clone(), &mut rng);
            assert!(label.data().iter().all(|&v| v == 0.0 || v == 1.0));
            assert!(image.data().iter().all(|&v| (0.0..=1.0).contains(&v)));
        }
    }

    #[test]
    fn summary_lists_ops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("augment.json");
        DataAugmentor::new()
            .with(AugmentOp::resize_crop((286, 286), (256, 256)))
            .with(AugmentOp::flip(1))
            .summary(&path)
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json[0]["name"], "ResizeCrop2D");
        assert_eq!(json[1]["axis"], 1);
    }
}
