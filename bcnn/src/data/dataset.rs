//! Paired image dataset.
//!
//! Samples are addressed by file name templates such as
//! `{root}/train/{patient}_a.mha`, where `{patient}` is expanded against a list
//! of glob-style patient patterns. Each sample is an (input image, target
//! label) pair; the input is normalized, and both go through the augmentor.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use burn::data::dataset::Dataset;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use walkdir::WalkDir;

use super::{augmentor::DataAugmentor, image::load_image, image::ImageArray, normalizer::Normalizer};
use crate::error::{BcnnError, BcnnResult};

/// A single (input, target) pair.
#[derive(Debug, Clone)]
pub struct PairItem {
    /// Input image `[C, H, W]`.
    pub image: ImageArray,
    /// Target label image `[C, H, W]`.
    pub label: ImageArray,
}

/// File name templates for the two halves of a pair.
///
/// `{root}` and `{patient}` are substituted; `{patient}` may only appear in the
/// file name, not in a directory component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairTemplates {
    /// Template of the input image path.
    pub image: String,
    /// Template of the label path.
    pub label: String,
}

impl PairTemplates {
    /// Creates templates from the two path patterns.
    pub fn new(image: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            label: label.into(),
        }
    }
}

/// File paths of a dataset, one list per pair half.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairFiles {
    /// Input image paths.
    pub image: Vec<PathBuf>,
    /// Label paths, aligned with `image`.
    pub label: Vec<PathBuf>,
}

/// Dataset of image pairs found on disk.
pub struct ImageDataset {
    patients: Vec<String>,
    files: PairFiles,
    normalizer: Option<Normalizer>,
    augmentor: Option<DataAugmentor>,
    seed: u64,
    draws: AtomicU64,
}

impl ImageDataset {
    /// Scans `root` for pairs matching `templates` and `patients`.
    ///
    /// # Errors
    ///
    /// Returns `BcnnError::Dataset` if the image directory is missing, a label
    /// file does not exist or cannot be read, or nothing matches.
    pub fn new(
        root: impl AsRef<Path>,
        patients: &[&str],
        templates: &PairTemplates,
        normalizer: Option<Normalizer>,
        augmentor: Option<DataAugmentor>,
    ) -> BcnnResult<Self> {
        let root = root.as_ref().to_string_lossy().to_string();
        let image_template = templates.image.replace("{root}", &root);
        let label_template = templates.label.replace("{root}", &root);

        let (image_dir, file_template) = split_template(&image_template)?;
        let (prefix, suffix) = file_template
            .split_once("{patient}")
            .ok_or_else(|| BcnnError::Dataset {
                message: format!("template `{}` has no {{patient}} placeholder", templates.image),
            })?;

        if let Some(normalizer) = &normalizer {
            normalizer.validate()?;
        }

        if !image_dir.is_dir() {
            return Err(BcnnError::Dataset {
                message: format!("Image directory does not exist: {}", image_dir.display()),
            });
        }

        let mut ids: Vec<String> = WalkDir::new(&image_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                let id = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
                patients
                    .iter()
                    .any(|pattern| wildcard_match(pattern, id))
                    .then(|| id.to_string())
            })
            .collect();
        ids.sort();
        ids.dedup();

        if ids.is_empty() {
            return Err(BcnnError::Dataset {
                message: format!(
                    "No files match {} for patients {patients:?}",
                    image_template
                ),
            });
        }

        let mut files = PairFiles::default();
        for id in &ids {
            let image = PathBuf::from(image_template.replace("{patient}", id));
            let label = PathBuf::from(label_template.replace("{patient}", id));
            if !label.is_file() {
                return Err(BcnnError::Dataset {
                    message: format!("Missing label {} for image {}", label.display(), image.display()),
                });
            }
            for path in [&image, &label] {
                load_image(path).map_err(|err| BcnnError::Dataset {
                    message: format!("Unreadable sample {}: {err}", path.display()),
                })?;
            }
            files.image.push(image);
            files.label.push(label);
        }

        tracing::info!(pairs = ids.len(), dir = %image_dir.display(), "found image pairs");

        Ok(Self {
            patients: ids,
            files,
            normalizer,
            augmentor,
            seed: 0,
            draws: AtomicU64::new(0),
        })
    }

    /// Seeds the augmentation random stream.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Patient ids in sample order.
    pub fn patients(&self) -> &[String] {
        &self.patients
    }

    /// File paths in sample order.
    pub const fn files(&self) -> &PairFiles {
        &self.files
    }

    /// The augmentor, if any.
    pub const fn augmentor(&self) -> Option<&DataAugmentor> {
        self.augmentor.as_ref()
    }

    /// Loads sample `index`, optionally skipping augmentation.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be loaded.
    pub fn load(&self, index: usize, augment: bool) -> BcnnResult<PairItem> {
        let (image, _) = load_image(&self.files.image[index])?;
        let (label, _) = load_image(&self.files.label[index])?;

        let image = match &self.normalizer {
            Some(normalizer) => normalizer.apply(image),
            None => image,
        };

        let (image, label) = match (&self.augmentor, augment) {
            (Some(augmentor), true) => {
                let draw = self.draws.fetch_add(1, Ordering::Relaxed);
                let mut rng = StdRng::seed_from_u64(
                    self.seed
                        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                        .wrapping_add(draw)
                        .wrapping_add(index as u64),
                );
                augmentor.apply(image, label, &mut rng)
            }
            _ => (image, label),
        };

        Ok(PairItem { image, label })
    }
}

impl Dataset<PairItem> for ImageDataset {
    fn get(&self, index: usize) -> Option<PairItem> {
        if index >= self.len() {
            return None;
        }
        match self.load(index, true) {
            Ok(item) => Some(item),
            Err(err) => {
                tracing::warn!(index, error = %err, "failed to load sample");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.patients.len()
    }
}

/// A view on a subset of an `ImageDataset`.
#[derive(Clone)]
pub struct Subset {
    dataset: Arc<ImageDataset>,
    indices: Vec<usize>,
    augment: bool,
}

impl Subset {
    /// Wraps `dataset` restricted to `indices`.
    pub fn new(dataset: Arc<ImageDataset>, indices: Vec<usize>) -> Self {
        Self {
            dataset,
            indices,
            augment: true,
        }
    }

    /// The whole dataset.
    pub fn full(dataset: Arc<ImageDataset>) -> Self {
        let indices = (0..dataset.len()).collect();
        Self::new(dataset, indices)
    }

    /// Disables augmentation for this view.
    #[must_use]
    pub fn without_augmentor(mut self) -> Self {
        self.augment = false;
        self
    }

    /// Whether samples of this view are augmented.
    pub fn augments(&self) -> bool {
        self.augment && self.dataset.augmentor().is_some()
    }

    /// Indices into the parent dataset.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// File paths of this view in sample order.
    pub fn files(&self) -> PairFiles {
        let all = self.dataset.files();
        PairFiles {
            image: self.indices.iter().map(|i| all.image[*i].clone()).collect(),
            label: self.indices.iter().map(|i| all.label[*i].clone()).collect(),
        }
    }
}

impl Dataset<PairItem> for Subset {
    fn get(&self, index: usize) -> Option<PairItem> {
        let inner = *self.indices.get(index)?;
        match self.dataset.load(inner, self.augment) {
            Ok(item) => Some(item),
            Err(err) => {
                tracing::warn!(index = inner, error = %err, "failed to load sample");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}

/// Randomly splits `dataset` into training and validation views.
///
/// The validation view receives `floor(len * valid_ratio)` samples.
///
/// # Errors
///
/// Returns `BcnnError::InvalidConfiguration` unless `0 < valid_ratio < 1` and
/// both views end up non-empty.
pub fn train_valid_split(
    dataset: ImageDataset,
    valid_ratio: f64,
    seed: u64,
) -> BcnnResult<(Subset, Subset)> {
    if !(valid_ratio > 0.0 && valid_ratio < 1.0) {
        return Err(BcnnError::InvalidConfiguration {
            reason: format!("validation split ratio must be in (0, 1), got {valid_ratio}"),
        });
    }
    let len = dataset.len();
    let n_valid = (len as f64 * valid_ratio).floor() as usize;
    if n_valid == 0 || n_valid == len {
        return Err(BcnnError::InvalidConfiguration {
            reason: format!(
                "splitting {len} samples with ratio {valid_ratio} leaves an empty side"
            ),
        });
    }

    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let valid: Vec<usize> = order[..n_valid].to_vec();
    let train: Vec<usize> = order[n_valid..].to_vec();

    let dataset = Arc::new(dataset);
    Ok((Subset::new(dataset.clone(), train), Subset::new(dataset, valid)))
}

fn split_template(template: &str) -> BcnnResult<(PathBuf, String)> {
    let path = Path::new(template);
    let file = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| BcnnError::Dataset {
            message: format!("template `{template}` has no file name"),
        })?
        .to_string();
    let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    if dir.to_string_lossy().contains("{patient}") {
        return Err(BcnnError::Dataset {
            message: format!("{{patient}} must only appear in the file name of `{template}`"),
        });
    }
    Ok((dir, file))
}

/// Glob-style match supporting `*` (any run) and `?` (any single character).
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}
