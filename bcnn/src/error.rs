use std::path::PathBuf;

use thiserror::Error;

/// The error type for `bcnn-burn` operations.
///
/// This enum covers everything the library can fail on, from configuration
/// issues to unreadable images and missing snapshots.
#[derive(Error, Debug)]
pub enum BcnnError {
    /// Error for when an invalid model or data configuration is provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// Error for when an input tensor or array has an unexpected shape.
    #[error("Invalid shape: expected {expected}, got {actual}")]
    InvalidShape {
        /// The expected shape.
        expected: String,
        /// The actual shape.
        actual: String,
    },

    /// Error for when dataset operations fail.
    #[error("Dataset error: {message}")]
    Dataset {
        /// The error message.
        message: String,
    },

    /// Error for malformed MetaImage headers or payloads.
    #[error("Invalid MetaImage file {path}: {reason}")]
    MetaImage {
        /// File being parsed.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Error for when no snapshot matches the requested pattern.
    #[error("No snapshot matching `{prefix}*` in {dir}")]
    SnapshotNotFound {
        /// Snapshot file prefix.
        prefix: String,
        /// Directory that was searched.
        dir: PathBuf,
    },

    /// Error for when saving or loading model records fails.
    #[error("Record error: {0}")]
    Record(#[from] burn::record::RecorderError),

    /// Error for when rendering a figure or plot fails.
    #[error("Rendering failed: {message}")]
    Render {
        /// The error message.
        message: String,
    },

    /// Error from the image codec.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Error from JSON (de)serialization.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error from the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for `bcnn-burn` operations.
pub type BcnnResult<T> = Result<T, BcnnError>;
