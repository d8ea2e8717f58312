/// Error taxonomy for loading, scaling and rendering element maps.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MapError {
    /// No usable numeric content, or a value range that is not finite.
    #[error("data error: {0}")]
    Data(String),
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("file not found: {}", path.display())]
    FileMissing { path: PathBuf },
    #[error("file present but unreadable: {}: {reason}", path.display())]
    FileUnreadable { path: PathBuf, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("image encoding error: {0}")]
    Image(#[from] image::ImageError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MapError>;

impl MapError {
    pub fn data(msg: impl Into<String>) -> Self {
        MapError::Data(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        MapError::Config(msg.into())
    }
}
