use std::path::PathBuf;

use thiserror::Error;

/// Errors raised anywhere in the capture core.
///
/// Only `Configuration` and unhandled worker failures end a session. Per-item
/// `Io` and `Validation` errors are absorbed where they occur.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid label data in {path} line {line}: {message}")]
    Validation {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("capture store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CaptureError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;
