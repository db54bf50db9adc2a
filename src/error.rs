use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why an upscale run failed
///
/// The variant tells callers which phase broke; the `Display` text is what
/// ends up on the `ERROR:` line.
#[derive(Debug, Error)]
pub enum UpscaleError {
    /// Configuration could not be resolved
    #[error("configuration error: {0}")]
    Config(String),

    /// Network hyperparameters are inconsistent
    #[error("invalid network configuration: {0}")]
    InvalidNetwork(String),

    /// Weights download failed
    #[error("failed to download {url}: {message}")]
    Network {
        /// Requested URL
        url: String,
        /// Transport or HTTP status failure
        message: String,
    },

    /// Local file or directory operation failed
    #[error("{}: {source}", path.display())]
    Filesystem {
        /// Path being created, written or renamed
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// Weights file is unreadable or does not match the network
    #[error("failed to load model from {}: {message}", path.display())]
    Model {
        /// Weights file
        path: PathBuf,
        /// Loader failure
        message: String,
    },

    /// Input image could not be opened or decoded
    #[error("failed to read image {}: {message}", path.display())]
    Decode {
        /// Input image
        path: PathBuf,
        /// Codec or I/O failure
        message: String,
    },

    /// Forward pass failed (shape mismatch, device out of memory, ...)
    #[error("inference failed: {0}")]
    Inference(String),

    /// Output image could not be encoded or written
    #[error("failed to write image {}: {message}", path.display())]
    Encode {
        /// Output image
        path: PathBuf,
        /// Codec or I/O failure
        message: String,
    },
}

impl UpscaleError {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }
}

impl From<candle_core::Error> for UpscaleError {
    fn from(e: candle_core::Error) -> Self {
        Self::Inference(e.to_string())
    }
}
