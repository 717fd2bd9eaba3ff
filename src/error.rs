use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while preparing or running a style transfer.
///
/// Every variant is fatal for the run that raised it; nothing is retried.
#[derive(Error, Debug)]
pub enum StyleTransferError {
    /// Layer and weight lists of an experiment do not line up.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An image tensor does not have the `[1, 3, height, width]` layout the network expects.
    #[error("invalid tensor shape: {0}")]
    Shape(String),

    /// The frozen network parameters are absent or do not match the network.
    #[error("missing network weights: {0}")]
    MissingWeights(String),

    /// An input image does not exist.
    #[error("file does not exist: `{}`", .0.display())]
    MissingFile(PathBuf),

    /// Image decoding or encoding failed.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O operation error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = StyleTransferError> = std::result::Result<T, E>;
