use std::time::Duration;

use thiserror::Error;

use crate::OriginalBox;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Detection map shape or a tunable is unusable. Aborts the whole run.
    #[error("configuration: {0}")]
    Configuration(String),

    #[error("empty region at {0:?}")]
    EmptyRegion(OriginalBox),

    #[error("recognition timed out after {0:?}")]
    RecognitionTimeout(Duration),

    #[error("recognition failed: {0}")]
    Recognition(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("catalog lookup failed: {0}")]
    Catalog(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error(transparent)]
    Session(#[from] ort::Error),

    #[error("tensor shape")]
    Shape(#[from] ndarray::ShapeError),

    #[error("image")]
    Image(#[from] image::ImageError),

    #[error("io")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether the error only affects a single region. Anything else fails the
    /// whole image.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::EmptyRegion(_)
                | Self::RecognitionTimeout(_)
                | Self::Recognition(_)
                | Self::Catalog(_)
        )
    }
}
