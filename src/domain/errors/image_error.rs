//! Image decoding error types.

use thiserror::Error;

/// Result type for image construction.
pub type ImageResult<T> = std::result::Result<T, ImageError>;

/// Reasons an animated image cannot be constructed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)]
pub enum ImageError {
    /// No registered coder recognizes the data.
    #[error("unsupported image format")]
    UnsupportedFormat,

    /// The data decodes to zero frames.
    #[error("image has no frames")]
    NoFrames,

    /// A required frame failed to decode.
    #[error("failed to decode frame {index}")]
    FrameDecode { index: usize },

    /// The decoder could not report a frame's duration.
    #[error("missing duration for frame {index}")]
    MissingDuration { index: usize },

    /// The underlying codec rejected the data.
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<image::ImageError> for ImageError {
    fn from(error: image::ImageError) -> Self {
        Self::Decode(error.to_string())
    }
}
