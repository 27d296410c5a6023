//! Domain error types.

mod download_error;
mod image_error;

pub use download_error::{DownloadError, DownloadResult};
pub use image_error::{ImageError, ImageResult};
