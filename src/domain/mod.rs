//! Domain layer with core entities, errors and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{CacheBudget, DownloadOptions, DownloadTask, FrameSize};
pub use errors::{DownloadError, ImageError};
pub use ports::{AnimatedCoderPort, AnimatedDecoderPort, NetworkPort, ProgressiveDecoderPort};
