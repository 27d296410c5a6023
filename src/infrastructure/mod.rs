//! Infrastructure layer: decoding, caching, downloading and ambient setup.

/// Loader configuration.
pub mod config;
/// Merged concurrent downloads.
pub mod download;
/// Animated image decoding and frame caching.
pub mod image;
/// Tracing subscriber setup.
pub mod logging;
/// Parallel worker lanes.
pub mod queue_pool;

pub use config::{ConfigError, LoaderConfig, LogLevel};
pub use download::{HttpTransport, MergeRequestDownloader};
pub use image::{AnimatedImage, CoderRegistry, GifCoder, StillImageProgressiveDecoder};
pub use logging::{LoggingError, init_logging};
pub use queue_pool::{Lane, QueuePool};
