//! Frameweave - animated image frame caching and merged image downloads.
//!
//! The crate provides a byte-budgeted, lazily filled frame cache for
//! animated images and a download scheduler that coalesces concurrent
//! requests for the same URL into a single fetch.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer containing the pipeline.
pub mod application;
/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing decoders, caches and the downloader.
pub mod infrastructure;

pub use application::{ImagePipeline, PipelineError};
pub use domain::{CacheBudget, DownloadError, DownloadOptions, DownloadTask, ImageError};
pub use infrastructure::{AnimatedImage, LoaderConfig, MergeRequestDownloader, init_logging};

/// Current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = "frameweave";
