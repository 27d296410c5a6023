//! Domain entity definitions.

mod download;
mod frame;

pub use download::{
    CompletionCallback, DownloadOptions, DownloadProgress, DownloadRequest, DownloadTask,
    ProgressCallback,
};
pub use frame::{CacheBudget, FrameSize};
