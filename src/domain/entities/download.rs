//! Download request and task types.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::Url;

use crate::domain::errors::DownloadResult;

bitflags::bitflags! {
    /// Per-request download options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
    pub struct DownloadOptions: u32 {
        /// Use the protocol-level cache instead of bypassing it.
        const USE_EXISTING_CACHE = 1;
        /// Allow the network layer to attach and store cookies.
        const HANDLE_COOKIES = 1 << 1;
        /// Ask for best-effort decodes of partially received data.
        const PROGRESSIVE_DECODE = 1 << 2;
    }
}

/// Everything the network layer needs to issue one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Resource to fetch.
    pub url: Url,
    /// Extra HTTP headers.
    pub headers: BTreeMap<String, String>,
    /// Whole-request timeout enforced by the network layer.
    pub timeout: Duration,
    /// Honor protocol caching instead of forcing a reload.
    pub use_protocol_cache: bool,
    /// Let the network layer handle cookies.
    pub handle_cookies: bool,
}

impl DownloadRequest {
    /// Builds a request for `url` from the caller's options.
    #[must_use]
    pub fn new(
        url: Url,
        options: DownloadOptions,
        headers: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Self {
        Self {
            url,
            headers,
            timeout,
            use_protocol_cache: options.contains(DownloadOptions::USE_EXISTING_CACHE),
            handle_cookies: options.contains(DownloadOptions::HANDLE_COOKIES),
        }
    }
}

/// Snapshot handed to progress callbacks while a download is in flight.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Bytes received so far, if any.
    pub data: Option<Bytes>,
    /// Declared total size, 0 when unknown.
    pub expected_size: u64,
    /// Best-effort decode of the partial data.
    pub image: Option<Arc<image::DynamicImage>>,
}

/// Terminal callback of a task: the body bytes or the transfer error.
pub type CompletionCallback = Box<dyn FnOnce(DownloadResult<Bytes>) + Send>;

/// Callback invoked zero or more times before completion.
pub type ProgressCallback = Box<dyn Fn(&DownloadProgress) + Send + Sync>;

/// One caller's interest in one URL.
///
/// A task is always attached to exactly one download operation, which
/// invokes its completion callback at most once.
pub struct DownloadTask {
    url: Url,
    options: DownloadOptions,
    cancelled: AtomicBool,
    completion: Mutex<Option<CompletionCallback>>,
    progress: Option<ProgressCallback>,
}

impl DownloadTask {
    /// Creates a task with a completion callback.
    pub fn new(
        url: Url,
        options: DownloadOptions,
        completion: impl FnOnce(DownloadResult<Bytes>) + Send + 'static,
    ) -> Self {
        Self {
            url,
            options,
            cancelled: AtomicBool::new(false),
            completion: Mutex::new(Some(Box::new(completion))),
            progress: None,
        }
    }

    /// Attaches a progress callback.
    #[must_use]
    pub fn with_progress(
        mut self,
        progress: impl Fn(&DownloadProgress) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Returns the requested URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the options the task was created with.
    #[must_use]
    pub const fn options(&self) -> DownloadOptions {
        self.options
    }

    /// Returns true once the task has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Marks the task cancelled. Its callbacks will no longer fire.
    ///
    /// This only withdraws this caller's interest; use the downloader's
    /// `cancel_task` to also stop an operation nobody waits on.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true if the task has a progress callback.
    #[must_use]
    pub const fn has_progress(&self) -> bool {
        self.progress.is_some()
    }

    /// Returns true if the task wants partial decodes.
    #[must_use]
    pub fn wants_progressive_decode(&self) -> bool {
        self.has_progress() && self.options.contains(DownloadOptions::PROGRESSIVE_DECODE)
    }

    pub(crate) fn complete(&self, result: DownloadResult<Bytes>) {
        let completion = self.completion.lock().take();
        if let Some(completion) = completion {
            completion(result);
        }
    }

    pub(crate) fn report_progress(&self, progress: &DownloadProgress) {
        if let Some(callback) = &self.progress {
            callback(progress);
        }
    }
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("url", &self.url.as_str())
            .field("options", &self.options)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
