//! Merge-request download scheduler.
//!
//! Concurrent requests for the same URL share one [`DownloadOperation`].
//! At most `max_concurrent_downloads` operations run at once; the rest wait
//! in FIFO order and start as running ones finish.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::Url;
use tracing::{debug, trace};

use crate::domain::entities::{DownloadOptions, DownloadProgress, DownloadRequest, DownloadTask};
use crate::domain::errors::DownloadResult;
use crate::domain::ports::NetworkPort;
use crate::infrastructure::config::DownloaderConfig;
use crate::infrastructure::image::CoderRegistry;
use crate::infrastructure::queue_pool::QueuePool;

use super::operation::DownloadOperation;

/// Timeout used when none (or zero) is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Header sent with every request unless overridden.
pub const DEFAULT_ACCEPT: &str = "image/*;q=0.8";

struct SchedulerState {
    operations: HashMap<Url, Arc<DownloadOperation>>,
    waiting: VecDeque<Arc<DownloadOperation>>,
    running: usize,
    headers: BTreeMap<String, String>,
    timeout: Duration,
}

/// Downloader that merges concurrent requests for the same URL.
pub struct MergeRequestDownloader {
    state: Mutex<SchedulerState>,
    max_running: usize,
    transport: Arc<dyn NetworkPort>,
    pool: Arc<QueuePool>,
    coders: Option<Arc<CoderRegistry>>,
    weak_self: Weak<Self>,
}

impl MergeRequestDownloader {
    /// Creates a downloader issuing fetches through `transport` and running
    /// operation work on `pool`. `coders` enables progressive decoding.
    pub fn new(
        transport: Arc<dyn NetworkPort>,
        pool: Arc<QueuePool>,
        coders: Option<Arc<CoderRegistry>>,
        config: &DownloaderConfig,
    ) -> Arc<Self> {
        let mut headers = BTreeMap::from([("Accept".to_string(), DEFAULT_ACCEPT.to_string())]);
        headers.extend(config.headers.clone());

        Arc::new_cyclic(|weak_self| Self {
            state: Mutex::new(SchedulerState {
                operations: HashMap::new(),
                waiting: VecDeque::new(),
                running: 0,
                headers,
                timeout: effective_timeout(Duration::from_secs(config.timeout_secs)),
            }),
            max_running: config.max_concurrent_downloads.max(1),
            transport,
            pool,
            coders,
            weak_self: weak_self.clone(),
        })
    }

    /// Requests `url`. Joins the live fetch for that URL if there is one.
    pub fn download(
        &self,
        url: Url,
        options: DownloadOptions,
        completion: impl FnOnce(DownloadResult<Bytes>) + Send + 'static,
    ) -> Arc<DownloadTask> {
        self.submit(DownloadTask::new(url, options, completion))
    }

    /// Like [`download`](Self::download), also reporting progress.
    pub fn download_with_progress(
        &self,
        url: Url,
        options: DownloadOptions,
        progress: impl Fn(&DownloadProgress) + Send + Sync + 'static,
        completion: impl FnOnce(DownloadResult<Bytes>) + Send + 'static,
    ) -> Arc<DownloadTask> {
        self.submit(DownloadTask::new(url, options, completion).with_progress(progress))
    }

    /// Attaches a prepared task to the operation for its URL.
    ///
    /// Operation methods are never called with the scheduler lock held: the
    /// operation's finish hook takes that lock.
    pub fn submit(&self, task: DownloadTask) -> Arc<DownloadTask> {
        let task = Arc::new(task);
        loop {
            let (live, headers, timeout) = {
                let state = self.state.lock();
                (
                    state.operations.get(task.url()).cloned(),
                    state.headers.clone(),
                    state.timeout,
                )
            };
            if let Some(live) = &live
                && live.add(task.clone())
            {
                trace!(url = %task.url(), "Joined running download");
                return task;
            }

            let operation = self.new_operation(&task, headers, timeout);
            operation.add(task.clone());

            let to_start = {
                let mut state = self.state.lock();
                let current = state.operations.get(task.url());
                let unchanged = match (current, &live) {
                    (None, None) => true,
                    (Some(current), Some(live)) => Arc::ptr_eq(current, live),
                    _ => false,
                };
                if !unchanged {
                    // Another caller registered this URL meanwhile; join theirs.
                    continue;
                }
                // A finished operation still registered for this URL is replaced.
                state.operations.insert(task.url().clone(), operation.clone());

                if state.running < self.max_running {
                    state.running += 1;
                    Some(operation)
                } else {
                    debug!(url = %task.url(), waiting = state.waiting.len() + 1, "Download queued");
                    state.waiting.push_back(operation);
                    None
                }
            };

            if let Some(operation) = to_start {
                self.pool.submit(move || operation.start());
            }
            return task;
        }
    }

    /// Withdraws `task`. Its operation is cancelled when no live task
    /// remains on it.
    pub fn cancel_task(&self, task: &Arc<DownloadTask>) {
        task.cancel();
        let operation = self.state.lock().operations.get(task.url()).cloned();
        if let Some(operation) = operation
            && operation.contains(task)
            && operation.active_task_count() == 0
        {
            operation.cancel();
        }
    }

    /// Cancels the operation serving `url`, if any.
    pub fn cancel_url(&self, url: &Url) {
        let operation = self.state.lock().operations.get(url).cloned();
        if let Some(operation) = operation {
            operation.cancel();
        }
    }

    /// Cancels every tracked operation on the pool, without blocking.
    pub fn cancel_all(&self) {
        let weak = self.weak_self.clone();
        self.pool.submit(move || {
            let Some(this) = weak.upgrade() else {
                return;
            };
            let operations: Vec<_> = this.state.lock().operations.values().cloned().collect();
            debug!(count = operations.len(), "Cancelling all downloads");
            for operation in operations {
                operation.cancel();
            }
        });
    }

    /// Sets (or with `None` removes) a header sent with new requests.
    pub fn set_header(&self, field: impl Into<String>, value: Option<String>) {
        let field = field.into();
        let mut state = self.state.lock();
        match value {
            Some(value) => state.headers.insert(field, value),
            None => state.headers.remove(&field),
        };
    }

    /// Sets the per-request timeout of new requests. Zero restores the
    /// default.
    pub fn set_timeout(&self, timeout: Duration) {
        self.state.lock().timeout = effective_timeout(timeout);
    }

    /// Current per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.state.lock().timeout
    }

    /// Headers sent with new requests.
    #[must_use]
    pub fn headers(&self) -> BTreeMap<String, String> {
        self.state.lock().headers.clone()
    }

    /// Maximum number of operations running at once.
    #[must_use]
    pub const fn max_concurrent_downloads(&self) -> usize {
        self.max_running
    }

    /// Number of operations holding a running slot.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.state.lock().running
    }

    /// Number of operations waiting for a slot.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// Returns true if an unfinished operation serves `url`.
    #[must_use]
    pub fn is_downloading(&self, url: &Url) -> bool {
        let operation = self.state.lock().operations.get(url).cloned();
        operation.is_some_and(|op| !op.is_finished())
    }

    fn new_operation(
        &self,
        task: &DownloadTask,
        headers: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Arc<DownloadOperation> {
        let request = DownloadRequest::new(task.url().clone(), task.options(), headers, timeout);
        let weak = self.weak_self.clone();
        let url = task.url().clone();
        DownloadOperation::new(
            request,
            self.transport.clone(),
            &self.pool,
            self.coders.clone(),
            Some(Box::new(move |operation| {
                if let Some(this) = weak.upgrade() {
                    this.operation_finished(&url, operation);
                }
            })),
        )
    }

    fn operation_finished(&self, url: &Url, finished: &DownloadOperation) {
        let is_same = |op: &Arc<DownloadOperation>| std::ptr::eq(Arc::as_ptr(op), finished);

        let next = {
            let mut state = self.state.lock();
            if state.operations.get(url).is_some_and(is_same) {
                state.operations.remove(url);
            }
            if let Some(position) = state.waiting.iter().position(is_same) {
                // Never held a slot.
                state.waiting.remove(position);
                None
            } else if let Some(next) = state.waiting.pop_front() {
                Some(next)
            } else {
                state.running = state.running.saturating_sub(1);
                None
            }
        };

        if let Some(next) = next {
            debug!(url = %next.url(), "Starting queued download");
            self.pool.submit(move || next.start());
        }
    }
}

fn effective_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        DEFAULT_TIMEOUT
    } else {
        timeout
    }
}

impl std::fmt::Debug for MergeRequestDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MergeRequestDownloader")
            .field("operations", &state.operations.len())
            .field("waiting", &state.waiting.len())
            .field("running", &state.running)
            .field("max_running", &self.max_running)
            .finish_non_exhaustive()
    }
}
