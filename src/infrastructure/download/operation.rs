//! A single network fetch shared by every task waiting on one URL.

use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use reqwest::Url;
use tracing::{debug, trace, warn};

use crate::domain::entities::{DownloadProgress, DownloadRequest, DownloadTask};
use crate::domain::errors::{DownloadError, DownloadResult};
use crate::domain::ports::{
    NetworkPort, ProgressiveDecoderPort, ResponseDisposition, TransferDelegate, TransferHandle,
};
use crate::infrastructure::image::CoderRegistry;
use crate::infrastructure::queue_pool::{Lane, QueuePool};

/// Hook run once after an operation reached its terminal state and its
/// tasks were notified.
pub type FinishHook = Box<dyn FnOnce(&DownloadOperation) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Finished,
}

struct OperationState {
    phase: Phase,
    cancelled: bool,
    tasks: Vec<Arc<DownloadTask>>,
    transfer: Option<Box<dyn TransferHandle>>,
    data: BytesMut,
    expected_size: u64,
    progressive: Option<Arc<dyn ProgressiveDecoderPort>>,
    reported_len: usize,
    on_finish: Option<FinishHook>,
}

impl OperationState {
    fn is_closed(&self) -> bool {
        self.cancelled || self.phase == Phase::Finished
    }

    /// Moves to `Finished` and hands back what must be notified.
    fn close(&mut self) -> (Vec<Arc<DownloadTask>>, Option<FinishHook>) {
        self.phase = Phase::Finished;
        self.transfer = None;
        self.progressive = None;
        self.data = BytesMut::new();
        (std::mem::take(&mut self.tasks), self.on_finish.take())
    }

    fn progress_targets(&self) -> Vec<Arc<DownloadTask>> {
        self.tasks
            .iter()
            .filter(|t| t.has_progress() && !t.is_cancelled())
            .cloned()
            .collect()
    }
}

/// One in-flight (or queued) fetch of one URL.
///
/// Moves through `Idle`, `Running` and `Finished`; cancellation may happen
/// from either of the first two and finishes the operation early. Once
/// finished no task can be attached and network events are ignored.
pub struct DownloadOperation {
    request: DownloadRequest,
    transport: Arc<dyn NetworkPort>,
    // Every decode of this operation runs here, so reports keep their order.
    lane: Lane,
    coders: Option<Arc<CoderRegistry>>,
    state: Mutex<OperationState>,
    weak_self: Weak<Self>,
}

impl DownloadOperation {
    /// Creates an idle operation bound to one lane of `pool`.
    pub fn new(
        request: DownloadRequest,
        transport: Arc<dyn NetworkPort>,
        pool: &QueuePool,
        coders: Option<Arc<CoderRegistry>>,
        on_finish: Option<FinishHook>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            request,
            transport,
            lane: pool.lane(),
            coders,
            state: Mutex::new(OperationState {
                phase: Phase::Idle,
                cancelled: false,
                tasks: Vec::new(),
                transfer: None,
                data: BytesMut::new(),
                expected_size: 0,
                progressive: None,
                reported_len: 0,
                on_finish,
            }),
            weak_self: weak_self.clone(),
        })
    }

    /// URL being fetched.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.request.url
    }

    /// Request handed to the network layer.
    #[must_use]
    pub const fn request(&self) -> &DownloadRequest {
        &self.request
    }

    /// Attaches `task`. Returns false once the operation is finished or
    /// cancelled; the caller must then use a fresh operation.
    pub fn add(&self, task: Arc<DownloadTask>) -> bool {
        let mut state = self.state.lock();
        if state.is_closed() {
            return false;
        }
        state.tasks.push(task);
        true
    }

    /// Issues the network request. No-op unless idle and not cancelled.
    pub fn start(&self) {
        {
            let mut state = self.state.lock();
            if state.cancelled || state.phase != Phase::Idle {
                return;
            }
            state.phase = Phase::Running;
        }
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };

        debug!(url = %self.request.url, "Starting download");
        let delegate: Arc<dyn TransferDelegate> = this;
        let handle = self.transport.start(self.request.clone(), delegate);

        let mut state = self.state.lock();
        if state.cancelled {
            drop(state);
            handle.cancel();
        } else if state.phase == Phase::Running {
            state.transfer = Some(handle);
        }
    }

    /// Aborts the fetch and notifies every live task with
    /// [`DownloadError::Cancelled`]. No-op once finished.
    pub fn cancel(&self) {
        let (transfer, tasks, hook) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Finished {
                return;
            }
            state.cancelled = true;
            let transfer = state.transfer.take();
            let (tasks, hook) = state.close();
            (transfer, tasks, hook)
        };
        debug!(url = %self.request.url, "Download cancelled");
        if let Some(transfer) = transfer {
            transfer.cancel();
        }
        self.notify(tasks, hook, &Err(DownloadError::Cancelled));
    }

    /// Returns true once the operation reached its terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.lock().phase == Phase::Finished
    }

    /// Returns true if the operation was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Returns true while the network request is in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().phase == Phase::Running
    }

    /// Number of attached tasks, cancelled ones included.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Number of attached tasks that were not cancelled.
    #[must_use]
    pub fn active_task_count(&self) -> usize {
        self.state
            .lock()
            .tasks
            .iter()
            .filter(|t| !t.is_cancelled())
            .count()
    }

    /// Returns true if `task` is attached to this operation.
    #[must_use]
    pub fn contains(&self, task: &Arc<DownloadTask>) -> bool {
        self.state.lock().tasks.iter().any(|t| Arc::ptr_eq(t, task))
    }

    fn finish(&self, result: DownloadResult<Bytes>) {
        let (tasks, hook) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Finished {
                return;
            }
            state.close()
        };
        match &result {
            Ok(data) => debug!(url = %self.request.url, bytes = data.len(), "Download finished"),
            Err(e) => warn!(url = %self.request.url, error = %e, "Download failed"),
        }
        self.notify(tasks, hook, &result);
    }

    fn notify(
        &self,
        tasks: Vec<Arc<DownloadTask>>,
        hook: Option<FinishHook>,
        result: &DownloadResult<Bytes>,
    ) {
        for task in tasks.iter().filter(|t| !t.is_cancelled()) {
            task.complete(result.clone());
        }
        if let Some(hook) = hook {
            hook(self);
        }
    }

    /// Picks a progressive decoder the first time a chunk arrives for a
    /// task that asked for one.
    fn progressive_decoder(&self, snapshot: &[u8]) -> Option<Arc<dyn ProgressiveDecoderPort>> {
        let existing = self.state.lock().progressive.clone();
        if existing.is_some() {
            return existing;
        }
        let found = self.coders.as_ref()?.progressive_decoder_for(snapshot)?;
        let mut state = self.state.lock();
        if state.is_closed() {
            return None;
        }
        Some(state.progressive.get_or_insert(found).clone())
    }

    fn decode_and_report(&self, decoder: &dyn ProgressiveDecoderPort, snapshot: Bytes, finished: bool) {
        let image = decoder.incrementally_decoded_image(&snapshot, finished);
        let (targets, expected_size) = {
            let mut state = self.state.lock();
            if state.is_closed() || snapshot.len() < state.reported_len {
                return;
            }
            state.reported_len = snapshot.len();
            (state.progress_targets(), state.expected_size)
        };
        trace!(
            url = %self.request.url,
            received = snapshot.len(),
            decoded = image.is_some(),
            "Progressive decode"
        );
        let progress = DownloadProgress {
            data: Some(snapshot),
            expected_size,
            image,
        };
        for task in targets {
            task.report_progress(&progress);
        }
    }
}

impl TransferDelegate for DownloadOperation {
    fn did_receive_response(&self, status: u16, content_length: Option<u64>) -> ResponseDisposition {
        if status >= 400 || status == 304 {
            debug!(url = %self.request.url, status, "Rejecting response");
            return ResponseDisposition::Cancel;
        }
        let mut state = self.state.lock();
        if state.is_closed() {
            return ResponseDisposition::Cancel;
        }
        state.expected_size = content_length.unwrap_or(0);
        ResponseDisposition::Allow
    }

    fn did_receive_data(&self, chunk: &[u8]) {
        let (snapshot, targets, expected_size, wants_decode) = {
            let mut state = self.state.lock();
            if state.is_closed() {
                return;
            }
            state.data.extend_from_slice(chunk);
            let targets = state.progress_targets();
            if targets.is_empty() {
                return;
            }
            let wants_decode = targets.iter().any(|t| t.wants_progressive_decode());
            (
                Bytes::copy_from_slice(&state.data),
                targets,
                state.expected_size,
                wants_decode,
            )
        };
        trace!(url = %self.request.url, chunk = chunk.len(), received = snapshot.len(), "Received data");

        if wants_decode && let Some(decoder) = self.progressive_decoder(&snapshot) {
            let Some(this) = self.weak_self.upgrade() else {
                return;
            };
            self.lane.submit(move || this.decode_and_report(decoder.as_ref(), snapshot, false));
            return;
        }

        let progress = DownloadProgress {
            data: Some(snapshot),
            expected_size,
            image: None,
        };
        for task in targets {
            task.report_progress(&progress);
        }
    }

    fn did_complete(&self, result: DownloadResult<()>) {
        let (data, decoder) = {
            let mut state = self.state.lock();
            if state.is_closed() {
                return;
            }
            (std::mem::take(&mut state.data).freeze(), state.progressive.clone())
        };

        match result {
            Err(e) => self.finish(Err(e)),
            Ok(()) if data.is_empty() => self.finish(Err(DownloadError::NoData)),
            Ok(()) => match (decoder, self.weak_self.upgrade()) {
                (Some(decoder), Some(this)) => self.lane.submit(move || {
                    this.decode_and_report(decoder.as_ref(), data.clone(), true);
                    this.finish(Ok(data));
                }),
                _ => self.finish(Ok(data)),
            },
        }
    }
}

impl std::fmt::Debug for DownloadOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DownloadOperation")
            .field("url", &self.request.url.as_str())
            .field("phase", &state.phase)
            .field("cancelled", &state.cancelled)
            .field("tasks", &state.tasks.len())
            .finish_non_exhaustive()
    }
}
