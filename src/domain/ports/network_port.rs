//! Port definition for the network layer.

use std::sync::Arc;

use crate::domain::entities::DownloadRequest;
use crate::domain::errors::DownloadResult;

/// What the network layer should do after a response head arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// Keep receiving the body.
    Allow,
    /// Abort the transfer. The network layer then reports
    /// [`DownloadError::Aborted`](crate::domain::errors::DownloadError::Aborted).
    Cancel,
}

/// Receiver of the events of one transfer.
pub trait TransferDelegate: Send + Sync {
    /// Called once with the status code and declared body length.
    fn did_receive_response(&self, status: u16, content_length: Option<u64>)
    -> ResponseDisposition;

    /// Called for every body chunk, in order.
    fn did_receive_data(&self, chunk: &[u8]);

    /// Called exactly once when the transfer ends, unless it was cancelled
    /// through its [`TransferHandle`].
    fn did_complete(&self, result: DownloadResult<()>);
}

/// Handle to an in-flight transfer.
pub trait TransferHandle: Send + Sync {
    /// Aborts the transfer. No further delegate calls are made.
    fn cancel(&self);
}

/// Port for issuing network fetches.
pub trait NetworkPort: Send + Sync {
    /// Starts fetching `request`, reporting to `delegate`.
    fn start(
        &self,
        request: DownloadRequest,
        delegate: Arc<dyn TransferDelegate>,
    ) -> Box<dyn TransferHandle>;
}
