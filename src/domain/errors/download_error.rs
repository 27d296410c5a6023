//! Download error types.

use thiserror::Error;

/// Result type for download operations.
pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

/// Terminal errors delivered to download tasks.
///
/// Cloneable because one transfer outcome fans out to every waiting task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    /// The download was cancelled by a caller.
    #[error("download cancelled")]
    Cancelled,

    /// The network layer aborted the transfer (e.g. a rejected response).
    #[error("transfer aborted by the network layer")]
    Aborted,

    /// The request exceeded its timeout.
    #[error("request timed out")]
    Timeout,

    /// The transfer succeeded but carried no body.
    #[error("no image data")]
    NoData,

    /// Transport failure.
    #[error("network error: {0}")]
    Network(String),
}

impl DownloadError {
    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Returns whether the error came from an explicit caller cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns whether retrying the same request may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network(_))
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(error.to_string())
        }
    }
}
