//! Merged concurrent downloads.

pub mod http_transport;
pub mod operation;
pub mod scheduler;

pub use http_transport::HttpTransport;
pub use operation::{DownloadOperation, FinishHook};
pub use scheduler::{DEFAULT_ACCEPT, DEFAULT_TIMEOUT, MergeRequestDownloader};
