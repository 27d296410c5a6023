//! HTTP implementation of the network port.

use std::sync::Arc;

use reqwest::Client;
use reqwest::header::CACHE_CONTROL;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::domain::entities::DownloadRequest;
use crate::domain::errors::{DownloadError, DownloadResult};
use crate::domain::ports::{NetworkPort, ResponseDisposition, TransferDelegate, TransferHandle};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Network port backed by `reqwest`, running transfers on a tokio runtime.
pub struct HttpTransport {
    client: Client,
    cookie_client: Client,
    runtime: Handle,
}

impl HttpTransport {
    /// Creates a transport spawning transfers on `runtime`.
    ///
    /// # Errors
    /// Returns error if an HTTP client cannot be built.
    pub fn new(runtime: Handle) -> DownloadResult<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DownloadError::network(format!("failed to create HTTP client: {e}")))?;
        let cookie_client = Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .build()
            .map_err(|e| DownloadError::network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            cookie_client,
            runtime,
        })
    }

    async fn transfer(client: Client, request: DownloadRequest, delegate: Arc<dyn TransferDelegate>) {
        let mut builder = client.get(request.url.clone()).timeout(request.timeout);
        for (field, value) in &request.headers {
            builder = builder.header(field.as_str(), value.as_str());
        }
        if !request.use_protocol_cache {
            builder = builder.header(CACHE_CONTROL, "no-cache");
        }

        let mut response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                delegate.did_complete(Err(e.into()));
                return;
            }
        };

        let status = response.status().as_u16();
        if delegate.did_receive_response(status, response.content_length()) == ResponseDisposition::Cancel {
            debug!(url = %request.url, status, "Transfer rejected");
            delegate.did_complete(Err(DownloadError::Aborted));
            return;
        }

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => delegate.did_receive_data(&chunk),
                Ok(None) => break,
                Err(e) => {
                    delegate.did_complete(Err(e.into()));
                    return;
                }
            }
        }
        trace!(url = %request.url, "Transfer complete");
        delegate.did_complete(Ok(()));
    }
}

struct SpawnedTransfer(JoinHandle<()>);

impl TransferHandle for SpawnedTransfer {
    fn cancel(&self) {
        self.0.abort();
    }
}

impl NetworkPort for HttpTransport {
    fn start(
        &self,
        request: DownloadRequest,
        delegate: Arc<dyn TransferDelegate>,
    ) -> Box<dyn TransferHandle> {
        let client = if request.handle_cookies {
            self.cookie_client.clone()
        } else {
            self.client.clone()
        };
        Box::new(SpawnedTransfer(
            self.runtime.spawn(Self::transfer(client, request, delegate)),
        ))
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::DownloadOptions;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Event {
        Response(u16, Option<u64>),
        Data(Vec<u8>),
        Complete(DownloadResult<()>),
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    impl TransferDelegate for Recorder {
        fn did_receive_response(&self, status: u16, content_length: Option<u64>) -> ResponseDisposition {
            let _ = self.0.send(Event::Response(status, content_length));
            if status >= 400 {
                ResponseDisposition::Cancel
            } else {
                ResponseDisposition::Allow
            }
        }

        fn did_receive_data(&self, chunk: &[u8]) {
            let _ = self.0.send(Event::Data(chunk.to_vec()));
        }

        fn did_complete(&self, result: DownloadResult<()>) {
            let _ = self.0.send(Event::Complete(result));
        }
    }

    /// Serves one connection with `response` and returns the raw request.
    async fn serve_once(response: &'static [u8]) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_lowercase()
        });
        (format!("http://{addr}/image.gif"), server)
    }

    fn request(url: &str, options: DownloadOptions) -> DownloadRequest {
        let headers = BTreeMap::from([("Accept".to_string(), "image/*;q=0.8".to_string())]);
        DownloadRequest::new(url.parse().unwrap(), options, headers, Duration::from_secs(5))
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let done = matches!(event, Event::Complete(_));
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn test_successful_transfer() {
        let (url, server) =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello").await;
        let transport = HttpTransport::new(Handle::current()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _handle = transport.start(request(&url, DownloadOptions::empty()), Arc::new(Recorder(tx)));
        let events = collect(&mut rx).await;

        assert_eq!(events.first(), Some(&Event::Response(200, Some(5))));
        let body: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                Event::Data(d) => Some(d.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, b"hello");
        assert_eq!(events.last(), Some(&Event::Complete(Ok(()))));

        let raw_request = server.await.unwrap();
        assert!(raw_request.contains("accept: image/*;q=0.8"));
        assert!(raw_request.contains("cache-control: no-cache"));
    }

    #[tokio::test]
    async fn test_protocol_cache_omits_no_cache_header() {
        let (url, server) =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\nConnection: close\r\n\r\nx").await;
        let transport = HttpTransport::new(Handle::current()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _handle = transport.start(
            request(&url, DownloadOptions::USE_EXISTING_CACHE),
            Arc::new(Recorder(tx)),
        );
        collect(&mut rx).await;

        assert!(!server.await.unwrap().contains("cache-control"));
    }

    #[tokio::test]
    async fn test_rejected_response_is_aborted() {
        let (url, _server) = serve_once(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\nConnection: close\r\n\r\nnot found",
        )
        .await;
        let transport = HttpTransport::new(Handle::current()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _handle = transport.start(request(&url, DownloadOptions::empty()), Arc::new(Recorder(tx)));
        let events = collect(&mut rx).await;

        assert_eq!(
            events,
            vec![
                Event::Response(404, Some(9)),
                Event::Complete(Err(DownloadError::Aborted)),
            ]
        );
    }

    #[tokio::test]
    async fn test_connection_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/gone.gif", listener.local_addr().unwrap());
        drop(listener);

        let transport = HttpTransport::new(Handle::current()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = transport.start(request(&url, DownloadOptions::empty()), Arc::new(Recorder(tx)));

        let events = collect(&mut rx).await;
        assert!(matches!(events.as_slice(), [Event::Complete(Err(DownloadError::Network(_)))]));
    }
}
