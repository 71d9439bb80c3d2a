use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use relay_protocol::sse::{sse_data_bytes, sse_done_bytes};

use crate::headers::{Headers, header_set};
use crate::relay_error::RelayError;

const BODY_CHANNEL_CAPACITY: usize = 32;

/// Status and headers of the client response, sent exactly once.
#[derive(Debug, Clone)]
pub struct DownstreamHead {
    pub status: u16,
    pub headers: Headers,
    pub is_sse: bool,
}

/// The receiving side of `Downstream`, held by the HTTP layer.
#[derive(Debug)]
pub struct DownstreamReceiver {
    pub head: oneshot::Receiver<DownstreamHead>,
    pub body: mpsc::Receiver<Bytes>,
}

/// Returned when the client connection is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientGone;

/// Writer for the client response.
///
/// The relay task owns it; the HTTP layer owns the matching receiver. Once the
/// head is sent the response is committed: no retry, no second status.
#[derive(Debug)]
pub struct Downstream {
    head: Option<oneshot::Sender<DownstreamHead>>,
    body: mpsc::Sender<Bytes>,
    bytes_sent: usize,
}

impl Downstream {
    pub fn channel() -> (Downstream, DownstreamReceiver) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        (
            Downstream {
                head: Some(head_tx),
                body: body_tx,
                bytes_sent: 0,
            },
            DownstreamReceiver {
                head: head_rx,
                body: body_rx,
            },
        )
    }

    /// Whether the status line has been committed.
    pub fn is_started(&self) -> bool {
        self.head.is_none()
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn is_closed(&self) -> bool {
        self.body.is_closed()
    }

    /// Resolves once the client has dropped the receiving side.
    pub async fn closed(&self) {
        self.body.closed().await
    }

    pub fn start(&mut self, status: u16, headers: Headers) -> Result<(), ClientGone> {
        self.send_head(DownstreamHead {
            status,
            headers,
            is_sse: false,
        })
    }

    pub fn start_sse(&mut self) -> Result<(), ClientGone> {
        let mut headers = Headers::new();
        header_set(&mut headers, "content-type", "text/event-stream");
        self.send_head(DownstreamHead {
            status: 200,
            headers,
            is_sse: true,
        })
    }

    fn send_head(&mut self, head: DownstreamHead) -> Result<(), ClientGone> {
        match self.head.take() {
            Some(tx) => tx.send(head).map_err(|_| ClientGone),
            None => Ok(()),
        }
    }

    /// Forward one body chunk; waits while the client is slower than upstream.
    pub async fn send(&mut self, bytes: Bytes) -> Result<(), ClientGone> {
        let len = bytes.len();
        self.body.send(bytes).await.map_err(|_| ClientGone)?;
        self.bytes_sent += len;
        Ok(())
    }

    /// Complete non-stream reply.
    pub async fn respond(
        &mut self,
        status: u16,
        headers: Headers,
        body: Bytes,
    ) -> Result<(), ClientGone> {
        self.start(status, headers)?;
        if body.is_empty() {
            return Ok(());
        }
        self.send(body).await
    }

    pub async fn respond_json(&mut self, status: u16, body: Bytes) -> Result<(), ClientGone> {
        let mut headers = Headers::new();
        header_set(&mut headers, "content-type", "application/json");
        self.respond(status, headers, body).await
    }

    /// Report `error` to the client in whatever form the response still allows:
    /// a JSON error with its status before the head is sent, or an error frame
    /// plus `[DONE]` on a stream already in flight.
    pub async fn fail(&mut self, error: &RelayError) -> Result<(), ClientGone> {
        if !self.is_started() {
            return self.respond_json(error.status(), error.to_json_bytes()).await;
        }
        let payload = String::from_utf8_lossy(&error.to_json_bytes()).into_owned();
        self.send(sse_data_bytes(&payload)).await?;
        self.send(sse_done_bytes()).await
    }
}
