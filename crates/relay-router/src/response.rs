use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use relay_provider_core::{DownstreamReceiver, RelayError};

const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";
pub(crate) const REQUEST_ID_HEADER: &str = "x-relay-request-id";

/// Turn the relay task's output into an axum response. Waits for the head;
/// the body streams as the task produces it.
pub(crate) async fn downstream_response(
    receiver: DownstreamReceiver,
    trace_id: &str,
    heartbeat: Duration,
) -> Response {
    let DownstreamReceiver { head, body } = receiver;
    let Ok(head) = head.await else {
        // the relay task ended without answering
        let err = RelayError::Internal("relay task ended without a response".to_string());
        return error_response(&err, trace_id);
    };

    let mut builder = Response::builder().status(head.status);
    if let Some(h) = builder.headers_mut() {
        for (k, v) in head.headers {
            // Hyper sets framing itself.
            if is_hop_by_hop_or_framing_header(&k) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(&v),
            ) {
                h.append(name, value);
            }
        }
        if head.is_sse {
            h.entry(header::CACHE_CONTROL)
                .or_insert(HeaderValue::from_static("no-cache"));
            h.entry(HeaderName::from_static("x-accel-buffering"))
                .or_insert(HeaderValue::from_static("no"));
        }
        if let Ok(value) = HeaderValue::from_str(trace_id) {
            h.insert(REQUEST_ID_HEADER, value);
        }
    }

    let rx = if head.is_sse && !heartbeat.is_zero() {
        wrap_sse_stream_with_heartbeat(body, heartbeat)
    } else {
        body
    };
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    builder.body(Body::from_stream(stream)).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
    })
}

pub(crate) fn error_response(err: &RelayError, trace_id: &str) -> Response {
    let mut resp = Response::new(Body::from(err.to_json_bytes()));
    *resp.status_mut() =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    resp
}

/// Interleave `: keep-alive` comments while the stream is idle.
fn wrap_sse_stream_with_heartbeat(
    mut upstream_rx: mpsc::Receiver<Bytes>,
    interval: Duration,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first heartbeat after a full interval
        ticker.tick().await;

        loop {
            tokio::select! {
                maybe_chunk = upstream_rx.recv() => {
                    let Some(chunk) = maybe_chunk else {
                        break;
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                    ticker.reset();
                }
                _ = ticker.tick() => {
                    if tx.send(Bytes::from_static(SSE_HEARTBEAT_FRAME)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}
