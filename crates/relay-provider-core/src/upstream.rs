use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};

use crate::headers::{Headers, header_get};

/// Streaming body chunks. A read failure is delivered in-band so the consumer
/// can tell a broken connection from a clean end of stream.
pub type ByteStream = tokio::sync::mpsc::Receiver<Result<Bytes, UpstreamFailure>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn parse(method: &str) -> Option<Self> {
        if method.eq_ignore_ascii_case("GET") {
            Some(HttpMethod::Get)
        } else if method.eq_ignore_ascii_case("POST") {
            Some(HttpMethod::Post)
        } else if method.eq_ignore_ascii_case("PUT") {
            Some(HttpMethod::Put)
        } else if method.eq_ignore_ascii_case("PATCH") {
            Some(HttpMethod::Patch)
        } else if method.eq_ignore_ascii_case("DELETE") {
            Some(HttpMethod::Delete)
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

impl UpstreamBody {
    /// Drain the body into memory. Used for error bodies and non-stream replies.
    pub async fn collect(self) -> Result<Bytes, UpstreamFailure> {
        match self {
            UpstreamBody::Bytes(bytes) => Ok(bytes),
            UpstreamBody::Stream(mut rx) => {
                let mut out = BytesMut::new();
                while let Some(item) = rx.recv().await {
                    out.extend_from_slice(&item?);
                }
                Ok(out.freeze())
            }
        }
    }
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpstreamTransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

impl UpstreamTransportErrorKind {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            UpstreamTransportErrorKind::Timeout | UpstreamTransportErrorKind::ReadTimeout
        )
    }
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// Transport-level failures (no HTTP response, or the body broke off).
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    /// HTTP error response captured as bytes.
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
}

impl UpstreamFailure {
    pub fn transport(kind: UpstreamTransportErrorKind, message: impl Into<String>) -> Self {
        UpstreamFailure::Transport {
            kind,
            message: message.into(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            UpstreamFailure::Transport { message, .. } => message.clone(),
            UpstreamFailure::Http { status, .. } => format!("upstream status {status}"),
        }
    }
}

/// The only IO seam between the relay and the network.
///
/// Adaptors build `UpstreamHttpRequest`s; a concrete client (or a fake in tests)
/// performs them.
pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;
}

/// `Retry-After` as delta-seconds or an HTTP-date.
pub fn parse_retry_after(headers: &Headers) -> Option<Duration> {
    let value = header_get(headers, "retry-after")?.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_seconds() {
        let headers: Headers = vec![("Retry-After".to_string(), "12".to_string())];
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
    }

    #[test]
    fn retry_after_past_http_date_is_zero() {
        let headers: Headers = vec![(
            "retry-after".to_string(),
            "Sun, 06 Nov 1994 08:49:37 GMT".to_string(),
        )];
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn retry_after_future_http_date() {
        let at = SystemTime::now() + Duration::from_secs(120);
        let headers: Headers = vec![("retry-after".to_string(), httpdate::fmt_http_date(at))];
        let wait = parse_retry_after(&headers).expect("duration");
        assert!(wait > Duration::from_secs(100) && wait <= Duration::from_secs(120));
    }

    #[tokio::test]
    async fn collect_surfaces_read_errors() {
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"ab"))).await.expect("send");
        tx.send(Err(UpstreamFailure::transport(
            UpstreamTransportErrorKind::ReadTimeout,
            "idle",
        )))
        .await
        .expect("send");
        drop(tx);
        let err = UpstreamBody::Stream(rx).collect().await.expect_err("broken");
        assert!(matches!(err, UpstreamFailure::Transport { .. }));
    }
}
