use std::time::Duration;

use bytes::Bytes;

use relay_protocol::openai::error::ErrorBody;

use crate::errors::AdaptorError;
use crate::upstream::{UpstreamFailure, UpstreamTransportErrorKind};

pub const RELAY_ERROR_TYPE: &str = "relay_error";
pub const UPSTREAM_ERROR_TYPE: &str = "upstream_error";

/// Everything that can end a relay with an error response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    /// The canonical request failed validation. Nothing was reserved.
    #[error("{message}")]
    InvalidRequest { code: &'static str, message: String },
    /// Pre-consumption refused the reservation. No upstream call was made.
    #[error("{message}")]
    InsufficientQuota { code: &'static str, message: String },
    #[error("get user quota failed: {0}")]
    QuotaStore(String),
    #[error("no available channel for model {model} under group {group}")]
    NoAvailableChannel { group: String, model: String },
    #[error("upstream transport error: {message}")]
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    /// The upstream answered with a structured error, already normalized.
    #[error("upstream error ({status}): {}", error.message)]
    Upstream {
        status: u16,
        error: ErrorBody,
        retry_after: Option<Duration>,
    },
    #[error("{0}")]
    Adaptor(#[from] AdaptorError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn invalid_request(code: &'static str, message: impl Into<String>) -> Self {
        RelayError::InvalidRequest {
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            RelayError::InvalidRequest { .. } => 400,
            RelayError::InsufficientQuota { .. } => 403,
            RelayError::QuotaStore(_) => 500,
            RelayError::NoAvailableChannel { .. } => 503,
            RelayError::Transport { kind, .. } => {
                if kind.is_timeout() {
                    504
                } else {
                    502
                }
            }
            RelayError::Upstream { status, .. } => *status,
            RelayError::Adaptor(err) => match err {
                AdaptorError::InvalidRequest(_) => 400,
                AdaptorError::NotImplemented(_) => 501,
                AdaptorError::InvalidChannelConfig(_) | AdaptorError::Other(_) => 500,
            },
            RelayError::Internal(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest { code, .. } => code,
            RelayError::InsufficientQuota { code, .. } => code,
            RelayError::QuotaStore(_) => "get_user_quota_failed",
            RelayError::NoAvailableChannel { .. } => "no_available_channel",
            RelayError::Transport { kind, .. } => {
                if kind.is_timeout() {
                    "upstream_timeout"
                } else {
                    "do_request_failed"
                }
            }
            RelayError::Upstream { .. } => "bad_response_status_code",
            RelayError::Adaptor(err) => match err {
                AdaptorError::InvalidRequest(_) => "convert_request_failed",
                AdaptorError::NotImplemented(_) => "not_implemented",
                AdaptorError::InvalidChannelConfig(_) => "invalid_channel_config",
                AdaptorError::Other(_) => "adaptor_error",
            },
            RelayError::Internal(_) => "internal_error",
        }
    }

    /// The canonical `error` object sent to the client.
    pub fn to_error_body(&self) -> ErrorBody {
        match self {
            RelayError::Upstream { error, .. } => error.clone(),
            other => ErrorBody::new(other.to_string(), RELAY_ERROR_TYPE).with_code(other.code()),
        }
    }

    pub fn to_json_bytes(&self) -> Bytes {
        let envelope = self.to_error_body().into_response();
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .unwrap_or_else(|_| Bytes::from_static(b"{\"error\":{\"message\":\"internal error\",\"type\":\"relay_error\"}}"))
    }

    /// True when the failure happened on the way to or from the upstream.
    pub fn is_upstream_side(&self) -> bool {
        matches!(
            self,
            RelayError::Transport { .. } | RelayError::Upstream { .. }
        )
    }
}

impl From<UpstreamFailure> for RelayError {
    fn from(failure: UpstreamFailure) -> Self {
        match failure {
            UpstreamFailure::Transport { kind, message } => RelayError::Transport { kind, message },
            UpstreamFailure::Http {
                status,
                headers,
                body,
            } => crate::normalize::upstream_error(status, &headers, &body),
        }
    }
}
