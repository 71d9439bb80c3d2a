//! Upstream failures to a failure class and a channel-health verdict.

use std::fmt;
use std::time::Duration;

use relay_protocol::openai::error::ErrorBody;
use relay_provider_core::{AdaptorError, ChannelHealth, RelayError};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

const DISABLING_TYPES: &[&str] = &[
    "insufficient_quota",
    "authentication_error",
    "permission_error",
    "forbidden",
];

const DISABLING_CODES: &[&str] = &["invalid_api_key", "account_deactivated"];

const DISABLING_MESSAGES: &[&str] = &[
    "credit balance is too low",
    "organization has been disabled",
    "credit",
    "balance",
    "access denied",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    AuthenticationFailure,
    InsufficientUpstreamCredit,
    RateLimited,
    InvalidRequest,
    UpstreamInternalError,
    TransportError,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::AuthenticationFailure => "authentication_failure",
            FailureClass::InsufficientUpstreamCredit => "insufficient_upstream_credit",
            FailureClass::RateLimited => "rate_limited",
            FailureClass::InvalidRequest => "invalid_request",
            FailureClass::UpstreamInternalError => "upstream_internal_error",
            FailureClass::TransportError => "transport_error",
        }
    }

    /// Another channel may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureClass::InvalidRequest)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class of a failed attempt. Errors that never reached the upstream
/// (adaptor conversion, channel config) count as the request's fault or the
/// gateway's, never the channel's credentials.
pub fn classify(error: &RelayError) -> FailureClass {
    match error {
        RelayError::Transport { .. } => FailureClass::TransportError,
        RelayError::Upstream { status, error, .. } => {
            let message = error.message.to_ascii_lowercase();
            if error.r#type.eq_ignore_ascii_case("insufficient_quota")
                || message.contains("credit")
                || message.contains("balance")
            {
                FailureClass::InsufficientUpstreamCredit
            } else if *status == 401 || *status == 403 || names_bad_credential(error) {
                FailureClass::AuthenticationFailure
            } else if *status == 429 {
                FailureClass::RateLimited
            } else if *status >= 500 || (200..300).contains(status) {
                FailureClass::UpstreamInternalError
            } else {
                FailureClass::InvalidRequest
            }
        }
        RelayError::Adaptor(AdaptorError::InvalidRequest(_)) | RelayError::InvalidRequest { .. } => {
            FailureClass::InvalidRequest
        }
        _ => FailureClass::UpstreamInternalError,
    }
}

fn names_bad_credential(error: &ErrorBody) -> bool {
    let r#type = error.r#type.to_ascii_lowercase();
    let code = error.code_str().unwrap_or_default().to_ascii_lowercase();
    let message = error.message.to_ascii_lowercase();
    DISABLING_TYPES.contains(&r#type.as_str())
        || DISABLING_CODES.contains(&code.as_str())
        || DISABLING_MESSAGES.iter().any(|needle| message.contains(needle))
}

/// Whether the upstream answer says the channel credential itself is unusable.
pub fn should_disable(error: &RelayError) -> bool {
    match error {
        RelayError::Upstream { status, error, .. } => *status == 401 || names_bad_credential(error),
        _ => false,
    }
}

/// Feedback for the channel registry, `None` when the channel is not at fault.
pub fn channel_health(class: FailureClass, error: &RelayError) -> Option<ChannelHealth> {
    if should_disable(error) {
        return Some(ChannelHealth::Disable {
            reason: error.to_string(),
        });
    }
    match class {
        FailureClass::RateLimited => {
            let wait = match error {
                RelayError::Upstream {
                    retry_after: Some(wait),
                    ..
                } => *wait,
                _ => DEFAULT_COOLDOWN,
            };
            Some(ChannelHealth::Cooldown(wait))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_provider_core::UpstreamTransportErrorKind;

    fn upstream(status: u16, r#type: &str, code: Option<&str>, message: &str) -> RelayError {
        let mut error = ErrorBody::new(message, r#type);
        if let Some(code) = code {
            error = error.with_code(code);
        }
        RelayError::Upstream {
            status,
            error,
            retry_after: None,
        }
    }

    #[test]
    fn credentials_and_credit_disable_the_channel() {
        let bad_key = upstream(401, "invalid_request_error", Some("invalid_api_key"), "Incorrect API key");
        assert_eq!(classify(&bad_key), FailureClass::AuthenticationFailure);
        assert!(matches!(
            channel_health(classify(&bad_key), &bad_key),
            Some(ChannelHealth::Disable { .. })
        ));

        let broke = upstream(400, "invalid_request_error", None, "Your credit balance is too low");
        assert_eq!(classify(&broke), FailureClass::InsufficientUpstreamCredit);
        assert!(should_disable(&broke));

        let deactivated = upstream(403, "", Some("account_deactivated"), "gone");
        assert!(should_disable(&deactivated));
    }

    #[test]
    fn rate_limit_cools_down_without_disabling() {
        let mut limited = upstream(429, "rate_limit_error", None, "slow down");
        assert_eq!(classify(&limited), FailureClass::RateLimited);
        assert_eq!(
            channel_health(FailureClass::RateLimited, &limited),
            Some(ChannelHealth::Cooldown(DEFAULT_COOLDOWN))
        );
        if let RelayError::Upstream { retry_after, .. } = &mut limited {
            *retry_after = Some(Duration::from_secs(7));
        }
        assert_eq!(
            channel_health(FailureClass::RateLimited, &limited),
            Some(ChannelHealth::Cooldown(Duration::from_secs(7)))
        );
    }

    #[test]
    fn transport_and_server_errors_leave_the_channel_alone() {
        let timeout = RelayError::Transport {
            kind: UpstreamTransportErrorKind::Timeout,
            message: "deadline".to_string(),
        };
        assert_eq!(classify(&timeout), FailureClass::TransportError);
        assert_eq!(channel_health(FailureClass::TransportError, &timeout), None);

        let overloaded = upstream(503, "server_error", None, "overloaded");
        assert_eq!(classify(&overloaded), FailureClass::UpstreamInternalError);
        assert!(classify(&overloaded).is_retryable());
    }

    #[test]
    fn client_mistakes_are_not_retried() {
        let bad = upstream(400, "invalid_request_error", None, "messages: field required");
        assert_eq!(classify(&bad), FailureClass::InvalidRequest);
        assert!(!classify(&bad).is_retryable());
        let conversion = RelayError::Adaptor(AdaptorError::InvalidRequest("no tool id".into()));
        assert_eq!(classify(&conversion), FailureClass::InvalidRequest);
    }
}
