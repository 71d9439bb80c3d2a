//! Upstream error bodies to the canonical error object.
//!
//! Vendors disagree on where the message lives. The extractors below are tried
//! in order and the first one that finds a non-empty message wins.

use bytes::Bytes;
use serde_json::Value as JsonValue;

use relay_protocol::openai::error::ErrorBody;

use crate::headers::{Headers, is_json_content_type};
use crate::relay_error::{RelayError, UPSTREAM_ERROR_TYPE};
use crate::upstream::{UpstreamHttpResponse, parse_retry_after};

pub const BAD_STATUS_CODE: &str = "bad_response_status_code";

type Extractor = fn(&JsonValue) -> Option<ErrorBody>;

/// Ordered: OpenAI shape first, then the loose field names, most specific first.
pub const ERROR_EXTRACTORS: &[(&str, Extractor)] = &[
    ("error_object", error_object),
    ("message", message_field),
    ("msg", msg_field),
    ("err", err_field),
    ("error_msg", error_msg_field),
    ("error_string", error_string_field),
    ("header_message", header_message),
    ("response_error", response_error_message),
    ("detail", detail_field),
    ("errors_list", errors_list),
];

/// `{"error": {"message", "type", "code", "param"}}`; Anthropic and Gemini share it.
fn error_object(value: &JsonValue) -> Option<ErrorBody> {
    let error = value.get("error")?.as_object()?;
    let message = error.get("message")?.as_str()?.trim();
    if message.is_empty() {
        return None;
    }
    let r#type = error
        .get("type")
        .or_else(|| error.get("status"))
        .and_then(JsonValue::as_str)
        .unwrap_or("")
        .to_string();
    let param = match error.get("param") {
        Some(JsonValue::String(param)) => Some(param.clone()),
        Some(JsonValue::Number(param)) => Some(param.to_string()),
        _ => None,
    };
    let code = error.get("code").filter(|code| !code.is_null()).cloned();
    Some(ErrorBody {
        message: message.to_string(),
        r#type,
        param,
        code,
    })
}

fn message_field(value: &JsonValue) -> Option<ErrorBody> {
    nested_str(value, &["message"])
}

fn msg_field(value: &JsonValue) -> Option<ErrorBody> {
    nested_str(value, &["msg"])
}

fn err_field(value: &JsonValue) -> Option<ErrorBody> {
    nested_str(value, &["err"])
}

fn error_msg_field(value: &JsonValue) -> Option<ErrorBody> {
    nested_str(value, &["error_msg"])
}

fn error_string_field(value: &JsonValue) -> Option<ErrorBody> {
    nested_str(value, &["error"])
}

fn header_message(value: &JsonValue) -> Option<ErrorBody> {
    nested_str(value, &["header", "message"])
}

fn response_error_message(value: &JsonValue) -> Option<ErrorBody> {
    nested_str(value, &["response", "error", "message"])
}

fn detail_field(value: &JsonValue) -> Option<ErrorBody> {
    nested_str(value, &["detail"])
}

fn nested_str(value: &JsonValue, path: &[&str]) -> Option<ErrorBody> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(*key)?;
    }
    let message = cursor.as_str()?.trim();
    if message.is_empty() {
        return None;
    }
    Some(ErrorBody::new(message, ""))
}

/// Cloudflare: `{"errors": [{"message": "..."}]}`.
fn errors_list(value: &JsonValue) -> Option<ErrorBody> {
    let first = value.get("errors")?.as_array()?.first()?;
    let message = first.get("message")?.as_str()?.trim();
    if message.is_empty() {
        return None;
    }
    let mut body = ErrorBody::new(message, "");
    body.code = first.get("code").cloned();
    Some(body)
}

/// Best-effort normalization; always yields a complete body.
pub fn normalize_error_body(status: u16, body: &[u8]) -> ErrorBody {
    let extracted = serde_json::from_slice::<JsonValue>(body)
        .ok()
        .and_then(|value| {
            ERROR_EXTRACTORS
                .iter()
                .find_map(|(_, extract)| extract(&value))
        });
    let mut error = extracted
        .unwrap_or_else(|| ErrorBody::new(format!("bad response status code {status}"), ""));
    if error.r#type.is_empty() {
        error.r#type = UPSTREAM_ERROR_TYPE.to_string();
    }
    if error.code.is_none() {
        error.code = Some(JsonValue::String(BAD_STATUS_CODE.to_string()));
    }
    if error.param.is_none() {
        error.param = Some(status.to_string());
    }
    error
}

/// Normalized upstream error. A 2xx that still counts as an error (JSON answer
/// to a stream request) is reported as 502.
pub fn upstream_error(status: u16, headers: &Headers, body: &[u8]) -> RelayError {
    RelayError::Upstream {
        status: if (200..300).contains(&status) { 502 } else { status },
        error: normalize_error_body(status, body),
        retry_after: parse_retry_after(headers),
    }
}

/// Non-2xx, or a JSON reply where an event stream was requested.
pub fn is_error_response(status: u16, headers: &Headers, is_stream: bool) -> bool {
    if !(200..300).contains(&status) {
        return true;
    }
    is_stream && is_json_content_type(headers)
}

/// Pass successful responses through; turn error responses into a normalized
/// `RelayError::Upstream`. Adaptors call this first in `do_response`.
pub async fn check_upstream_response(
    response: UpstreamHttpResponse,
    is_stream: bool,
) -> Result<UpstreamHttpResponse, RelayError> {
    if !is_error_response(response.status, &response.headers, is_stream) {
        return Ok(response);
    }
    let UpstreamHttpResponse {
        status,
        headers,
        body,
    } = response;
    let body: Bytes = body.collect().await?;
    Err(upstream_error(status, &headers, &body))
}
