use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Canonical error envelope: `{"error": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type", default)]
    pub r#type: String,
    #[serde(default)]
    pub param: Option<String>,
    /// A string for relay errors; vendors sometimes send numbers.
    #[serde(default)]
    pub code: Option<JsonValue>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>, r#type: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            r#type: r#type.into(),
            param: None,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(JsonValue::String(code.into()));
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn code_str(&self) -> Option<String> {
        match &self.code {
            Some(JsonValue::String(code)) => Some(code.clone()),
            Some(JsonValue::Number(code)) => Some(code.to_string()),
            _ => None,
        }
    }

    pub fn into_response(self) -> ErrorResponse {
        ErrorResponse { error: self }
    }
}
