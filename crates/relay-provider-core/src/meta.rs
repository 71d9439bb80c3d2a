use serde::{Deserialize, Serialize};

use crate::mode::RelayMode;

/// Per-channel knobs some vendors need.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Azure `api-version`, Gemini API version (`v1beta` when absent).
    pub api_version: Option<String>,
    /// OpenRouter `HTTP-Referer`.
    pub site_url: Option<String>,
    /// OpenRouter `X-Title`.
    pub site_name: Option<String>,
}

/// Per-request context built by the orchestrator for one attempt.
///
/// Adaptors only read it.
#[derive(Debug, Clone)]
pub struct Meta {
    pub trace_id: String,
    pub mode: RelayMode,
    pub channel_id: i64,
    pub channel_name: String,
    /// Registry key of the vendor adaptor (`openai`, `azure`, `anthropic`, ...).
    pub channel_type: String,
    pub channel_config: ChannelConfig,
    pub token_id: i64,
    pub token_name: String,
    pub user_id: i64,
    pub group: String,
    /// Model name the client asked for; billing uses it.
    pub origin_model: String,
    /// Model name after channel mapping; dispatch uses it.
    pub actual_model: String,
    pub base_url: String,
    pub api_key: String,
    pub is_stream: bool,
    /// The client asked for a trailing usage chunk.
    pub include_usage: bool,
    pub prompt_tokens: u64,
    /// Inbound path (without query).
    pub request_path: String,
    pub request_query: Option<String>,
}

impl Meta {
    pub fn new(trace_id: impl Into<String>, mode: RelayMode) -> Self {
        Self {
            trace_id: trace_id.into(),
            mode,
            channel_id: 0,
            channel_name: String::new(),
            channel_type: String::new(),
            channel_config: ChannelConfig::default(),
            token_id: 0,
            token_name: String::new(),
            user_id: 0,
            group: String::new(),
            origin_model: String::new(),
            actual_model: String::new(),
            base_url: String::new(),
            api_key: String::new(),
            is_stream: false,
            include_usage: false,
            prompt_tokens: 0,
            request_path: String::new(),
            request_query: None,
        }
    }

    /// `base_url` without a trailing slash.
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}
