use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One completed, billed request. Written once, after reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeLog {
    pub user_id: i64,
    pub channel_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub quota: i64,
    /// Rates applied, for display.
    pub content: String,
    pub pre_consumed_quota: i64,
    pub is_stream: bool,
    pub elapsed_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
