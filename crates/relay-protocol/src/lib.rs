//! Wire types spoken by the relay.
//!
//! `openai` is the canonical protocol exposed to clients. `claude` and `gemini`
//! hold the vendor shapes the built-in adaptors translate to and from.

pub mod claude;
pub mod gemini;
pub mod openai;
pub mod sse;

/// Current unix time in seconds, used for `created` fields.
pub fn now_unix_seconds() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
