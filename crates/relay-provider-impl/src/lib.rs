//! Built-in vendor adaptors.
//!
//! This crate does not perform network IO. Adaptors build `UpstreamHttpRequest`s
//! and translate the responses handed back by the orchestrator's client.

mod auth_extractor;
mod providers;
mod registry;
mod tokenizer;

pub use providers::anthropic::AnthropicAdaptor;
pub use providers::gemini::GeminiAdaptor;
pub use providers::openai::{OpenAIAdaptor, OpenAIVariant};
pub use providers::proxy::ProxyAdaptor;
pub use registry::register_builtin_adaptors;
pub use tokenizer::TiktokenEstimator;
