use relay_provider_core::AdaptorRegistry;

use crate::providers::anthropic::AnthropicAdaptor;
use crate::providers::gemini::GeminiAdaptor;
use crate::providers::openai::{OpenAIAdaptor, OpenAIVariant};
use crate::providers::proxy::ProxyAdaptor;

/// Register every built-in vendor under its channel-type key.
pub fn register_builtin_adaptors(registry: &mut AdaptorRegistry) {
    registry.register("openai", || Box::new(OpenAIAdaptor::new(OpenAIVariant::OpenAI)));
    registry.register("azure", || Box::new(OpenAIAdaptor::new(OpenAIVariant::Azure)));
    registry.register("openrouter", || {
        Box::new(OpenAIAdaptor::new(OpenAIVariant::OpenRouter))
    });
    registry.register("anthropic", || Box::new(AnthropicAdaptor::new()));
    registry.register("gemini", || Box::new(GeminiAdaptor::new()));
    registry.register("proxy", || Box::new(ProxyAdaptor::new()));
}
