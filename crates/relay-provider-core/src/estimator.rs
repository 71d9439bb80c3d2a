use relay_protocol::openai::create_chat_completions::types::{ChatMessage, ContentPart};

/// Every message carries `<|start|>{role}\n{content}<|end|>\n`.
pub const TOKENS_PER_MESSAGE: u64 = 3;
pub const TOKENS_PER_NAME: u64 = 1;
/// Every reply is primed with `<|start|>assistant<|message|>`.
pub const TOKENS_PER_REPLY: u64 = 3;
/// Flat charge for an image part (low-detail tile).
pub const TOKENS_PER_IMAGE: u64 = 85;

/// Approximate token counting, used whenever a vendor does not report usage.
pub trait TokenEstimator: Send + Sync {
    fn count_text(&self, text: &str, model: &str) -> u64;

    fn count_messages(&self, messages: &[ChatMessage], model: &str) -> u64 {
        let mut total = 0;
        for message in messages {
            total += TOKENS_PER_MESSAGE;
            total += self.count_text(&message.role, model);
            if let Some(content) = &message.content {
                for part in content.parts() {
                    match part {
                        ContentPart::Text { text } => total += self.count_text(&text, model),
                        ContentPart::ImageUrl { .. } => total += TOKENS_PER_IMAGE,
                    }
                }
            }
            if let Some(name) = &message.name {
                total += TOKENS_PER_NAME + self.count_text(name, model);
            }
        }
        total + TOKENS_PER_REPLY
    }
}
