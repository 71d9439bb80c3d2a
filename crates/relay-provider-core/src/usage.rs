use relay_protocol::openai::create_chat_completions::types::Usage;

use crate::estimator::TokenEstimator;

/// Final usage for billing.
///
/// Vendor numbers are trusted when they exist. Missing or all-zero usage is
/// estimated from the prompt count and the completion text; a vendor that
/// reports completion but not prompt gets the prompt filled in.
pub fn finalize_usage(
    observed: Option<&Usage>,
    prompt_tokens: u64,
    completion_text: &str,
    estimator: &dyn TokenEstimator,
    model: &str,
) -> Usage {
    match observed {
        Some(usage) if usage.total_tokens > 0 || usage.completion_tokens > 0 => {
            let prompt = if usage.prompt_tokens == 0 {
                prompt_tokens
            } else {
                usage.prompt_tokens
            };
            Usage::new(prompt, usage.completion_tokens)
        }
        _ => Usage::new(prompt_tokens, estimator.count_text(completion_text, model)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CharsEstimator;

    impl TokenEstimator for CharsEstimator {
        fn count_text(&self, text: &str, _model: &str) -> u64 {
            text.chars().count() as u64
        }
    }

    #[test]
    fn missing_usage_is_estimated() {
        let usage = finalize_usage(None, 10, "hello", &CharsEstimator, "m");
        assert_eq!(usage, Usage::new(10, 5));
        let zero = Usage::default();
        let usage = finalize_usage(Some(&zero), 10, "", &CharsEstimator, "m");
        assert_eq!(usage, Usage::new(10, 0));
    }

    #[test]
    fn prompt_is_filled_when_vendor_omits_it() {
        let observed = Usage {
            prompt_tokens: 0,
            completion_tokens: 7,
            total_tokens: 7,
        };
        let usage = finalize_usage(Some(&observed), 12, "ignored", &CharsEstimator, "m");
        assert_eq!(usage, Usage::new(12, 7));
    }

    #[test]
    fn total_is_recomputed_from_parts() {
        let observed = Usage {
            prompt_tokens: 3,
            completion_tokens: 4,
            total_tokens: 99,
        };
        assert_eq!(
            finalize_usage(Some(&observed), 0, "", &CharsEstimator, "m").total_tokens,
            7
        );
    }
}
