use relay_protocol::openai::create_chat_completions::types::{
    FunctionCall, ToolCall, ToolCallDelta, Usage,
};

#[derive(Debug, Clone, Default)]
struct PartialToolCall {
    choice: u32,
    index: u32,
    id: String,
    kind: String,
    name: String,
    arguments: String,
    flushed: bool,
}

/// Reassembles streamed tool calls. Fragments are keyed by (choice, index) and
/// appended in arrival order.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: Vec<PartialToolCall>,
}

impl ToolCallAccumulator {
    pub fn push(&mut self, choice: u32, delta: &ToolCallDelta) {
        let pos = match self
            .calls
            .iter()
            .position(|call| call.choice == choice && call.index == delta.index)
        {
            Some(pos) => pos,
            None => {
                self.calls.push(PartialToolCall {
                    choice,
                    index: delta.index,
                    kind: "function".to_string(),
                    ..PartialToolCall::default()
                });
                self.calls.len() - 1
            }
        };
        let call = &mut self.calls[pos];
        if let Some(id) = delta.id.as_deref().filter(|id| !id.is_empty()) {
            call.id = id.to_string();
        }
        if let Some(kind) = delta.kind.as_deref().filter(|kind| !kind.is_empty()) {
            call.kind = kind.to_string();
        }
        if let Some(function) = &delta.function {
            if let Some(name) = function.name.as_deref() {
                call.name.push_str(name);
            }
            if let Some(arguments) = function.arguments.as_deref() {
                call.arguments.push_str(arguments);
            }
        }
    }

    /// Calls of `choice` whose argument buffer is still empty. They are marked
    /// as `{}` so a second flush yields nothing.
    pub fn flush_empty(&mut self, choice: Option<u32>) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        for call in &mut self.calls {
            if choice.is_some_and(|choice| choice != call.choice) || call.flushed {
                continue;
            }
            call.flushed = true;
            if call.arguments.is_empty() {
                call.arguments.push_str("{}");
                out.push((call.choice, call.index));
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.calls
            .iter()
            .map(|call| ToolCall {
                id: call.id.clone(),
                kind: call.kind.clone(),
                function: FunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            })
            .collect()
    }
}

/// Merges usage seen anywhere in a stream; each field keeps its largest value.
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    usage: Option<Usage>,
}

impl UsageAccumulator {
    pub fn merge(&mut self, seen: &Usage) {
        let usage = self.usage.get_or_insert_with(Usage::default);
        usage.prompt_tokens = usage.prompt_tokens.max(seen.prompt_tokens);
        usage.completion_tokens = usage.completion_tokens.max(seen.completion_tokens);
        usage.total_tokens = usage.total_tokens.max(seen.total_tokens);
    }

    pub fn observed(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::openai::create_chat_completions::types::FunctionCallDelta;

    fn fragment(index: u32, id: Option<&str>, name: Option<&str>, args: &str) -> ToolCallDelta {
        ToolCallDelta {
            index,
            id: id.map(str::to_string),
            kind: id.map(|_| "function".to_string()),
            function: Some(FunctionCallDelta {
                name: name.map(str::to_string),
                arguments: Some(args.to_string()),
            }),
        }
    }

    #[test]
    fn three_fragments_reassemble_in_arrival_order() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(0, &fragment(0, Some("call_1"), Some("lookup"), "{\"a\""));
        acc.push(0, &fragment(0, None, None, ":1"));
        acc.push(0, &fragment(0, None, None, "}"));
        let calls = acc.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "lookup");
        assert_eq!(calls[0].function.arguments, "{\"a\":1}");
    }

    #[test]
    fn interleaved_indexes_stay_separate() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(0, &fragment(0, Some("a"), Some("f"), "{\"x\":"));
        acc.push(0, &fragment(1, Some("b"), Some("g"), "{"));
        acc.push(0, &fragment(0, None, None, "1}"));
        acc.push(0, &fragment(1, None, None, "}"));
        let calls = acc.tool_calls();
        assert_eq!(calls[0].function.arguments, "{\"x\":1}");
        assert_eq!(calls[1].function.arguments, "{}");
    }

    #[test]
    fn empty_arguments_flush_once_as_empty_object() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(0, &fragment(0, Some("a"), Some("now"), ""));
        assert_eq!(acc.flush_empty(Some(0)), vec![(0, 0)]);
        assert!(acc.flush_empty(None).is_empty());
        assert_eq!(acc.tool_calls()[0].function.arguments, "{}");
    }

    #[test]
    fn usage_merges_by_max() {
        let mut acc = UsageAccumulator::default();
        acc.merge(&Usage {
            prompt_tokens: 10,
            completion_tokens: 1,
            total_tokens: 0,
        });
        acc.merge(&Usage {
            prompt_tokens: 0,
            completion_tokens: 42,
            total_tokens: 0,
        });
        let usage = acc.observed().expect("usage");
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 42);
    }
}
