use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use relay_protocol::openai::create_chat_completions::types::Usage;
use relay_provider_core::{
    Adaptor, Downstream, DownstreamReceiver, Meta, RelayError, RelayMode, TokenEstimator,
    UpstreamBody, UpstreamHttpResponse,
};
use relay_provider_impl::{AnthropicAdaptor, GeminiAdaptor, OpenAIAdaptor, OpenAIVariant};

struct WordEstimator;

impl TokenEstimator for WordEstimator {
    fn count_text(&self, text: &str, _model: &str) -> u64 {
        text.split_whitespace().count() as u64
    }
}

fn meta(model: &str, include_usage: bool) -> Meta {
    let mut meta = Meta::new("trace-s", RelayMode::ChatCompletions);
    meta.origin_model = model.to_string();
    meta.actual_model = model.to_string();
    meta.is_stream = true;
    meta.include_usage = include_usage;
    meta.prompt_tokens = 4;
    meta
}

/// Feed `parts` as separate reads, the way a slow upstream would.
fn streamed(content_type: &str, parts: &[&str]) -> UpstreamHttpResponse {
    let (tx, rx) = mpsc::channel(parts.len().max(1));
    for part in parts {
        tx.try_send(Ok(Bytes::from(part.to_string())))
            .expect("buffered");
    }
    drop(tx);
    UpstreamHttpResponse {
        status: 200,
        headers: vec![("content-type".to_string(), content_type.to_string())],
        body: UpstreamBody::Stream(rx),
    }
}

async fn frames(mut rx: DownstreamReceiver) -> Vec<String> {
    let mut body = String::new();
    while let Some(bytes) = rx.body.recv().await {
        body.push_str(&String::from_utf8_lossy(&bytes));
    }
    body.split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}

fn content_of(frames: &[String]) -> String {
    frames
        .iter()
        .filter_map(|frame| serde_json::from_str::<JsonValue>(frame).ok())
        .filter_map(|chunk| {
            chunk["choices"][0]["delta"]["content"]
                .as_str()
                .map(str::to_string)
        })
        .collect()
}

#[tokio::test]
async fn anthropic_events_split_across_reads() {
    let meta = meta("claude-sonnet-4-20250514", true);
    let response = streamed(
        "text/event-stream",
        &[
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude\",\"usage\":{\"input_tokens\":11,\"output_tokens\":1}}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n",
            "\nevent: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" world\"}}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ],
    );
    let (mut downstream, rx) = Downstream::channel();
    let outcome = AnthropicAdaptor::new()
        .do_response(&meta, response, &mut downstream, &WordEstimator)
        .await
        .expect("stream");
    drop(downstream);

    assert_eq!(outcome.usage, Some(Usage::new(11, 2)));
    assert_eq!(outcome.completion_text, "Hello world");
    let frames = frames(rx).await;
    assert_eq!(content_of(&frames), "Hello world");
    assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));
    let usage_chunk: JsonValue =
        serde_json::from_str(&frames[frames.len() - 2]).expect("usage chunk");
    assert_eq!(usage_chunk["usage"]["total_tokens"], 13);
    assert!(frames.iter().any(|frame| frame.contains("\"finish_reason\":\"stop\"")));
}

#[tokio::test]
async fn gemini_array_split_mid_object() {
    let meta = meta("gemini-2.0-flash", false);
    let response = streamed(
        "application/json",
        &[
            "[{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hi \"}]}}]}\n,",
            "{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"the",
            "re\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":2,\"totalTokenCount\":5}}]",
        ],
    );
    let (mut downstream, rx) = Downstream::channel();
    let outcome = GeminiAdaptor::new()
        .do_response(&meta, response, &mut downstream, &WordEstimator)
        .await
        .expect("stream");
    drop(downstream);

    assert_eq!(outcome.usage, Some(Usage::new(3, 2)));
    let frames = frames(rx).await;
    assert_eq!(content_of(&frames), "Hi there");
    assert!(!frames.iter().any(|frame| frame.contains("\"usage\"")));
    assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));
}

#[tokio::test]
async fn gemini_call_without_args_forwards_empty_object() {
    let meta = meta("gemini-2.0-flash", false);
    let response = streamed(
        "application/json",
        &[r#"[{"candidates":[{"content":{"parts":[{"functionCall":{"name":"now"}}]},"finishReason":"STOP"}]}]"#],
    );
    let (mut downstream, rx) = Downstream::channel();
    GeminiAdaptor::new()
        .do_response(&meta, response, &mut downstream, &WordEstimator)
        .await
        .expect("stream");
    drop(downstream);

    let frames = frames(rx).await;
    let call = frames
        .iter()
        .filter_map(|frame| serde_json::from_str::<JsonValue>(frame).ok())
        .find_map(|chunk| chunk["choices"][0]["delta"]["tool_calls"][0].as_object().cloned())
        .expect("tool call chunk");
    assert_eq!(call["function"]["name"], "now");
    assert_eq!(call["function"]["arguments"], "{}");
    assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));
}

#[tokio::test]
async fn openai_stream_without_usage_is_estimated() {
    let meta = meta("gpt-4o", false);
    let response = streamed(
        "text/event-stream",
        &[
            "data: {\"id\":\"c1\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"one two\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c1\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\" three\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ],
    );
    let (mut downstream, rx) = Downstream::channel();
    let outcome = OpenAIAdaptor::new(OpenAIVariant::OpenAI)
        .do_response(&meta, response, &mut downstream, &WordEstimator)
        .await
        .expect("stream");
    drop(downstream);

    assert!(outcome.usage.is_none());
    assert_eq!(outcome.completion_text, "one two three");
    assert_eq!(content_of(&frames(rx).await), "one two three");
}

#[tokio::test]
async fn json_answer_to_stream_request_is_an_upstream_error() {
    let meta = meta("gpt-4o", false);
    let response = UpstreamHttpResponse {
        status: 200,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: UpstreamBody::Bytes(Bytes::from_static(
            br#"{"error":{"message":"model overloaded","type":"server_error"}}"#,
        )),
    };
    let (mut downstream, _rx) = Downstream::channel();
    let err = OpenAIAdaptor::new(OpenAIVariant::OpenAI)
        .do_response(&meta, response, &mut downstream, &WordEstimator)
        .await
        .expect_err("error");
    match err {
        RelayError::Upstream { status, error, .. } => {
            assert_eq!(status, 502);
            assert_eq!(error.message, "model overloaded");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!downstream.is_started());
}

#[tokio::test]
async fn anthropic_non_stream_is_converted() {
    let mut meta = meta("claude", false);
    meta.is_stream = false;
    let response = UpstreamHttpResponse {
        status: 200,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: UpstreamBody::Bytes(Bytes::from_static(
            br#"{"id":"msg_9","model":"claude","role":"assistant","content":[{"type":"tool_use","id":"toolu_9","name":"lookup","input":{"q":"x"}}],"stop_reason":"tool_use","usage":{"input_tokens":20,"output_tokens":8}}"#,
        )),
    };
    let (mut downstream, mut rx) = Downstream::channel();
    let outcome = AnthropicAdaptor::new()
        .do_response(&meta, response, &mut downstream, &WordEstimator)
        .await
        .expect("response");
    assert_eq!(outcome.usage, Some(Usage::new(20, 8)));
    let head = (&mut rx.head).await.expect("head");
    assert_eq!(head.status, 200);
    let body: JsonValue =
        serde_json::from_slice(&rx.body.recv().await.expect("body")).expect("json");
    assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
    assert_eq!(
        body["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"],
        r#"{"q":"x"}"#
    );
}
