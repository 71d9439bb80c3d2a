use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use relay_protocol::openai::create_chat_completions::stream::ChatCompletionChunk;
use relay_protocol::sse::DONE_SENTINEL;
use relay_provider_core::stream::{
    Frame, FrameError, FrameRule, StreamItem, StreamMapper, StreamTranslator,
};
use relay_provider_core::{
    Downstream, DownstreamReceiver, Meta, RelayMode, TokenEstimator, UpstreamBody,
    UpstreamFailure, UpstreamTransportErrorKind,
};

struct CanonicalMapper;

impl StreamMapper for CanonicalMapper {
    fn frame_rule(&self) -> FrameRule {
        FrameRule::Lines {
            require_data_prefix: true,
        }
    }

    fn map_frame(&mut self, frame: &Frame) -> Result<Vec<StreamItem>, FrameError> {
        if frame.data == DONE_SENTINEL {
            return Ok(vec![StreamItem::Done]);
        }
        let chunk: ChatCompletionChunk = serde_json::from_str(&frame.data)?;
        Ok(vec![StreamItem::Chunk(chunk)])
    }
}

struct WordEstimator;

impl TokenEstimator for WordEstimator {
    fn count_text(&self, text: &str, _model: &str) -> u64 {
        text.split_whitespace().count() as u64
    }
}

fn meta(include_usage: bool) -> Meta {
    let mut meta = Meta::new("trace-1", RelayMode::ChatCompletions);
    meta.origin_model = "gpt-4o".to_string();
    meta.actual_model = "gpt-4o".to_string();
    meta.is_stream = true;
    meta.include_usage = include_usage;
    meta.prompt_tokens = 9;
    meta
}

fn content_frame(text: &str) -> String {
    format!(
        "data: {{\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{text}\"}},\"finish_reason\":null}}]}}\n\n"
    )
}

fn tool_frame(fragment: &str, first: bool) -> String {
    let head = if first {
        "\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"lookup\",\"arguments\":"
    } else {
        "\"function\":{\"arguments\":"
    };
    let fragment = serde_json::to_string(fragment).expect("encode fragment");
    format!(
        "data: {{\"id\":\"c1\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{{\"index\":0,\"delta\":{{\"tool_calls\":[{{\"index\":0,{head}{fragment}}}}}]}},\"finish_reason\":null}}]}}\n\n"
    )
}

async fn drain(rx: &mut DownstreamReceiver) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(bytes) = rx.body.recv().await {
        frames.push(String::from_utf8_lossy(&bytes).into_owned());
    }
    frames
}

fn frame_payloads(frames: &[String]) -> Vec<serde_json::Value> {
    frames
        .iter()
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(str::trim)
        .filter(|data| *data != DONE_SENTINEL)
        .map(|data| serde_json::from_str(data).expect("json frame"))
        .collect()
}

#[tokio::test]
async fn frames_are_forwarded_in_upstream_order() {
    let (tx, rx) = mpsc::channel(8);
    let (mut downstream, mut client) = Downstream::channel();
    let meta = meta(false);

    let producer = tokio::spawn(async move {
        for text in ["A", "B", "C"] {
            tx.send(Ok(Bytes::from(content_frame(text))))
                .await
                .expect("send frame");
        }
        tx.send(Ok(Bytes::from_static(b"data: [DONE]\n\n")))
            .await
            .expect("send done");
    });

    let summary = StreamTranslator::new(CanonicalMapper, &meta, &WordEstimator)
        .run(UpstreamBody::Stream(rx), &mut downstream)
        .await;
    drop(downstream);
    producer.await.expect("producer");

    let head = (&mut client.head).await.expect("head");
    assert!(head.is_sse);
    let frames = drain(&mut client).await;
    let contents: Vec<String> = frame_payloads(&frames)
        .iter()
        .map(|chunk| chunk["choices"][0]["delta"]["content"].as_str().unwrap_or("").to_string())
        .collect();
    assert_eq!(contents, vec!["A", "B", "C"]);
    assert_eq!(frames.last().map(String::as_str), Some("data: [DONE]\n\n"));
    assert_eq!(summary.completion_text, "ABC");
    assert!(!summary.usage_observed);
    assert_eq!(summary.usage.prompt_tokens, 9);
}

#[tokio::test]
async fn tool_call_fragments_reassemble() {
    let body = format!(
        "{}{}{}data: [DONE]\n\n",
        tool_frame("{\"a\"", true),
        tool_frame(":1", false),
        tool_frame("}", false)
    );
    let (mut downstream, _client) = Downstream::channel();
    let meta = meta(false);
    let summary = StreamTranslator::new(CanonicalMapper, &meta, &WordEstimator)
        .run(UpstreamBody::Bytes(Bytes::from(body)), &mut downstream)
        .await;
    assert_eq!(summary.tool_calls.len(), 1);
    assert_eq!(summary.tool_calls[0].function.name, "lookup");
    assert_eq!(summary.tool_calls[0].function.arguments, "{\"a\":1}");
}

#[tokio::test]
async fn empty_tool_arguments_are_flushed_as_empty_object() {
    let body = format!(
        "{}data: {{\"id\":\"c1\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{{\"index\":0,\"delta\":{{}},\"finish_reason\":\"tool_calls\"}}]}}\n\ndata: [DONE]\n\n",
        tool_frame("", true)
    );
    let (mut downstream, mut client) = Downstream::channel();
    let meta = meta(false);
    let summary = StreamTranslator::new(CanonicalMapper, &meta, &WordEstimator)
        .run(UpstreamBody::Bytes(Bytes::from(body)), &mut downstream)
        .await;
    drop(downstream);
    assert_eq!(summary.tool_calls[0].function.arguments, "{}");
    assert_eq!(summary.finish_reason.as_deref(), Some("tool_calls"));

    let payloads = frame_payloads(&drain(&mut client).await);
    // the flush lands before the finishing chunk
    assert_eq!(
        payloads[1]["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
        "{}"
    );
    assert_eq!(payloads[2]["choices"][0]["finish_reason"], "tool_calls");
}

#[tokio::test]
async fn malformed_frame_is_skipped() {
    let body = format!("{}data: {{not json\n\n{}data: [DONE]\n\n", content_frame("x"), content_frame("y"));
    let (mut downstream, _client) = Downstream::channel();
    let meta = meta(false);
    let summary = StreamTranslator::new(CanonicalMapper, &meta, &WordEstimator)
        .run(UpstreamBody::Bytes(Bytes::from(body)), &mut downstream)
        .await;
    assert_eq!(summary.frames_skipped, 1);
    assert_eq!(summary.completion_text, "xy");
    assert!(summary.error.is_none());
}

#[tokio::test]
async fn transport_error_ends_stream_with_done_and_keeps_partial_text() {
    let (tx, rx) = mpsc::channel(8);
    tx.send(Ok(Bytes::from(content_frame("partial"))))
        .await
        .expect("send");
    tx.send(Err(UpstreamFailure::transport(
        UpstreamTransportErrorKind::ReadTimeout,
        "idle timeout",
    )))
    .await
    .expect("send");
    drop(tx);

    let (mut downstream, mut client) = Downstream::channel();
    let meta = meta(false);
    let summary = StreamTranslator::new(CanonicalMapper, &meta, &WordEstimator)
        .run(UpstreamBody::Stream(rx), &mut downstream)
        .await;
    drop(downstream);

    assert_eq!(summary.error.as_deref(), Some("idle timeout"));
    assert_eq!(summary.completion_text, "partial");
    assert_eq!(summary.usage.completion_tokens, 1);
    let frames = drain(&mut client).await;
    assert_eq!(frames.last().map(String::as_str), Some("data: [DONE]\n\n"));
}

#[tokio::test]
async fn include_usage_emits_single_usage_chunk() {
    let body = format!(
        "{}data: {{\"id\":\"c1\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[],\"usage\":{{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}}}\n\ndata: [DONE]\n\n",
        content_frame("hi")
    );
    let (mut downstream, mut client) = Downstream::channel();
    let meta = meta(true);
    let summary = StreamTranslator::new(CanonicalMapper, &meta, &WordEstimator)
        .run(UpstreamBody::Bytes(Bytes::from(body)), &mut downstream)
        .await;
    drop(downstream);
    assert!(summary.usage_observed);
    assert_eq!(summary.usage.total_tokens, 7);

    let payloads = frame_payloads(&drain(&mut client).await);
    let with_usage: Vec<&serde_json::Value> = payloads
        .iter()
        .filter(|payload| payload.get("usage").is_some())
        .collect();
    assert_eq!(with_usage.len(), 1);
    assert_eq!(with_usage[0]["usage"]["prompt_tokens"], 5);
}

#[tokio::test]
async fn client_disconnect_stops_reading_upstream() {
    let (tx, rx) = mpsc::channel(1);
    let (mut downstream, client) = Downstream::channel();
    drop(client);
    let meta = meta(false);

    tx.send(Ok(Bytes::from(content_frame("lost"))))
        .await
        .expect("send");
    let summary = StreamTranslator::new(CanonicalMapper, &meta, &WordEstimator)
        .run(UpstreamBody::Stream(rx), &mut downstream)
        .await;
    assert!(summary.client_gone);
    // the receiver was dropped, so the upstream side sees a closed channel
    assert!(tx.send(Ok(Bytes::from_static(b"more"))).await.is_err());
}

#[tokio::test]
async fn client_hangup_is_seen_while_upstream_is_idle() {
    let (tx, rx) = mpsc::channel(8);
    let (mut downstream, mut client) = Downstream::channel();
    tx.send(Ok(Bytes::from(content_frame("first"))))
        .await
        .expect("send");

    let translator = tokio::spawn(async move {
        let meta = meta(false);
        StreamTranslator::new(CanonicalMapper, &meta, &WordEstimator)
            .run(UpstreamBody::Stream(rx), &mut downstream)
            .await
    });

    let first = client.body.recv().await.expect("first chunk");
    assert!(String::from_utf8_lossy(&first).contains("first"));
    drop(client);

    // upstream stays open and silent; the hang-up alone must end the run
    let summary = tokio::time::timeout(Duration::from_secs(2), translator)
        .await
        .expect("translator returned after the hang-up")
        .expect("join");
    assert!(summary.client_gone);
    assert_eq!(summary.completion_text, "first");
    assert!(tx.is_closed());
}
