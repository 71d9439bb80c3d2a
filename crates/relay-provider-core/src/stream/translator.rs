use tracing::{debug, warn};

use relay_protocol::now_unix_seconds;
use relay_protocol::openai::create_chat_completions::stream::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta,
};
use relay_protocol::openai::create_chat_completions::types::{
    FunctionCallDelta, ToolCall, ToolCallDelta, Usage,
};
use relay_protocol::openai::error::ErrorBody;
use relay_protocol::sse::{sse_data_bytes, sse_done_bytes, sse_json_bytes};

use crate::downstream::{ClientGone, Downstream};
use crate::estimator::TokenEstimator;
use crate::meta::Meta;
use crate::stream::accumulate::{ToolCallAccumulator, UsageAccumulator};
use crate::stream::frame::{Frame, FrameDecoder, FrameRule};
use crate::upstream::UpstreamBody;
use crate::usage::finalize_usage;

/// What a vendor frame turns into.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Chunk(ChatCompletionChunk),
    /// Already canonical payload forwarded untouched, with the text it carries.
    Raw { data: String, text: String },
    Usage(Usage),
    /// Vendor signalled the end of the stream.
    Done,
    /// Vendor reported an error inside the stream.
    Error(ErrorBody),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError(pub String);

impl FrameError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for FrameError {
    fn from(err: serde_json::Error) -> Self {
        FrameError(err.to_string())
    }
}

/// The vendor-specific half of stream translation.
pub trait StreamMapper: Send {
    fn frame_rule(&self) -> FrameRule;

    /// Decode one frame. An `Err` skips the frame; the stream continues.
    fn map_frame(&mut self, frame: &Frame) -> Result<Vec<StreamItem>, FrameError>;
}

#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    /// Finalized usage (vendor numbers, or an estimate over the emitted text).
    pub usage: Usage,
    pub usage_observed: bool,
    pub completion_text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
    /// Transport failure or vendor error that ended the stream early.
    pub error: Option<String>,
    pub client_gone: bool,
    pub chunks_forwarded: usize,
    pub frames_skipped: usize,
}

enum Flow {
    Continue,
    Stop,
}

/// Turns an upstream body into canonical SSE on `Downstream`, chunk by chunk.
///
/// Nothing is buffered beyond one partial frame: every decoded chunk is written
/// before the next upstream read.
pub struct StreamTranslator<'a, M> {
    mapper: M,
    decoder: FrameDecoder,
    meta: &'a Meta,
    estimator: &'a dyn TokenEstimator,
    tools: ToolCallAccumulator,
    usage: UsageAccumulator,
    text: String,
    finish_reason: Option<String>,
    chunk_id: Option<String>,
    chunk_model: Option<String>,
    created: i64,
    summary: StreamSummary,
}

impl<'a, M: StreamMapper> StreamTranslator<'a, M> {
    pub fn new(mapper: M, meta: &'a Meta, estimator: &'a dyn TokenEstimator) -> Self {
        let decoder = FrameDecoder::new(mapper.frame_rule());
        Self {
            mapper,
            decoder,
            meta,
            estimator,
            tools: ToolCallAccumulator::default(),
            usage: UsageAccumulator::default(),
            text: String::new(),
            finish_reason: None,
            chunk_id: None,
            chunk_model: None,
            created: now_unix_seconds(),
            summary: StreamSummary::default(),
        }
    }

    pub async fn run(mut self, body: UpstreamBody, downstream: &mut Downstream) -> StreamSummary {
        if downstream.start_sse().is_err() {
            return self.client_gone();
        }

        match body {
            UpstreamBody::Bytes(bytes) => {
                let mut frames = self.decoder.push(&bytes);
                frames.extend(self.decoder.finish());
                if let Err(ClientGone) = self.forward_frames(frames, downstream).await {
                    return self.client_gone();
                }
            }
            UpstreamBody::Stream(mut rx) => loop {
                // an idle upstream must not hide a client hang-up
                let next = tokio::select! {
                    next = rx.recv() => next,
                    _ = downstream.closed() => {
                        drop(rx);
                        return self.client_gone();
                    }
                };
                match next {
                    Some(Ok(bytes)) => {
                        let frames = self.decoder.push(&bytes);
                        match self.forward_frames(frames, downstream).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Stop) => break,
                            Err(ClientGone) => {
                                // dropping `rx` stops the upstream reader task
                                drop(rx);
                                return self.client_gone();
                            }
                        }
                    }
                    Some(Err(failure)) => {
                        let message = failure.message();
                        warn!(
                            event = "stream_terminated",
                            trace_id = %self.meta.trace_id,
                            reason = "transport_error",
                            error = %message,
                            forwarded = self.summary.chunks_forwarded
                        );
                        self.summary.error = Some(message);
                        break;
                    }
                    None => {
                        let frames = self.decoder.finish();
                        if let Err(ClientGone) = self.forward_frames(frames, downstream).await {
                            return self.client_gone();
                        }
                        break;
                    }
                }
            },
        }

        if let Err(ClientGone) = self.finish(downstream).await {
            return self.client_gone();
        }
        self.into_summary()
    }

    async fn forward_frames(
        &mut self,
        frames: Vec<Frame>,
        downstream: &mut Downstream,
    ) -> Result<Flow, ClientGone> {
        for frame in frames {
            let items = match self.mapper.map_frame(&frame) {
                Ok(items) => items,
                Err(FrameError(reason)) => {
                    self.summary.frames_skipped += 1;
                    warn!(
                        event = "stream_frame_skipped",
                        trace_id = %self.meta.trace_id,
                        channel_type = %self.meta.channel_type,
                        reason = %reason,
                        frame_len = frame.data.len()
                    );
                    continue;
                }
            };
            for item in items {
                match item {
                    StreamItem::Chunk(chunk) => {
                        if let Some(chunk) = self.observe_chunk(chunk, downstream).await? {
                            self.emit_chunk(&chunk, downstream).await?;
                        }
                    }
                    StreamItem::Raw { data, text } => {
                        self.text.push_str(&text);
                        downstream.send(sse_data_bytes(&data)).await?;
                        self.summary.chunks_forwarded += 1;
                    }
                    StreamItem::Usage(usage) => self.usage.merge(&usage),
                    StreamItem::Done => return Ok(Flow::Stop),
                    StreamItem::Error(error) => {
                        warn!(
                            event = "stream_terminated",
                            trace_id = %self.meta.trace_id,
                            reason = "vendor_error",
                            error = %error.message
                        );
                        self.summary.error = Some(error.message.clone());
                        if let Some(frame) = sse_json_bytes(&error.into_response()) {
                            downstream.send(frame).await?;
                        }
                        return Ok(Flow::Stop);
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Record what the chunk carries. Vendor usage is stripped; the client gets
    /// one usage chunk at the end if it asked for it. A choice that finishes has
    /// its empty tool-call arguments flushed first.
    async fn observe_chunk(
        &mut self,
        mut chunk: ChatCompletionChunk,
        downstream: &mut Downstream,
    ) -> Result<Option<ChatCompletionChunk>, ClientGone> {
        if self.chunk_id.is_none() && !chunk.id.is_empty() {
            self.chunk_id = Some(chunk.id.clone());
            self.created = chunk.created;
        }
        if self.chunk_model.is_none() && !chunk.model.is_empty() {
            self.chunk_model = Some(chunk.model.clone());
        }
        if let Some(usage) = chunk.usage.take() {
            self.usage.merge(&usage);
        }
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                self.text.push_str(content);
            }
            if let Some(reasoning) = &choice.delta.reasoning_content {
                self.text.push_str(reasoning);
            }
            if let Some(calls) = &choice.delta.tool_calls {
                for call in calls {
                    self.tools.push(choice.index, call);
                    if let Some(function) = &call.function {
                        self.text.push_str(function.name.as_deref().unwrap_or(""));
                        self.text.push_str(function.arguments.as_deref().unwrap_or(""));
                    }
                }
            }
        }
        let finishing: Vec<u32> = chunk
            .choices
            .iter()
            .filter(|choice| choice.finish_reason.is_some())
            .map(|choice| choice.index)
            .collect();
        for choice in finishing {
            self.flush_tool_calls(Some(choice), downstream).await?;
        }
        if let Some(reason) = chunk
            .choices
            .iter()
            .find_map(|choice| choice.finish_reason.clone())
        {
            self.finish_reason = Some(reason);
        }
        if chunk.choices.is_empty() {
            return Ok(None);
        }
        Ok(Some(chunk))
    }

    async fn emit_chunk(
        &mut self,
        chunk: &ChatCompletionChunk,
        downstream: &mut Downstream,
    ) -> Result<(), ClientGone> {
        match sse_json_bytes(chunk) {
            Some(frame) => {
                downstream.send(frame).await?;
                self.summary.chunks_forwarded += 1;
            }
            None => debug!(event = "stream_chunk_unserializable", trace_id = %self.meta.trace_id),
        }
        Ok(())
    }

    async fn flush_tool_calls(
        &mut self,
        choice: Option<u32>,
        downstream: &mut Downstream,
    ) -> Result<(), ClientGone> {
        for (choice, index) in self.tools.flush_empty(choice) {
            let delta = ChunkDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index,
                    id: None,
                    kind: None,
                    function: Some(FunctionCallDelta {
                        name: None,
                        arguments: Some("{}".to_string()),
                    }),
                }]),
                ..ChunkDelta::default()
            };
            let chunk = self.synthetic_chunk().with_choice(ChunkChoice {
                index: choice,
                delta,
                ..ChunkChoice::default()
            });
            self.emit_chunk(&chunk, downstream).await?;
        }
        Ok(())
    }

    fn synthetic_chunk(&self) -> ChatCompletionChunk {
        let id = self
            .chunk_id
            .clone()
            .unwrap_or_else(|| format!("chatcmpl-{}", self.meta.trace_id));
        let model = self
            .chunk_model
            .clone()
            .unwrap_or_else(|| self.meta.origin_model.clone());
        ChatCompletionChunk::new(id, model, self.created)
    }

    /// Flush pending tool calls, the usage chunk, then `[DONE]`.
    async fn finish(&mut self, downstream: &mut Downstream) -> Result<(), ClientGone> {
        self.flush_tool_calls(None, downstream).await?;
        let usage = self.final_usage();
        if self.meta.include_usage && self.meta.mode.is_text() {
            let mut chunk = self.synthetic_chunk();
            chunk.usage = Some(usage.clone());
            self.emit_chunk(&chunk, downstream).await?;
        }
        self.summary.usage = usage;
        downstream.send(sse_done_bytes()).await?;
        Ok(())
    }

    fn final_usage(&self) -> Usage {
        finalize_usage(
            self.usage.observed(),
            self.meta.prompt_tokens,
            &self.text,
            self.estimator,
            &self.meta.actual_model,
        )
    }

    fn client_gone(mut self) -> StreamSummary {
        warn!(
            event = "stream_terminated",
            trace_id = %self.meta.trace_id,
            reason = "client_gone",
            forwarded = self.summary.chunks_forwarded
        );
        self.summary.client_gone = true;
        self.summary.usage = self.final_usage();
        self.into_summary()
    }

    fn into_summary(mut self) -> StreamSummary {
        self.summary.usage_observed = self
            .usage
            .observed()
            .is_some_and(|usage| !usage.is_empty());
        self.summary.completion_text = std::mem::take(&mut self.text);
        self.summary.tool_calls = self.tools.tool_calls();
        self.summary.finish_reason = self.finish_reason.take();
        self.summary
    }
}

/// Shared finish-reason lookup: known vendor reasons map to canonical ones,
/// anything else passes through unchanged.
pub fn map_finish_reason(table: &[(&str, &str)], reason: &str) -> String {
    table
        .iter()
        .find(|(vendor, _)| *vendor == reason)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or_else(|| reason.to_string())
}
