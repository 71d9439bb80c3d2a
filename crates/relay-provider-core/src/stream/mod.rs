//! Streaming Protocol Translator.
//!
//! `frame` cuts upstream bytes into frames, a vendor `StreamMapper` decodes each
//! frame into canonical items, and `StreamTranslator` forwards them to the
//! client while it tracks tool calls, usage and text.

pub mod accumulate;
pub mod frame;
pub mod translator;

pub use accumulate::{ToolCallAccumulator, UsageAccumulator};
pub use frame::{Frame, FrameDecoder, FrameRule};
pub use translator::{
    FrameError, StreamItem, StreamMapper, StreamSummary, StreamTranslator, map_finish_reason,
};
