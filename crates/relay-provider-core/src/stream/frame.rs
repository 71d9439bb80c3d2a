use relay_protocol::sse::SseParser;

/// How an upstream body is cut into frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRule {
    /// One frame per line. With `require_data_prefix`, only `data:` lines count
    /// (OpenAI-style SSE); without it bare lines are frames too (NDJSON).
    Lines { require_data_prefix: bool },
    /// Multi-line `event:` / `data:` blocks separated by a blank line.
    EventBlocks,
    /// Concatenated or array-wrapped JSON objects with no delimiter; objects are
    /// found by brace matching.
    BraceMatched,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: String,
}

impl Frame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }
}

#[derive(Debug)]
enum DecoderState {
    Lines {
        buffer: Vec<u8>,
        require_data_prefix: bool,
    },
    Events(SseParser),
    Braces(BraceMatcher),
}

/// Incremental frame splitter. Partial frames stay buffered until the next
/// `push`; `finish` hands back whatever is left instead of dropping it.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecoderState,
}

impl FrameDecoder {
    pub fn new(rule: FrameRule) -> Self {
        let state = match rule {
            FrameRule::Lines {
                require_data_prefix,
            } => DecoderState::Lines {
                buffer: Vec::new(),
                require_data_prefix,
            },
            FrameRule::EventBlocks => DecoderState::Events(SseParser::new()),
            FrameRule::BraceMatched => DecoderState::Braces(BraceMatcher::default()),
        };
        Self { state }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        match &mut self.state {
            DecoderState::Lines {
                buffer,
                require_data_prefix,
            } => {
                buffer.extend_from_slice(chunk);
                let mut frames = Vec::new();
                while let Some(pos) = buffer.iter().position(|byte| *byte == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if let Some(frame) = line_frame(&line[..line.len() - 1], *require_data_prefix)
                    {
                        frames.push(frame);
                    }
                }
                frames
            }
            DecoderState::Events(parser) => event_frames(parser.push_bytes(chunk)),
            DecoderState::Braces(matcher) => matcher.push(chunk),
        }
    }

    pub fn finish(&mut self) -> Vec<Frame> {
        match &mut self.state {
            DecoderState::Lines {
                buffer,
                require_data_prefix,
            } => {
                let rest = std::mem::take(buffer);
                line_frame(&rest, *require_data_prefix).into_iter().collect()
            }
            DecoderState::Events(parser) => event_frames(parser.finish()),
            DecoderState::Braces(matcher) => matcher.finish(),
        }
    }
}

fn line_frame(raw: &[u8], require_data_prefix: bool) -> Option<Frame> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim_start();
        if data.is_empty() {
            return None;
        }
        return Some(Frame::data(data));
    }
    if require_data_prefix {
        return None;
    }
    Some(Frame::data(line))
}

fn event_frames(events: Vec<relay_protocol::sse::SseEvent>) -> Vec<Frame> {
    events
        .into_iter()
        .filter(|event| !event.data.is_empty())
        .map(|event| Frame {
            event: event.event,
            data: event.data,
        })
        .collect()
}

/// Byte-level brace matcher. The delimiters it tracks are ASCII, so a
/// multi-byte character split across reads cannot confuse it.
#[derive(Debug, Default)]
struct BraceMatcher {
    current: Vec<u8>,
    depth: usize,
    in_string: bool,
    escape: bool,
}

impl BraceMatcher {
    fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut out = Vec::new();
        for &byte in chunk {
            if self.depth == 0 {
                // between objects: array brackets, commas, whitespace
                if byte == b'{' {
                    self.depth = 1;
                    self.current.push(byte);
                }
                continue;
            }

            self.current.push(byte);
            if self.in_string {
                if self.escape {
                    self.escape = false;
                } else if byte == b'\\' {
                    self.escape = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        let object = std::mem::take(&mut self.current);
                        out.push(Frame::data(String::from_utf8_lossy(&object).into_owned()));
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// An object still open at end of input is returned as-is; the caller's
    /// decode step reports it as malformed.
    fn finish(&mut self) -> Vec<Frame> {
        self.depth = 0;
        self.in_string = false;
        self.escape = false;
        let rest = std::mem::take(&mut self.current);
        let text = String::from_utf8_lossy(&rest);
        let text = text.trim();
        if text.is_empty() {
            Vec::new()
        } else {
            vec![Frame::data(text)]
        }
    }
}
