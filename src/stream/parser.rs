//! Incremental SSE frame parser.
//!
//! Turns the raw byte chunks of a `text/event-stream` response into decoded
//! [`StreamFrame`]s. The parser is tolerant of:
//!
//! - multi-byte UTF-8 characters split across chunk boundaries
//! - several `data:` frames arriving in one chunk, or one frame split across
//!   many chunks
//! - the terminal `data: [DONE]` sentinel
//!
//! Malformed frames are dropped and scanning continues. Only an error from
//! the underlying byte stream ends the sequence early.

use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;

use crate::error::ChatError;
use crate::types::{FinishReason, StreamFrame, TokenUsage, ToolCallFragment};

/// Something the parser recognized in the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Frame(StreamFrame),
    /// The provider reported an error inside the stream
    ProviderError(String),
    /// `data: [DONE]`
    Done,
}

// --- Wire Types (OpenAI-compatible chunk format) ---

#[derive(Deserialize, Debug)]
struct WireChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize, Debug)]
struct WireChoice {
    #[serde(default)]
    index: usize,
    delta: Option<WireDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireDelta {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct WireToolCallDelta {
    index: Option<usize>,
    id: Option<String>,
    function: Option<WireFunctionDelta>,
}

#[derive(Deserialize, Debug)]
struct WireFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

// --- Parser ---

/// Stateful SSE parser. Feed it chunks in arrival order.
#[derive(Debug, Default)]
pub struct StreamFrameParser {
    /// Bytes that do not yet form complete UTF-8 characters
    undecoded: Vec<u8>,
    /// Decoded text not yet consumed as complete lines
    text: String,
    /// Offset in `text` up to which no newline exists
    scanned: usize,
    done: bool,
    dropped: usize,
}

impl StreamFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        self.undecoded.extend_from_slice(chunk);
        self.decode_available();
        self.drain_lines(&mut events);
        events
    }

    /// Flush whatever is left once the byte stream has closed.
    ///
    /// A final frame that was not newline-terminated is still parsed.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        if !self.undecoded.is_empty() {
            let tail = std::mem::take(&mut self.undecoded);
            self.text.push_str(&String::from_utf8_lossy(&tail));
        }
        let rest = std::mem::take(&mut self.text);
        self.scanned = 0;
        self.process_line(&rest, &mut events);
        self.done = true;
        events
    }

    /// Whether the `[DONE]` sentinel was seen (or the stream was finished).
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Number of frames dropped because they could not be decoded.
    pub fn dropped_frames(&self) -> usize {
        self.dropped
    }

    /// Move every complete UTF-8 prefix of `undecoded` into `text`.
    ///
    /// An incomplete trailing sequence stays buffered until the next chunk
    /// completes it. Bytes that can never be valid are replaced with U+FFFD.
    fn decode_available(&mut self) {
        loop {
            match std::str::from_utf8(&self.undecoded) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    self.undecoded.clear();
                    return;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    self.text
                        .push_str(&String::from_utf8_lossy(&self.undecoded[..valid_up_to]));
                    match err.error_len() {
                        None => {
                            self.undecoded.drain(..valid_up_to);
                            return;
                        }
                        Some(bad) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            self.undecoded.drain(..valid_up_to + bad);
                        }
                    }
                }
            }
        }
    }

    /// Process all complete lines, then drop them from the buffer.
    fn drain_lines(&mut self, events: &mut Vec<StreamEvent>) {
        let mut consumed = 0;
        let mut search_from = self.scanned;
        while let Some(rel) = self.text[search_from..].find('\n') {
            let end = search_from + rel;
            let line = self.text[consumed..end].to_string();
            consumed = end + 1;
            search_from = consumed;
            self.process_line(&line, events);
            if self.done {
                self.text.clear();
                self.scanned = 0;
                return;
            }
        }
        self.text.drain(..consumed);
        self.scanned = self.text.len();
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        let trimmed = line.trim();

        // Event separators, comments and non-data fields carry nothing for us
        if trimmed.is_empty() || trimmed.starts_with(':') {
            return;
        }
        let payload = match trimmed
            .strip_prefix("data: ")
            .or_else(|| trimmed.strip_prefix("data:"))
        {
            Some(p) => p.trim(),
            None => return,
        };

        if payload == "[DONE]" {
            self.done = true;
            events.push(StreamEvent::Done);
            return;
        }

        match decode_payload(payload) {
            Ok(decoded) => events.extend(decoded),
            Err(e) => {
                self.dropped += 1;
                tracing::debug!(error = %e, len = payload.len(), "dropping malformed stream frame");
            }
        }
    }
}

/// Decode one `data:` payload into zero or more events.
///
/// A chunk with several choices yields one frame per choice; a usage-only
/// chunk yields a single frame carrying just the usage.
fn decode_payload(payload: &str) -> Result<Vec<StreamEvent>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(payload)?;

    if let Some(err) = value.get("error") {
        return Ok(vec![StreamEvent::ProviderError(error_message(err))]);
    }

    let chunk: WireChunk = serde_json::from_value(value)?;
    let usage = chunk.usage.map(|u| TokenUsage {
        input_tokens: u.prompt_tokens.unwrap_or(0),
        output_tokens: u.completion_tokens.unwrap_or(0),
    });

    let mut frames: Vec<StreamFrame> = chunk
        .choices
        .into_iter()
        .map(|choice| {
            let (delta_text, tool_calls) = match choice.delta {
                Some(delta) => (delta.content, delta.tool_calls.unwrap_or_default()),
                None => (None, Vec::new()),
            };
            let delta_tool_calls = tool_calls
                .into_iter()
                .enumerate()
                .map(|(position, tc)| {
                    let (function_name, arguments) = match tc.function {
                        Some(f) => (f.name, f.arguments.unwrap_or_default()),
                        None => (None, String::new()),
                    };
                    ToolCallFragment {
                        index: tc.index.unwrap_or(position),
                        call_id: tc.id,
                        function_name,
                        arguments_chunk: arguments,
                    }
                })
                .collect();
            StreamFrame {
                id: chunk.id.clone(),
                choice_index: choice.index,
                delta_text,
                delta_tool_calls,
                finish_reason: choice.finish_reason.as_deref().map(FinishReason::parse),
                usage: None,
            }
        })
        .collect();

    if let Some(usage) = usage {
        match frames.last_mut() {
            Some(last) => last.usage = Some(usage),
            None => frames.push(StreamFrame {
                id: chunk.id,
                usage: Some(usage),
                ..Default::default()
            }),
        }
    }

    Ok(frames.into_iter().map(StreamEvent::Frame).collect())
}

fn error_message(err: &serde_json::Value) -> String {
    match err {
        serde_json::Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

// --- Async Adapter ---

struct ParseState<S> {
    parser: StreamFrameParser,
    input: S,
    pending: VecDeque<StreamEvent>,
    closed: bool,
}

/// Lazily parse a provider byte stream.
///
/// The sequence ends after `[DONE]`, when the input closes, or right after
/// yielding the first transport error.
pub fn parse_stream<S>(input: S) -> impl Stream<Item = Result<StreamEvent, ChatError>>
where
    S: Stream<Item = Result<Bytes, ChatError>> + Unpin,
{
    let state = ParseState {
        parser: StreamFrameParser::new(),
        input,
        pending: VecDeque::new(),
        closed: false,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if st.closed || st.parser.is_done() {
                return None;
            }
            match st.input.next().await {
                Some(Ok(chunk)) => {
                    let events = st.parser.feed(&chunk);
                    st.pending.extend(events);
                }
                Some(Err(e)) => {
                    st.closed = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.closed = true;
                    let events = st.parser.finish();
                    st.pending.extend(events);
                }
            }
        }
    })
}
