//! Delta merging.
//!
//! Accumulates the text and tool-call fragments of streamed frames into one
//! [`MergedMessage`] per response id (and choice), while reporting live
//! fragments for progressive display.

use std::collections::HashMap;

use crate::types::{FinishReason, StreamFrame, TokenUsage, ToolCall, ToolCallFragment};

/// Identifies the message a frame contributes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResponseKey {
    pub id: String,
    pub choice: usize,
}

/// A finalized, immutable message assembled from stream frames.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedMessage {
    pub id: String,
    pub choice_index: usize,
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<FinishReason>,
}

impl MergedMessage {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Side-channel output of [`DeltaMerger::merge`].
#[derive(Debug, Clone, PartialEq)]
pub enum MergeEvent {
    /// Non-empty text delta, in arrival order
    Fragment(String),
    /// First tool-call delta of the stream
    ToolWait,
    /// The provider closed a message with a terminal finish reason
    Completed(MergedMessage),
}

#[derive(Debug, Default)]
struct ToolCallBuilder {
    index: usize,
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallBuilder {
    fn apply(&mut self, fragment: ToolCallFragment) {
        // id and name come with the first fragment; later ones never overwrite them
        if self.id.is_none() {
            self.id = fragment.call_id.filter(|id| !id.is_empty());
        }
        if self.name.is_none() {
            self.name = fragment.function_name.filter(|name| !name.is_empty());
        }
        self.arguments.push_str(&fragment.arguments_chunk);
    }

    fn build(self) -> ToolCall {
        ToolCall {
            id: self
                .id
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
            name: self.name.unwrap_or_default(),
            arguments: self.arguments,
        }
    }
}

/// Mutable accumulator for one response; becomes a [`MergedMessage`] on
/// [`finalize`](MergedMessageBuilder::finalize).
#[derive(Debug)]
pub struct MergedMessageBuilder {
    key: ResponseKey,
    text: String,
    tool_calls: Vec<ToolCallBuilder>,
    finish_reason: Option<FinishReason>,
}

impl MergedMessageBuilder {
    fn new(key: ResponseKey) -> Self {
        Self {
            key,
            text: String::new(),
            tool_calls: Vec::new(),
            finish_reason: None,
        }
    }

    fn tool_call_at(&mut self, index: usize) -> &mut ToolCallBuilder {
        let pos = match self.tool_calls.iter().position(|tc| tc.index == index) {
            Some(pos) => pos,
            None => {
                self.tool_calls.push(ToolCallBuilder {
                    index,
                    ..Default::default()
                });
                self.tool_calls.len() - 1
            }
        };
        &mut self.tool_calls[pos]
    }

    pub fn finalize(mut self) -> MergedMessage {
        self.tool_calls.sort_by_key(|tc| tc.index);
        MergedMessage {
            id: self.key.id,
            choice_index: self.key.choice,
            text: self.text,
            tool_calls: self.tool_calls.into_iter().map(ToolCallBuilder::build).collect(),
            finish_reason: self.finish_reason,
        }
    }
}

/// Merges stream frames into complete messages.
///
/// Frames must be fed in arrival order: text and tool arguments are
/// concatenated in exactly that order.
#[derive(Debug, Default)]
pub struct DeltaMerger {
    builders: HashMap<ResponseKey, MergedMessageBuilder>,
    /// Keys of open builders, oldest first
    order: Vec<ResponseKey>,
    tool_wait_sent: bool,
    usage: Option<TokenUsage>,
}

/// Text deltas that only echo the stream terminator are never displayed.
const DONE_SENTINEL: &str = "[DONE]";

impl DeltaMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one frame, returning the live events it produced.
    pub fn merge(&mut self, frame: StreamFrame) -> Vec<MergeEvent> {
        let mut events = Vec::new();

        if let Some(usage) = frame.usage {
            self.usage = Some(usage);
        }

        let text = frame
            .delta_text
            .filter(|t| !t.is_empty() && t != DONE_SENTINEL);
        let has_content = text.is_some() || !frame.delta_tool_calls.is_empty();
        let key = ResponseKey {
            id: frame.id,
            choice: frame.choice_index,
        };

        // Frames without content never open a message; they can only close one
        if !has_content && (frame.finish_reason.is_none() || !self.builders.contains_key(&key)) {
            return events;
        }

        let builder = self.builder_for(&key);

        if let Some(text) = text {
            builder.text.push_str(&text);
            events.push(MergeEvent::Fragment(text));
        }

        if !frame.delta_tool_calls.is_empty() {
            for fragment in frame.delta_tool_calls {
                builder.tool_call_at(fragment.index).apply(fragment);
            }
            if !self.tool_wait_sent {
                self.tool_wait_sent = true;
                events.push(MergeEvent::ToolWait);
            }
        }

        if let Some(reason) = frame.finish_reason {
            let terminal = reason.is_terminal();
            if let Some(builder) = self.builders.get_mut(&key) {
                builder.finish_reason = Some(reason);
            }
            if terminal {
                if let Some(done) = self.take(&key) {
                    events.push(MergeEvent::Completed(done.finalize()));
                }
            }
        }

        events
    }

    /// The stream ended: finalize every open message, oldest first.
    pub fn finish(&mut self) -> Vec<MergedMessage> {
        let keys = std::mem::take(&mut self.order);
        keys.into_iter()
            .filter_map(|key| self.builders.remove(&key))
            .map(MergedMessageBuilder::finalize)
            .collect()
    }

    /// Drop every partially merged message.
    pub fn discard(&mut self) {
        self.builders.clear();
        self.order.clear();
    }

    /// Last usage figures seen in the stream.
    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    pub fn has_open_messages(&self) -> bool {
        !self.builders.is_empty()
    }

    fn builder_for(&mut self, key: &ResponseKey) -> &mut MergedMessageBuilder {
        if !self.builders.contains_key(key) {
            self.order.push(key.clone());
        }
        self.builders
            .entry(key.clone())
            .or_insert_with(|| MergedMessageBuilder::new(key.clone()))
    }

    fn take(&mut self, key: &ResponseKey) -> Option<MergedMessageBuilder> {
        self.order.retain(|k| k != key);
        self.builders.remove(key)
    }
}
