// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Incremental construction of an [`AssistantMessage`] during streaming.
//!
//! Adapters feed raw provider deltas into a [`MessageAccumulator`]; the
//! accumulator maintains the growing `partial` message and pushes the
//! uniform `*_start` / `*_delta` / `*_end` event sequence with correct
//! `content_index` values.  Delta events for a block always appear strictly
//! between that block's start and end events.

use serde_json::Value;

use crate::event_stream::AssistantMessageEventStream;
use crate::json::parse_streaming_json_object;
use crate::types::{
    AssistantMessage, AssistantMessageEvent, ContentBlock, DoneReason, ErrorReason, Model,
    StopReason, ToolCallRequest, Usage,
};

enum OpenBlock {
    Text,
    Thinking,
    Tool { args_buf: String },
}

/// Builds the partial assistant message and emits streaming events.
pub struct MessageAccumulator {
    stream: AssistantMessageEventStream,
    partial: AssistantMessage,
    open: Option<OpenBlock>,
}

impl MessageAccumulator {
    /// Create an accumulator and emit the `start` handshake with an empty
    /// partial message stamped with the model's identity.
    pub fn begin(model: &Model, stream: AssistantMessageEventStream) -> Self {
        let partial = AssistantMessage::empty_for(model);
        stream.push(AssistantMessageEvent::Start {
            partial: partial.clone(),
        });
        Self {
            stream,
            partial,
            open: None,
        }
    }

    /// Index of the currently open block.
    fn open_index(&self) -> usize {
        self.partial.content.len() - 1
    }

    /// Append a text delta, opening a text block first when the current
    /// block is of a different kind.
    pub fn append_text(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        if !matches!(self.open, Some(OpenBlock::Text)) {
            self.close_open_block();
            self.partial.content.push(ContentBlock::text(""));
            self.open = Some(OpenBlock::Text);
            self.stream.push(AssistantMessageEvent::TextStart {
                content_index: self.open_index(),
                partial: self.partial.clone(),
            });
        }
        let index = self.open_index();
        if let Some(ContentBlock::Text { text, .. }) = self.partial.content.last_mut() {
            text.push_str(delta);
        }
        self.stream.push(AssistantMessageEvent::TextDelta {
            content_index: index,
            delta: delta.to_string(),
            partial: self.partial.clone(),
        });
    }

    /// Append a thinking delta, opening a thinking block as needed.
    pub fn append_thinking(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        if !matches!(self.open, Some(OpenBlock::Thinking)) {
            self.close_open_block();
            self.partial.content.push(ContentBlock::thinking(""));
            self.open = Some(OpenBlock::Thinking);
            self.stream.push(AssistantMessageEvent::ThinkingStart {
                content_index: self.open_index(),
                partial: self.partial.clone(),
            });
        }
        let index = self.open_index();
        if let Some(ContentBlock::Thinking { thinking, .. }) = self.partial.content.last_mut() {
            thinking.push_str(delta);
        }
        self.stream.push(AssistantMessageEvent::ThinkingDelta {
            content_index: index,
            delta: delta.to_string(),
            partial: self.partial.clone(),
        });
    }

    /// Attach a signature to the open (or most recent) thinking block.
    pub fn set_thinking_signature(&mut self, signature: &str) {
        if signature.is_empty() {
            return;
        }
        for block in self.partial.content.iter_mut().rev() {
            if let ContentBlock::Thinking {
                thinking_signature, ..
            } = block
            {
                let combined = match thinking_signature.take() {
                    // Signature fragments stream in pieces on some providers.
                    Some(existing) => format!("{existing}{signature}"),
                    None => signature.to_string(),
                };
                *thinking_signature = Some(combined);
                return;
            }
        }
    }

    /// Attach a signature to the most recent text block.
    pub fn set_text_signature(&mut self, signature: &str) {
        if signature.is_empty() {
            return;
        }
        for block in self.partial.content.iter_mut().rev() {
            if let ContentBlock::Text { text_signature, .. } = block {
                *text_signature = Some(signature.to_string());
                return;
            }
        }
    }

    /// Open a tool-call block.  Arguments accumulate via
    /// [`MessageAccumulator::append_tool_args`].
    pub fn begin_tool_call(&mut self, id: &str, name: &str) {
        self.close_open_block();
        self.partial.content.push(ContentBlock::ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: Value::Object(Default::default()),
            thought_signature: None,
        });
        self.open = Some(OpenBlock::Tool {
            args_buf: String::new(),
        });
        self.stream.push(AssistantMessageEvent::ToolcallStart {
            content_index: self.open_index(),
            partial: self.partial.clone(),
        });
    }

    /// Append a fragment of the streamed JSON arguments.
    pub fn append_tool_args(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        if !matches!(self.open, Some(OpenBlock::Tool { .. })) {
            return;
        }
        let index = self.open_index();
        if let Some(OpenBlock::Tool { args_buf }) = &mut self.open {
            args_buf.push_str(fragment);
            // Keep the partial's view of the arguments current so consumers
            // rendering in-flight tool calls see the best available parse.
            let parsed = parse_streaming_json_object(args_buf);
            if let Some(ContentBlock::ToolCall { arguments, .. }) = self.partial.content.last_mut()
            {
                *arguments = parsed;
            }
            self.stream.push(AssistantMessageEvent::ToolcallDelta {
                content_index: index,
                delta: fragment.to_string(),
                partial: self.partial.clone(),
            });
        }
    }

    /// Attach a thought signature to the open (or most recent) tool call.
    pub fn set_tool_signature(&mut self, signature: &str) {
        if signature.is_empty() {
            return;
        }
        for block in self.partial.content.iter_mut().rev() {
            if let ContentBlock::ToolCall {
                thought_signature, ..
            } = block
            {
                *thought_signature = Some(signature.to_string());
                return;
            }
        }
    }

    /// Close whatever block is open, emitting its `*_end` event.  The end
    /// event for a tool call always carries a parsed JSON object.
    pub fn close_open_block(&mut self) {
        let Some(open) = self.open.take() else {
            return;
        };
        let index = self.open_index();
        match open {
            OpenBlock::Text => {
                let content = match self.partial.content.last() {
                    Some(ContentBlock::Text { text, .. }) => text.clone(),
                    _ => String::new(),
                };
                self.stream.push(AssistantMessageEvent::TextEnd {
                    content_index: index,
                    content,
                    partial: self.partial.clone(),
                });
            }
            OpenBlock::Thinking => {
                let content = match self.partial.content.last() {
                    Some(ContentBlock::Thinking { thinking, .. }) => thinking.clone(),
                    _ => String::new(),
                };
                self.stream.push(AssistantMessageEvent::ThinkingEnd {
                    content_index: index,
                    content,
                    partial: self.partial.clone(),
                });
            }
            OpenBlock::Tool { args_buf } => {
                let arguments = parse_streaming_json_object(&args_buf);
                let request = match self.partial.content.last_mut() {
                    Some(ContentBlock::ToolCall {
                        id,
                        name,
                        arguments: slot,
                        thought_signature,
                    }) => {
                        *slot = arguments.clone();
                        ToolCallRequest {
                            id: id.clone(),
                            name: name.clone(),
                            arguments,
                            thought_signature: thought_signature.clone(),
                        }
                    }
                    _ => return,
                };
                self.stream.push(AssistantMessageEvent::ToolcallEnd {
                    content_index: index,
                    tool_call: request,
                    partial: self.partial.clone(),
                });
            }
        }
    }

    pub fn set_usage(&mut self, usage: Usage) {
        self.partial.usage = usage;
    }

    pub fn usage_mut(&mut self) -> &mut Usage {
        &mut self.partial.usage
    }

    /// Whether the partial contains at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.partial
            .content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolCall { .. }))
    }

    /// Read access to the partial message being built.
    pub fn partial(&self) -> &AssistantMessage {
        &self.partial
    }

    /// Terminate successfully: close any open block, stamp the stop reason,
    /// and emit `done`.
    pub fn finish(mut self, reason: DoneReason) -> AssistantMessage {
        self.close_open_block();
        self.partial.stop_reason = reason.into();
        let message = self.partial.clone();
        self.stream.push(AssistantMessageEvent::Done {
            reason,
            message: message.clone(),
        });
        message
    }

    /// Terminate with a failure: the partial content is preserved on the
    /// error-annotated message so consumers can display what arrived.
    pub fn fail(mut self, reason: ErrorReason, error_message: impl Into<String>) -> AssistantMessage {
        self.close_open_block();
        self.partial.stop_reason = match reason {
            ErrorReason::Aborted => StopReason::Aborted,
            ErrorReason::Error => StopReason::Error,
        };
        self.partial.error_message = Some(error_message.into());
        let message = self.partial.clone();
        self.stream.push(AssistantMessageEvent::Error {
            reason,
            error: message.clone(),
        });
        message
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
