// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Deterministic mock adapters for tests.
//!
//! [`MockAdapter`] echoes the last user message.  [`ScriptedMockAdapter`]
//! replays pre-recorded event scripts — including tool calls, failures, and
//! a cancellation barrier — and records every [`Context`] it was called
//! with so tests can assert exactly what would have gone over the wire.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::accumulate::MessageAccumulator;
use crate::adapter::ProviderAdapter;
use crate::event_stream::{assistant_message_event_stream, AssistantMessageEventStream};
use crate::types::{
    Context, DoneReason, ErrorReason, Message, Model, SimpleStreamOptions, StreamOptions,
};

/// One scripted occurrence during a mock turn.
#[derive(Debug, Clone)]
pub enum MockEvent {
    /// A text delta.
    Text(String),
    /// A thinking delta.
    Thinking(String),
    /// A complete tool call.
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    /// Reported token usage.
    Usage { input: u64, output: u64 },
    /// Park until the call's cancel token fires; the turn then terminates
    /// with `aborted`.  Without a token this is a no-op.
    AwaitCancel,
    /// Terminal failure with the given error message.
    Fail(String),
}

/// Echoes the last user message.  Registered under the `"mock"` api.
#[derive(Default)]
pub struct MockAdapter;

impl ProviderAdapter for MockAdapter {
    fn api(&self) -> &'static str {
        "mock"
    }

    fn stream(
        &self,
        model: Model,
        context: Context,
        _options: StreamOptions,
    ) -> AssistantMessageEventStream {
        let stream = assistant_message_event_stream();
        let out = stream.clone();
        tokio::spawn(async move {
            let reply = context
                .messages
                .iter()
                .rev()
                .find_map(|m| match m {
                    Message::User(u) => Some(u.content.to_text()),
                    _ => None,
                })
                .unwrap_or_else(|| "[no input]".into());
            let mut acc = MessageAccumulator::begin(&model, out);
            acc.append_text(&format!("MOCK: {reply}"));
            acc.usage_mut().input = 10;
            acc.usage_mut().output = 10;
            acc.finish(DoneReason::Stop);
        });
        stream
    }

    fn stream_simple(
        &self,
        model: Model,
        context: Context,
        _options: SimpleStreamOptions,
    ) -> AssistantMessageEventStream {
        self.stream(model, context, StreamOptions::default())
    }
}

/// Replays scripts in order, one script per call.
pub struct ScriptedMockAdapter {
    scripts: Arc<Mutex<VecDeque<Vec<MockEvent>>>>,
    /// Every context seen, in call order.
    pub contexts: Arc<Mutex<Vec<Context>>>,
}

impl ScriptedMockAdapter {
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// event sequence for that call.
    pub fn new(scripts: Vec<Vec<MockEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            contexts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: always reply with a single text message.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            MockEvent::Text(reply.into()),
            MockEvent::Usage {
                input: 5,
                output: 5,
            },
        ]])
    }

    /// Convenience: one tool call, then (after the result comes back) a
    /// final text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![MockEvent::ToolCall {
                id: tool_id.into(),
                name: tool_name.into(),
                arguments,
            }],
            vec![MockEvent::Text(final_text.into())],
        ])
    }

    /// The last context this adapter was called with.
    pub fn last_context(&self) -> Option<Context> {
        self.contexts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last()
            .cloned()
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.contexts.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl ProviderAdapter for ScriptedMockAdapter {
    fn api(&self) -> &'static str {
        "scripted-mock"
    }

    fn stream(
        &self,
        model: Model,
        context: Context,
        options: StreamOptions,
    ) -> AssistantMessageEventStream {
        self.contexts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(context);

        let script = {
            let mut scripts = self.scripts.lock().unwrap_or_else(|p| p.into_inner());
            scripts.pop_front().unwrap_or_else(|| {
                vec![MockEvent::Text("[no more scripts]".into())]
            })
        };

        let stream = assistant_message_event_stream();
        let out = stream.clone();
        tokio::spawn(async move {
            let cancel = options.cancel.clone();
            let mut acc = MessageAccumulator::begin(&model, out);
            for event in script {
                if cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                    acc.fail(ErrorReason::Aborted, "aborted");
                    return;
                }
                match event {
                    MockEvent::Text(t) => acc.append_text(&t),
                    MockEvent::Thinking(t) => acc.append_thinking(&t),
                    MockEvent::ToolCall {
                        id,
                        name,
                        arguments,
                    } => {
                        acc.begin_tool_call(&id, &name);
                        acc.append_tool_args(&arguments.to_string());
                        acc.close_open_block();
                    }
                    MockEvent::Usage { input, output } => {
                        acc.usage_mut().input = input;
                        acc.usage_mut().output = output;
                    }
                    MockEvent::AwaitCancel => {
                        if let Some(token) = &cancel {
                            token.cancelled().await;
                            acc.fail(ErrorReason::Aborted, "aborted");
                            return;
                        }
                    }
                    MockEvent::Fail(message) => {
                        acc.fail(ErrorReason::Error, message);
                        return;
                    }
                }
                tokio::task::yield_now().await;
            }
            let reason = if acc.has_tool_calls() {
                DoneReason::ToolUse
            } else {
                DoneReason::Stop
            };
            acc.finish(reason);
        });
        stream
    }

    fn stream_simple(
        &self,
        model: Model,
        context: Context,
        options: SimpleStreamOptions,
    ) -> AssistantMessageEventStream {
        let base = StreamOptions {
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            api_key: options.api_key,
            cache_retention: options.cache_retention,
            session_id: options.session_id,
            headers: options.headers,
            max_retry_delay_ms: options.max_retry_delay_ms,
            cancel: options.cancel,
        };
        self.stream(model, context, base)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
