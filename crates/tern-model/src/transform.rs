// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Message transformation applied before every provider call.
//!
//! One pass enforces the wire invariants shared by all adapters:
//! - assistant messages that ended in `error`/`aborted` are dropped (they are
//!   kept in sessions for display only),
//! - a tool call with no result before the next user message receives a
//!   synthetic "Interrupted by user message" result so the pairing invariant
//!   holds,
//! - empty thinking blocks are dropped,
//! - signatures are stripped when the message came from a different
//!   (provider, model) than the current call — signatures are scoped to the
//!   model that produced them and must never be replayed elsewhere,
//! - tool-call ids are run through a provider-specific normaliser, in both
//!   the assistant message and any referencing tool result.

use crate::types::{AssistantMessage, ContentBlock, Message, ToolResultMessage};

/// Per-call transform configuration.
pub struct TransformOptions<'a> {
    /// Identity of the model this context is being converted for.
    pub current_provider: &'a str,
    pub current_model: &'a str,
    /// Provider-specific tool-call id normaliser.
    pub normalize_tool_id: Option<&'a (dyn Fn(&str) -> String + Sync)>,
    /// Replace thinking blocks with delimited text (for providers with no
    /// native thinking replay).
    pub convert_thinking_to_text: bool,
}

impl Default for TransformOptions<'_> {
    fn default() -> Self {
        Self {
            current_provider: "",
            current_model: "",
            normalize_tool_id: None,
            convert_thinking_to_text: false,
        }
    }
}

/// Transform `messages` for API compatibility.  See the module docs for the
/// full rule set.
pub fn transform_messages(messages: &[Message], opts: &TransformOptions) -> Vec<Message> {
    let mut result: Vec<Message> = Vec::with_capacity(messages.len());
    // Tool calls awaiting a result, in emission order: (id, name).
    let mut pending: Vec<(String, String)> = Vec::new();

    for msg in messages {
        match msg {
            Message::Assistant(assistant) => {
                if assistant.stop_reason.is_failure() {
                    continue;
                }
                result.push(Message::Assistant(transform_assistant(
                    assistant,
                    opts,
                    &mut pending,
                )));
            }
            Message::ToolResult(tr) => {
                let mut tr = tr.clone();
                if let Some(normalize) = opts.normalize_tool_id {
                    tr.tool_call_id = normalize(&tr.tool_call_id);
                }
                pending.retain(|(id, _)| *id != tr.tool_call_id);
                result.push(Message::ToolResult(tr));
            }
            Message::User(user) => {
                // Close out dangling tool calls before the interrupting user
                // message so tool_call ↔ tool_result pairing survives.
                for (id, name) in pending.drain(..) {
                    result.push(Message::ToolResult(ToolResultMessage {
                        tool_call_id: id,
                        tool_name: name,
                        content: vec![ContentBlock::text("Interrupted by user message")],
                        details: serde_json::Value::Null,
                        is_error: false,
                        timestamp: user.timestamp,
                    }));
                }
                result.push(msg.clone());
            }
        }
    }

    result
}

fn transform_assistant(
    assistant: &AssistantMessage,
    opts: &TransformOptions,
    pending: &mut Vec<(String, String)>,
) -> AssistantMessage {
    let same_model =
        assistant.provider == opts.current_provider && assistant.model == opts.current_model;

    let mut out = assistant.clone();
    let mut content = Vec::with_capacity(out.content.len());

    for block in out.content.drain(..) {
        match block {
            ContentBlock::ToolCall {
                id,
                name,
                arguments,
                thought_signature,
            } => {
                let id = match opts.normalize_tool_id {
                    Some(normalize) => normalize(&id),
                    None => id,
                };
                pending.push((id.clone(), name.clone()));
                content.push(ContentBlock::ToolCall {
                    id,
                    name,
                    arguments,
                    thought_signature: if same_model { thought_signature } else { None },
                });
            }
            ContentBlock::Thinking {
                thinking,
                thinking_signature,
            } => {
                if opts.convert_thinking_to_text {
                    if !thinking.is_empty() {
                        content.push(ContentBlock::text(format!("<thinking>\n{thinking}\n</thinking>")));
                    }
                } else {
                    let signature = if same_model { thinking_signature } else { None };
                    // An empty thinking block with no signature carries
                    // nothing worth replaying.
                    if !thinking.is_empty() || signature.is_some() {
                        content.push(ContentBlock::Thinking {
                            thinking,
                            thinking_signature: signature,
                        });
                    }
                }
            }
            ContentBlock::Text {
                text,
                text_signature,
            } => {
                content.push(ContentBlock::Text {
                    text,
                    text_signature: if same_model { text_signature } else { None },
                });
            }
            other => content.push(other),
        }
    }

    out.content = content;
    out
}

/// Restrict a tool-call id to `[A-Za-z0-9_-]`, capped at 64 characters —
/// the character set Google-backed providers accept.
pub fn restrict_tool_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InputModality, Model, ModelCost, StopReason};
    use serde_json::json;

    fn model() -> Model {
        Model {
            id: "current-model".into(),
            name: "M".into(),
            api: "mock".into(),
            provider: "current-provider".into(),
            base_url: String::new(),
            reasoning: true,
            input: vec![InputModality::Text],
            cost: ModelCost::default(),
            context_window: 0,
            max_tokens: 0,
            headers: None,
            compat: None,
        }
    }

    fn assistant_with(content: Vec<ContentBlock>) -> Message {
        let mut m = AssistantMessage::empty_for(&model());
        m.content = content;
        Message::Assistant(m)
    }

    fn current_opts() -> TransformOptions<'static> {
        TransformOptions {
            current_provider: "current-provider",
            current_model: "current-model",
            normalize_tool_id: None,
            convert_thinking_to_text: false,
        }
    }

    #[test]
    fn errored_assistant_messages_are_dropped() {
        let mut err = AssistantMessage::empty_for(&model());
        err.stop_reason = StopReason::Error;
        err.error_message = Some("boom".into());
        let mut aborted = AssistantMessage::empty_for(&model());
        aborted.stop_reason = StopReason::Aborted;

        let msgs = vec![
            Message::user("q"),
            Message::Assistant(err),
            Message::Assistant(aborted),
            assistant_with(vec![ContentBlock::text("ok")]),
        ];
        let out = transform_messages(&msgs, &current_opts());
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].as_assistant().unwrap().text(), "ok");
    }

    #[test]
    fn dangling_tool_call_gets_synthetic_result_before_user_message() {
        let msgs = vec![
            assistant_with(vec![ContentBlock::tool_call("t1", "ls", json!({}))]),
            Message::user("never mind, do something else"),
        ];
        let out = transform_messages(&msgs, &current_opts());
        assert_eq!(out.len(), 3);
        match &out[1] {
            Message::ToolResult(tr) => {
                assert_eq!(tr.tool_call_id, "t1");
                assert_eq!(tr.tool_name, "ls");
                assert!(!tr.is_error);
                assert_eq!(
                    tr.content[0].as_text(),
                    Some("Interrupted by user message")
                );
            }
            other => panic!("expected synthetic tool result, got {other:?}"),
        }
        assert_eq!(out[2].role(), "user");
    }

    #[test]
    fn answered_tool_call_gets_no_synthetic_result() {
        let msgs = vec![
            assistant_with(vec![ContentBlock::tool_call("t1", "ls", json!({}))]),
            Message::tool_result("t1", "ls", vec![ContentBlock::text("out")], false),
            Message::user("thanks"),
        ];
        let out = transform_messages(&msgs, &current_opts());
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].role(), "user");
    }

    #[test]
    fn empty_thinking_blocks_are_dropped() {
        let msgs = vec![assistant_with(vec![
            ContentBlock::Thinking {
                thinking: String::new(),
                thinking_signature: None,
            },
            ContentBlock::text("answer"),
        ])];
        let out = transform_messages(&msgs, &current_opts());
        let content = &out[0].as_assistant().unwrap().content;
        assert_eq!(content.len(), 1);
        assert_eq!(content[0].as_text(), Some("answer"));
    }

    #[test]
    fn empty_thinking_with_signature_is_kept() {
        let msgs = vec![assistant_with(vec![ContentBlock::Thinking {
            thinking: String::new(),
            thinking_signature: Some("sig".into()),
        }])];
        let out = transform_messages(&msgs, &current_opts());
        assert_eq!(out[0].as_assistant().unwrap().content.len(), 1);
    }

    #[test]
    fn signatures_stripped_when_model_differs() {
        let mut foreign = AssistantMessage::empty_for(&model());
        foreign.model = "other-model".into();
        foreign.content = vec![
            ContentBlock::Text {
                text: "t".into(),
                text_signature: Some("ts".into()),
            },
            ContentBlock::Thinking {
                thinking: "th".into(),
                thinking_signature: Some("hs".into()),
            },
            ContentBlock::ToolCall {
                id: "t1".into(),
                name: "ls".into(),
                arguments: json!({}),
                thought_signature: Some("gs".into()),
            },
        ];
        let out = transform_messages(&[Message::Assistant(foreign)], &current_opts());
        let content = &out[0].as_assistant().unwrap().content;
        assert!(matches!(
            &content[0],
            ContentBlock::Text { text_signature: None, .. }
        ));
        assert!(matches!(
            &content[1],
            ContentBlock::Thinking { thinking_signature: None, .. }
        ));
        assert!(matches!(
            &content[2],
            ContentBlock::ToolCall { thought_signature: None, .. }
        ));
    }

    #[test]
    fn signatures_kept_when_model_matches() {
        let msgs = vec![assistant_with(vec![ContentBlock::ToolCall {
            id: "t1".into(),
            name: "ls".into(),
            arguments: json!({}),
            thought_signature: Some("sig".into()),
        }])];
        let out = transform_messages(&msgs, &current_opts());
        assert!(matches!(
            &out[0].as_assistant().unwrap().content[0],
            ContentBlock::ToolCall { thought_signature: Some(s), .. } if s == "sig"
        ));
    }

    #[test]
    fn provider_mismatch_alone_strips_signatures() {
        let msgs = vec![assistant_with(vec![ContentBlock::ToolCall {
            id: "t1".into(),
            name: "ls".into(),
            arguments: json!({}),
            thought_signature: Some("sig".into()),
        }])];
        let opts = TransformOptions {
            current_provider: "different-provider",
            current_model: "current-model",
            ..TransformOptions::default()
        };
        let out = transform_messages(&msgs, &opts);
        assert!(matches!(
            &out[0].as_assistant().unwrap().content[0],
            ContentBlock::ToolCall { thought_signature: None, .. }
        ));
    }

    #[test]
    fn thinking_converted_to_delimited_text_when_requested() {
        let msgs = vec![assistant_with(vec![ContentBlock::thinking("step 1")])];
        let opts = TransformOptions {
            current_provider: "current-provider",
            current_model: "current-model",
            convert_thinking_to_text: true,
            ..TransformOptions::default()
        };
        let out = transform_messages(&msgs, &opts);
        let content = &out[0].as_assistant().unwrap().content;
        assert_eq!(content[0].as_text(), Some("<thinking>\nstep 1\n</thinking>"));
    }

    #[test]
    fn id_normaliser_applies_to_calls_and_results() {
        let msgs = vec![
            assistant_with(vec![ContentBlock::tool_call("call/1", "ls", json!({}))]),
            Message::tool_result("call/1", "ls", vec![], false),
        ];
        let normalize = |id: &str| restrict_tool_id(id);
        let opts = TransformOptions {
            current_provider: "current-provider",
            current_model: "current-model",
            normalize_tool_id: Some(&normalize),
            ..TransformOptions::default()
        };
        let out = transform_messages(&msgs, &opts);
        match &out[0].as_assistant().unwrap().content[0] {
            ContentBlock::ToolCall { id, .. } => assert_eq!(id, "call_1"),
            other => panic!("unexpected block: {other:?}"),
        }
        match &out[1] {
            Message::ToolResult(tr) => assert_eq!(tr.tool_call_id, "call_1"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    // ── restrict_tool_id ──────────────────────────────────────────────────────

    #[test]
    fn restrict_tool_id_replaces_invalid_chars() {
        assert_eq!(restrict_tool_id("foo/bar baz!"), "foo_bar_baz_");
    }

    #[test]
    fn restrict_tool_id_caps_at_64_chars() {
        let long = "a".repeat(100);
        assert_eq!(restrict_tool_id(&long).len(), 64);
    }

    #[test]
    fn restrict_tool_id_keeps_valid_ids_unchanged() {
        assert_eq!(restrict_tool_id("toolu_01AbC-2"), "toolu_01AbC-2");
    }
}
