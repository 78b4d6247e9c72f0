// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic Messages adapter.
//!
//! System prompt travels as a top-level `system` field, thinking blocks are
//! replayed with their signatures when continuing with the same model, and
//! extended thinking is enabled via a token budget.
//!
//! # Endpoint
//! `POST {base_url}/v1/messages` with SSE streaming.

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use tracing::debug;

use crate::accumulate::MessageAccumulator;
use crate::adapter::ProviderAdapter;
use crate::catalog::{calculate_cost, supports_xhigh};
use crate::event_stream::{assistant_message_event_stream, AssistantMessageEventStream};
use crate::http::{error_body, send_with_retry, SseReader};
use crate::options::{adjust_max_tokens_for_thinking, build_base_options, clamp_reasoning};
use crate::sanitize::scrub_text;
use crate::transform::{transform_messages, TransformOptions};
use crate::types::{
    CacheRetention, ContentBlock, Context, DoneReason, ErrorReason, Message, Model,
    SimpleStreamOptions, StreamOptions, ThinkingLevel, UserContent,
};

pub struct AnthropicMessagesAdapter;

impl AnthropicMessagesAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AnthropicMessagesAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for AnthropicMessagesAdapter {
    fn api(&self) -> &'static str {
        "anthropic-messages"
    }

    fn stream(
        &self,
        model: Model,
        context: Context,
        options: StreamOptions,
    ) -> AssistantMessageEventStream {
        spawn_stream(model, context, options, None)
    }

    fn stream_simple(
        &self,
        model: Model,
        context: Context,
        options: SimpleStreamOptions,
    ) -> AssistantMessageEventStream {
        let mut base = build_base_options(&model, &options);
        let mut thinking_budget = None;
        if model.reasoning {
            if let Some(level) = options.reasoning {
                let level = if supports_xhigh(&model) {
                    level
                } else {
                    clamp_reasoning(level)
                };
                if level != ThinkingLevel::Off {
                    let (max_tokens, budget) = adjust_max_tokens_for_thinking(
                        base.max_tokens.unwrap_or(0),
                        level,
                        options.thinking_budgets.as_ref(),
                    );
                    base.max_tokens = Some(max_tokens);
                    thinking_budget = Some(budget);
                }
            }
        }
        spawn_stream(model, context, base, thinking_budget)
    }
}

fn spawn_stream(
    model: Model,
    context: Context,
    options: StreamOptions,
    thinking_budget: Option<u32>,
) -> AssistantMessageEventStream {
    let stream = assistant_message_event_stream();
    let out = stream.clone();
    tokio::spawn(async move {
        let cancel = options.cancel.clone();
        let mut acc = MessageAccumulator::begin(&model, out);
        let driven = match &cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(anyhow!("aborted")),
                    r = drive(&model, &context, &options, thinking_budget, &mut acc) => r,
                }
            }
            None => drive(&model, &context, &options, thinking_budget, &mut acc).await,
        };
        match driven {
            Ok(reason) => {
                calculate_cost(&model, acc.usage_mut());
                acc.finish(reason);
            }
            Err(e) => {
                let aborted = cancel.as_ref().is_some_and(|t| t.is_cancelled());
                let reason = if aborted {
                    ErrorReason::Aborted
                } else {
                    ErrorReason::Error
                };
                acc.fail(reason, e.to_string());
            }
        }
    });
    stream
}

async fn drive(
    model: &Model,
    context: &Context,
    options: &StreamOptions,
    thinking_budget: Option<u32>,
    acc: &mut MessageAccumulator,
) -> Result<DoneReason> {
    let api_key = options
        .api_key
        .as_deref()
        .ok_or_else(|| anyhow!("No API key for provider: {}", model.provider))?;

    let body = build_request_body(model, context, options, thinking_budget);
    debug!(model = %model.id, thinking_budget, "sending anthropic request");

    let client = crate::http::client();
    let resp = send_with_retry(
        || {
            let mut req = client
                .post(format!("{}/v1/messages", model.base_url))
                .header("x-api-key", api_key)
                .header("anthropic-version", "2023-06-01");
            // Multiple beta features are enabled via a comma-separated value.
            // The prompt-caching beta is required on older Claude models and
            // harmless on newer ones; the extended-TTL beta gates the 1-hour
            // cache window.
            if options.cache_retention != CacheRetention::None {
                let mut betas = vec!["prompt-caching-2024-07-31"];
                if options.cache_retention == CacheRetention::Long {
                    betas.push("extended-cache-ttl-2025-04-11");
                }
                req = req.header("anthropic-beta", betas.join(","));
            }
            for (k, v) in model.headers.iter().flatten() {
                req = req.header(k.as_str(), v.as_str());
            }
            for (k, v) in options.headers.iter().flatten() {
                req = req.header(k.as_str(), v.as_str());
            }
            req.json(&body)
        },
        options.max_retry_delay_ms,
        options.cancel.as_ref(),
    )
    .await?;

    if !resp.status().is_success() {
        bail!("Anthropic error {}", error_body(resp).await);
    }

    let mut reader = SseReader::new(resp.bytes_stream());
    let mut state = TurnState::default();
    while let Some(data) = reader.next_data().await {
        let data = data?;
        let Ok(v) = serde_json::from_str::<Value>(&data) else {
            continue;
        };
        apply_sse_event(&v, acc, &mut state)?;
        if state.finished {
            break;
        }
    }

    Ok(state.reason())
}

#[derive(Default)]
struct TurnState {
    stop_reason: Option<DoneReason>,
    finished: bool,
}

impl TurnState {
    fn reason(&self) -> DoneReason {
        self.stop_reason.unwrap_or(DoneReason::Stop)
    }
}

/// Apply one decoded SSE event to the accumulating message.
fn apply_sse_event(v: &Value, acc: &mut MessageAccumulator, state: &mut TurnState) -> Result<()> {
    match v["type"].as_str().unwrap_or("") {
        "message_start" => {
            if let Some(usage) = v["message"].get("usage") {
                let u = acc.usage_mut();
                u.input = usage["input_tokens"].as_u64().unwrap_or(0);
                // Anthropic reports cache counters only in message_start.
                u.cache_read = usage["cache_read_input_tokens"].as_u64().unwrap_or(0);
                u.cache_write = usage["cache_creation_input_tokens"].as_u64().unwrap_or(0);
            }
        }
        "content_block_start" => {
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                let id = block["id"].as_str().unwrap_or("");
                let name = block["name"].as_str().unwrap_or("");
                acc.begin_tool_call(id, name);
            }
        }
        "content_block_delta" => {
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => acc.append_text(delta["text"].as_str().unwrap_or("")),
                "thinking_delta" => acc.append_thinking(delta["thinking"].as_str().unwrap_or("")),
                "input_json_delta" => {
                    acc.append_tool_args(delta["partial_json"].as_str().unwrap_or(""))
                }
                // The opaque integrity blob closing every thinking block.
                // Stored for replay, never surfaced as readable text.
                "signature_delta" => {
                    acc.set_thinking_signature(delta["signature"].as_str().unwrap_or(""))
                }
                _ => {}
            }
        }
        "content_block_stop" => acc.close_open_block(),
        "message_delta" => {
            if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                state.stop_reason = Some(map_stop_reason(reason));
            }
            if let Some(usage) = v.get("usage") {
                acc.usage_mut().output = usage["output_tokens"].as_u64().unwrap_or(0);
            }
        }
        "message_stop" => state.finished = true,
        "error" => {
            let message = v["error"]["message"]
                .as_str()
                .unwrap_or("unknown Anthropic stream error");
            return Err(anyhow!("Anthropic error: {message}"));
        }
        // ping and unknown event types are ignored
        _ => {}
    }
    Ok(())
}

fn map_stop_reason(reason: &str) -> DoneReason {
    match reason {
        "max_tokens" => DoneReason::Length,
        "tool_use" => DoneReason::ToolUse,
        _ => DoneReason::Stop,
    }
}

/// Convert the context to the Anthropic Messages request body.
pub(crate) fn build_request_body(
    model: &Model,
    context: &Context,
    options: &StreamOptions,
    thinking_budget: Option<u32>,
) -> Value {
    let messages = convert_messages(model, context);

    let mut body = json!({
        "model": model.id,
        "messages": messages,
        "max_tokens": options.max_tokens.unwrap_or(4096),
        "stream": true,
    });

    if let Some(t) = options.temperature {
        body["temperature"] = json!(t);
    }

    if let Some(system) = context.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        if options.cache_retention == CacheRetention::None {
            body["system"] = json!(scrub_text(system));
        } else {
            // A cache breakpoint on the system prompt caches the stable
            // prefix across turns.
            let cache_ctrl = if options.cache_retention == CacheRetention::Long {
                json!({ "type": "ephemeral", "ttl": "1h" })
            } else {
                json!({ "type": "ephemeral" })
            };
            body["system"] = json!([{
                "type": "text",
                "text": scrub_text(system),
                "cache_control": cache_ctrl,
            }]);
        }
    }

    if !context.tools.is_empty() {
        let tools: Vec<Value> = context
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    if let Some(budget) = thinking_budget.filter(|b| *b > 0) {
        body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
    }

    body
}

/// Convert history into the Anthropic `messages` array.  Adjacent tool
/// results collapse into one `user` turn because Anthropic groups
/// `tool_result` blocks.
fn convert_messages(model: &Model, context: &Context) -> Vec<Value> {
    let transformed = transform_messages(
        &context.messages,
        &TransformOptions {
            current_provider: &model.provider,
            current_model: &model.id,
            normalize_tool_id: None,
            convert_thinking_to_text: false,
        },
    );

    let mut out: Vec<Value> = Vec::new();
    for msg in &transformed {
        match msg {
            Message::User(user) => {
                let content = match &user.content {
                    UserContent::Text(t) => json!(scrub_text(t)),
                    UserContent::Blocks(blocks) => {
                        json!(blocks.iter().filter_map(user_block_to_wire).collect::<Vec<_>>())
                    }
                };
                out.push(json!({ "role": "user", "content": content }));
            }
            Message::Assistant(assistant) => {
                let is_same =
                    assistant.provider == model.provider && assistant.model == model.id;
                let mut content: Vec<Value> = Vec::new();
                for block in &assistant.content {
                    match block {
                        ContentBlock::Text { text, .. } => {
                            if !text.trim().is_empty() {
                                content.push(json!({ "type": "text", "text": scrub_text(text) }));
                            }
                        }
                        ContentBlock::Thinking {
                            thinking,
                            thinking_signature,
                        } => {
                            // Thinking is replayed with its signature so the
                            // server can verify reasoning continuity; without
                            // a signature (or on a model switch) it degrades
                            // to plain text.
                            match thinking_signature {
                                Some(sig) if is_same => content.push(json!({
                                    "type": "thinking",
                                    "thinking": thinking,
                                    "signature": sig,
                                })),
                                _ => {
                                    if !thinking.trim().is_empty() {
                                        content.push(
                                            json!({ "type": "text", "text": scrub_text(thinking) }),
                                        );
                                    }
                                }
                            }
                        }
                        ContentBlock::ToolCall {
                            id,
                            name,
                            arguments,
                            ..
                        } => {
                            content.push(json!({
                                "type": "tool_use",
                                "id": id,
                                "name": name,
                                "input": arguments,
                            }));
                        }
                        ContentBlock::Image { .. } => {}
                    }
                }
                if !content.is_empty() {
                    out.push(json!({ "role": "assistant", "content": content }));
                }
            }
            Message::ToolResult(tr) => {
                let content: Vec<Value> =
                    tr.content.iter().filter_map(user_block_to_wire).collect();
                let result_block = json!({
                    "type": "tool_result",
                    "tool_use_id": tr.tool_call_id,
                    "content": content,
                    "is_error": tr.is_error,
                });
                // Coalesce with a preceding tool-result-only user turn.
                if let Some(last) = out.last_mut() {
                    let is_result_group = last["role"] == "user"
                        && last["content"]
                            .as_array()
                            .is_some_and(|blocks| {
                                blocks.iter().all(|b| b["type"] == "tool_result")
                            });
                    if is_result_group {
                        last["content"]
                            .as_array_mut()
                            .expect("checked above")
                            .push(result_block);
                        continue;
                    }
                }
                out.push(json!({ "role": "user", "content": [result_block] }));
            }
        }
    }
    out
}

fn user_block_to_wire(block: &ContentBlock) -> Option<Value> {
    match block {
        ContentBlock::Text { text, .. } => Some(json!({ "type": "text", "text": scrub_text(text) })),
        ContentBlock::Image { data, mime_type } => Some(json!({
            "type": "image",
            "source": { "type": "base64", "media_type": mime_type, "data": data },
        })),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
