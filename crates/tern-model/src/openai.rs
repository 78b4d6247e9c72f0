// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI Responses adapter, shared by the OpenAI and Azure dialects and
//! reused by the Codex dialect.
//!
//! Messages become an `input` array of role-tagged items with typed content
//! parts.  Reasoning models get `reasoning.effort` + `reasoning.summary`,
//! and encrypted reasoning content is requested and replayed so the server
//! can maintain reasoning continuity across turns without retaining state.

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use tracing::debug;

use crate::accumulate::MessageAccumulator;
use crate::adapter::ProviderAdapter;
use crate::catalog::{calculate_cost, supports_xhigh};
use crate::event_stream::{assistant_message_event_stream, AssistantMessageEventStream};
use crate::http::{error_body, send_with_retry, SseReader};
use crate::options::{build_base_options, clamp_reasoning, effort_label, model_effort_policy};
use crate::sanitize::scrub_text;
use crate::transform::{transform_messages, TransformOptions};
use crate::types::{
    CacheRetention, ContentBlock, Context, DoneReason, ErrorReason, Message, Model,
    SimpleStreamOptions, StreamOptions, UserContent,
};

pub struct OpenAiResponsesAdapter {
    api: &'static str,
}

impl OpenAiResponsesAdapter {
    pub fn openai() -> Self {
        Self {
            api: "openai-responses",
        }
    }

    pub fn azure() -> Self {
        Self {
            api: "azure-openai-responses",
        }
    }
}

impl ProviderAdapter for OpenAiResponsesAdapter {
    fn api(&self) -> &'static str {
        self.api
    }

    fn stream(
        &self,
        model: Model,
        context: Context,
        options: StreamOptions,
    ) -> AssistantMessageEventStream {
        spawn_stream(model, context, options, None, RequestStyle::Standard)
    }

    fn stream_simple(
        &self,
        model: Model,
        context: Context,
        options: SimpleStreamOptions,
    ) -> AssistantMessageEventStream {
        let effort = resolve_effort(&model, &options);
        let base = build_base_options(&model, &options);
        spawn_stream(model, context, base, effort, RequestStyle::Standard)
    }
}

/// Translate the internal thinking level into a Responses effort label,
/// applying per-model clamping.
pub(crate) fn resolve_effort(
    model: &Model,
    options: &SimpleStreamOptions,
) -> Option<&'static str> {
    if !model.reasoning {
        return None;
    }
    let level = options.reasoning?;
    let level = model_effort_policy(&model.id, level);
    let level = if supports_xhigh(model) {
        level
    } else {
        clamp_reasoning(level)
    };
    // xhigh survives only on models that accept it; the wire label is the
    // level name itself in that case.
    if level == crate::types::ThinkingLevel::Xhigh {
        return Some("xhigh");
    }
    effort_label(level)
}

/// Differences between the plain Responses endpoint and the Codex variant.
#[derive(Clone, Copy, PartialEq)]
pub(crate) enum RequestStyle {
    Standard,
    /// ChatGPT-backend Codex endpoint: bearer auth plus a
    /// `chatgpt-account-id` header extracted from the token.
    Codex,
}

pub(crate) fn spawn_stream(
    model: Model,
    context: Context,
    options: StreamOptions,
    reasoning_effort: Option<&'static str>,
    style: RequestStyle,
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
                    r = drive(&model, &context, &options, reasoning_effort, style, &mut acc) => r,
                }
            }
            None => drive(&model, &context, &options, reasoning_effort, style, &mut acc).await,
        };
        match driven {
            Ok(reason) => {
                calculate_cost(&model, acc.usage_mut());
                apply_service_tier_pricing(&model, acc.usage_mut());
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
    reasoning_effort: Option<&'static str>,
    style: RequestStyle,
    acc: &mut MessageAccumulator,
) -> Result<DoneReason> {
    let api_key = options
        .api_key
        .as_deref()
        .ok_or_else(|| anyhow!("No API key for provider: {}", model.provider))?;

    let body = build_request_body(model, context, options, reasoning_effort);
    debug!(model = %model.id, effort = ?reasoning_effort, "sending responses request");

    let account_id = if style == RequestStyle::Codex {
        crate::codex::chatgpt_account_id(api_key)
    } else {
        None
    };

    let client = crate::http::client();
    let resp = send_with_retry(
        || {
            let mut req = client.post(responses_url(model)).json(&body);
            req = match style {
                RequestStyle::Standard if model.api == "azure-openai-responses" => {
                    req.header("api-key", api_key)
                }
                _ => req.bearer_auth(api_key),
            };
            if let Some(account) = &account_id {
                req = req.header("chatgpt-account-id", account);
            }
            for (k, v) in model.headers.iter().flatten() {
                req = req.header(k.as_str(), v.as_str());
            }
            for (k, v) in options.headers.iter().flatten() {
                req = req.header(k.as_str(), v.as_str());
            }
            req
        },
        options.max_retry_delay_ms,
        options.cancel.as_ref(),
    )
    .await?;

    if !resp.status().is_success() {
        bail!("OpenAI error {}", error_body(resp).await);
    }

    let mut reader = SseReader::new(resp.bytes_stream());
    let mut state = ResponseState::default();
    while let Some(data) = reader.next_data().await {
        let data = data?;
        if data.trim() == "[DONE]" {
            break;
        }
        let Ok(v) = serde_json::from_str::<Value>(&data) else {
            continue;
        };
        apply_responses_event(&v, acc, &mut state)?;
        if state.finished {
            break;
        }
    }

    Ok(state.reason(acc))
}

fn responses_url(model: &Model) -> String {
    format!("{}/responses", model.base_url.trim_end_matches('/'))
}

#[derive(Default)]
pub(crate) struct ResponseState {
    pub finished: bool,
    pub hit_length_limit: bool,
}

impl ResponseState {
    pub fn reason(&self, acc: &MessageAccumulator) -> DoneReason {
        if self.hit_length_limit {
            DoneReason::Length
        } else if acc.has_tool_calls() {
            DoneReason::ToolUse
        } else {
            DoneReason::Stop
        }
    }
}

/// Apply one decoded Responses SSE event.
pub(crate) fn apply_responses_event(
    v: &Value,
    acc: &mut MessageAccumulator,
    state: &mut ResponseState,
) -> Result<()> {
    match v["type"].as_str().unwrap_or("") {
        "response.output_item.added" => {
            let item = &v["item"];
            if item["type"].as_str() == Some("function_call") {
                let call_id = item["call_id"].as_str().unwrap_or("");
                let name = item["name"].as_str().unwrap_or("");
                acc.begin_tool_call(call_id, name);
            }
        }
        "response.output_text.delta" => {
            acc.append_text(v["delta"].as_str().unwrap_or(""));
        }
        "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
            acc.append_thinking(v["delta"].as_str().unwrap_or(""));
        }
        "response.function_call_arguments.delta" => {
            acc.append_tool_args(v["delta"].as_str().unwrap_or(""));
        }
        "response.output_item.done" => {
            let item = &v["item"];
            if item["type"].as_str() == Some("reasoning") {
                if let Some(encrypted) = item["encrypted_content"].as_str() {
                    // Replay the summary as the thinking block when no
                    // deltas streamed (summary may arrive only here).
                    if acc.partial().content.is_empty() {
                        if let Some(text) = item["summary"][0]["text"].as_str() {
                            acc.append_thinking(text);
                        }
                    }
                    acc.set_thinking_signature(encrypted);
                }
            }
            acc.close_open_block();
        }
        "response.incomplete" => {
            state.hit_length_limit = true;
        }
        "response.completed" | "response.done" => {
            let response = &v["response"];
            if response["incomplete_details"]["reason"].as_str() == Some("max_output_tokens") {
                state.hit_length_limit = true;
            }
            if let Some(usage) = response.get("usage").filter(|u| !u.is_null()) {
                let input = usage["input_tokens"].as_u64().unwrap_or(0);
                let cached = usage["input_tokens_details"]["cached_tokens"]
                    .as_u64()
                    .unwrap_or(0);
                let u = acc.usage_mut();
                u.input = input.saturating_sub(cached);
                u.cache_read = cached;
                u.output = usage["output_tokens"].as_u64().unwrap_or(0);
                u.total_tokens = usage["total_tokens"].as_u64().unwrap_or(0);
            }
            state.finished = true;
        }
        "response.failed" => {
            let message = v["response"]["error"]["message"]
                .as_str()
                .unwrap_or("response failed");
            return Err(anyhow!("OpenAI error: {message}"));
        }
        "error" => {
            let message = v["message"].as_str().unwrap_or("unknown stream error");
            return Err(anyhow!("OpenAI error: {message}"));
        }
        _ => {}
    }
    Ok(())
}

/// Build the Responses request body.
pub(crate) fn build_request_body(
    model: &Model,
    context: &Context,
    options: &StreamOptions,
    reasoning_effort: Option<&str>,
) -> Value {
    let input = convert_input(model, context);

    let mut body = json!({
        "model": model.id,
        "input": input,
        "stream": true,
        "store": false,
    });

    if let Some(system) = context.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        body["instructions"] = json!(scrub_text(system));
    }
    if let Some(max) = options.max_tokens {
        body["max_output_tokens"] = json!(max);
    }
    if let Some(t) = options.temperature {
        body["temperature"] = json!(t);
    }
    if options.cache_retention != CacheRetention::None {
        if let Some(session_id) = &options.session_id {
            // Session-scoped cache key: turns of one conversation land on
            // the same cache shard.
            body["prompt_cache_key"] = json!(session_id);
        }
    }
    if !context.tools.is_empty() {
        let tools: Vec<Value> = context
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    if model.reasoning {
        if let Some(effort) = reasoning_effort {
            body["reasoning"] = json!({ "effort": effort, "summary": "auto" });
            body["include"] = json!(["reasoning.encrypted_content"]);
        }
    }
    if let Some(tier) = service_tier(model) {
        body["service_tier"] = json!(tier);
    }

    body
}

/// Convert history into the Responses `input` array.
pub(crate) fn convert_input(model: &Model, context: &Context) -> Vec<Value> {
    let transformed = transform_messages(
        &context.messages,
        &TransformOptions {
            current_provider: &model.provider,
            current_model: &model.id,
            normalize_tool_id: None,
            convert_thinking_to_text: false,
        },
    );

    let mut input: Vec<Value> = Vec::new();
    for msg in &transformed {
        match msg {
            Message::User(user) => {
                let content: Vec<Value> = match &user.content {
                    UserContent::Text(t) => {
                        vec![json!({ "type": "input_text", "text": scrub_text(t) })]
                    }
                    UserContent::Blocks(blocks) => blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text, .. } => {
                                Some(json!({ "type": "input_text", "text": scrub_text(text) }))
                            }
                            ContentBlock::Image { data, mime_type } if model.supports_images() => {
                                Some(json!({
                                    "type": "input_image",
                                    "image_url": format!("data:{mime_type};base64,{data}"),
                                }))
                            }
                            _ => None,
                        })
                        .collect(),
                };
                if !content.is_empty() {
                    input.push(json!({ "role": "user", "content": content }));
                }
            }
            Message::Assistant(assistant) => {
                for block in &assistant.content {
                    match block {
                        ContentBlock::Text { text, .. } => {
                            if !text.is_empty() {
                                input.push(json!({
                                    "role": "assistant",
                                    "content": [{ "type": "output_text", "text": scrub_text(text) }],
                                }));
                            }
                        }
                        ContentBlock::Thinking {
                            thinking,
                            thinking_signature,
                        } => {
                            // Encrypted reasoning is replayed verbatim so the
                            // server can resume the chain; unsigned thinking
                            // has no replayable form on this API.
                            if let Some(sig) = thinking_signature {
                                input.push(json!({
                                    "type": "reasoning",
                                    "summary": [{
                                        "type": "summary_text",
                                        "text": scrub_text(thinking),
                                    }],
                                    "encrypted_content": sig,
                                }));
                            }
                        }
                        ContentBlock::ToolCall {
                            id,
                            name,
                            arguments,
                            ..
                        } => {
                            input.push(json!({
                                "type": "function_call",
                                "call_id": id,
                                "name": name,
                                "arguments": arguments.to_string(),
                            }));
                        }
                        ContentBlock::Image { .. } => {}
                    }
                }
            }
            Message::ToolResult(tr) => {
                input.push(json!({
                    "type": "function_call_output",
                    "call_id": tr.tool_call_id,
                    "output": scrub_text(&tool_result_text(tr)),
                }));
                // Images in tool results attach as a follow-up user message;
                // function_call_output is text-only on this API.
                let images: Vec<Value> = tr
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Image { data, mime_type } if model.supports_images() => {
                            Some(json!({
                                "type": "input_image",
                                "image_url": format!("data:{mime_type};base64,{data}"),
                            }))
                        }
                        _ => None,
                    })
                    .collect();
                if !images.is_empty() {
                    input.push(json!({ "role": "user", "content": images }));
                }
            }
        }
    }
    input
}

fn tool_result_text(tr: &crate::types::ToolResultMessage) -> String {
    let text = tr
        .content
        .iter()
        .filter_map(ContentBlock::as_text)
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() && tr.content.iter().any(|b| matches!(b, ContentBlock::Image { .. })) {
        "(see attached image)".to_string()
    } else {
        text
    }
}

/// Optional service tier, read from the model's compat knobs.
fn service_tier(model: &Model) -> Option<&str> {
    model.compat.as_ref()?.get("serviceTier")?.as_str()
}

/// Scale cost by the service tier: flex halves it, priority doubles it.
fn apply_service_tier_pricing(model: &Model, usage: &mut crate::types::Usage) {
    let multiplier = match service_tier(model) {
        Some("flex") => 0.5,
        Some("priority") => 2.0,
        _ => return,
    };
    usage.cost.input *= multiplier;
    usage.cost.output *= multiplier;
    usage.cost.cache_read *= multiplier;
    usage.cost.cache_write *= multiplier;
    usage.cost.total =
        usage.cost.input + usage.cost.output + usage.cost.cache_read + usage.cost.cache_write;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
