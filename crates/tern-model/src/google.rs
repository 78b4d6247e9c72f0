// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Google adapter, shared by the Generative Language API, Vertex AI, and the
//! Gemini CLI endpoints.
//!
//! Messages become a `contents` array with typed `parts`.  Function-call
//! `id` fields exist only for certain non-Google underlying models (Claude
//! or gpt-oss served through Google endpoints).  `thoughtSignature` values
//! must be well-formed base64 and are only replayed to the exact
//! (provider, model) that produced them; Gemini 3 additionally refuses
//! unsigned foreign tool calls, which are narrated as text instead.

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use tracing::debug;

use crate::accumulate::MessageAccumulator;
use crate::adapter::ProviderAdapter;
use crate::catalog::calculate_cost;
use crate::event_stream::{assistant_message_event_stream, AssistantMessageEventStream};
use crate::http::{error_body, send_with_retry, SseReader};
use crate::options::{adjust_max_tokens_for_thinking, build_base_options, clamp_reasoning};
use crate::sanitize::scrub_text;
use crate::transform::{restrict_tool_id, transform_messages, TransformOptions};
use crate::types::{
    ContentBlock, Context, DoneReason, ErrorReason, Message, Model, SimpleStreamOptions,
    StreamOptions, ThinkingLevel, UserContent,
};

#[derive(Clone, Copy, PartialEq)]
enum Variant {
    GenerativeAi,
    Vertex,
    GeminiCli,
}

pub struct GoogleAdapter {
    variant: Variant,
}

impl GoogleAdapter {
    pub fn generative_ai() -> Self {
        Self {
            variant: Variant::GenerativeAi,
        }
    }

    pub fn vertex() -> Self {
        Self {
            variant: Variant::Vertex,
        }
    }

    pub fn gemini_cli() -> Self {
        Self {
            variant: Variant::GeminiCli,
        }
    }
}

impl ProviderAdapter for GoogleAdapter {
    fn api(&self) -> &'static str {
        match self.variant {
            Variant::GenerativeAi => "google-generative-ai",
            Variant::Vertex => "google-vertex",
            Variant::GeminiCli => "google-gemini-cli",
        }
    }

    fn stream(
        &self,
        model: Model,
        context: Context,
        options: StreamOptions,
    ) -> AssistantMessageEventStream {
        spawn_stream(self.variant, model, context, options, None)
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
            if let Some(level) = options.reasoning.map(clamp_reasoning) {
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
        spawn_stream(self.variant, model, context, base, thinking_budget)
    }
}

fn spawn_stream(
    variant: Variant,
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
                    r = drive(variant, &model, &context, &options, thinking_budget, &mut acc) => r,
                }
            }
            None => drive(variant, &model, &context, &options, thinking_budget, &mut acc).await,
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
    variant: Variant,
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
    debug!(model = %model.id, thinking_budget, "sending google request");

    let url = stream_url(variant, model);
    let client = crate::http::client();
    let resp = send_with_retry(
        || {
            let mut req = client.post(&url).json(&body);
            req = match variant {
                Variant::GenerativeAi => req.header("x-goog-api-key", api_key),
                // Vertex and the Gemini CLI backend authenticate with OAuth
                // bearer tokens.
                Variant::Vertex | Variant::GeminiCli => req.bearer_auth(api_key),
            };
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
        bail!("Google error {}", error_body(resp).await);
    }

    let mut reader = SseReader::new(resp.bytes_stream());
    let mut state = ChunkState::default();
    while let Some(data) = reader.next_data().await {
        let data = data?;
        let Ok(v) = serde_json::from_str::<Value>(&data) else {
            continue;
        };
        apply_chunk(&v, acc, &mut state)?;
    }

    Ok(state.reason(acc))
}

fn stream_url(variant: Variant, model: &Model) -> String {
    let base = model.base_url.trim_end_matches('/');
    match variant {
        Variant::GenerativeAi => format!(
            "{base}/v1beta/models/{}:streamGenerateContent?alt=sse",
            model.id
        ),
        Variant::Vertex | Variant::GeminiCli => {
            format!("{base}/models/{}:streamGenerateContent?alt=sse", model.id)
        }
    }
}

#[derive(Default)]
struct ChunkState {
    finish_reason: Option<String>,
}

impl ChunkState {
    fn reason(&self, acc: &MessageAccumulator) -> DoneReason {
        match self.finish_reason.as_deref() {
            Some("MAX_TOKENS") => DoneReason::Length,
            _ if acc.has_tool_calls() => DoneReason::ToolUse,
            _ => DoneReason::Stop,
        }
    }
}

/// Apply one streamed `GenerateContentResponse` chunk.
fn apply_chunk(v: &Value, acc: &mut MessageAccumulator, state: &mut ChunkState) -> Result<()> {
    if let Some(error) = v.get("error").filter(|e| !e.is_null()) {
        let message = error["message"].as_str().unwrap_or("unknown Google error");
        return Err(anyhow!("Google error: {message}"));
    }

    let candidate = &v["candidates"][0];
    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for part in parts {
            let signature = part["thoughtSignature"].as_str();
            if let Some(fc) = part.get("functionCall").filter(|f| !f.is_null()) {
                let id = fc["id"].as_str().unwrap_or("");
                let name = fc["name"].as_str().unwrap_or("");
                acc.begin_tool_call(id, name);
                // Gemini delivers complete argument objects, not a delta
                // stream.
                if let Some(args) = fc.get("args").filter(|a| !a.is_null()) {
                    acc.append_tool_args(&args.to_string());
                }
                if let Some(sig) = signature {
                    acc.set_tool_signature(sig);
                }
                acc.close_open_block();
            } else if let Some(text) = part["text"].as_str() {
                if part["thought"].as_bool() == Some(true) {
                    acc.append_thinking(text);
                    if let Some(sig) = signature {
                        acc.set_thinking_signature(sig);
                    }
                } else {
                    acc.append_text(text);
                    if let Some(sig) = signature {
                        acc.set_text_signature(sig);
                    }
                }
            }
        }
    }

    if let Some(reason) = candidate["finishReason"].as_str() {
        state.finish_reason = Some(reason.to_string());
    }

    if let Some(usage) = v.get("usageMetadata").filter(|u| !u.is_null()) {
        let prompt = usage["promptTokenCount"].as_u64().unwrap_or(0);
        let cached = usage["cachedContentTokenCount"].as_u64().unwrap_or(0);
        let u = acc.usage_mut();
        u.input = prompt.saturating_sub(cached);
        u.cache_read = cached;
        u.output = usage["candidatesTokenCount"].as_u64().unwrap_or(0)
            + usage["thoughtsTokenCount"].as_u64().unwrap_or(0);
        u.total_tokens = usage["totalTokenCount"].as_u64().unwrap_or(0);
    }

    Ok(())
}

/// Models served through Google endpoints that require explicit function
/// call ids.
fn requires_tool_call_id(model_id: &str) -> bool {
    model_id.starts_with("claude-") || model_id.starts_with("gpt-oss-")
}

/// `thoughtSignature` must be base64 the server can decode (TYPE_BYTES).
fn is_valid_thought_signature(signature: &str) -> bool {
    !signature.is_empty()
        && signature.len() % 4 == 0
        && signature
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

fn resolve_thought_signature<'a>(
    is_same_provider_and_model: bool,
    signature: Option<&'a str>,
) -> Option<&'a str> {
    signature.filter(|sig| is_same_provider_and_model && is_valid_thought_signature(sig))
}

/// Build the request body for `streamGenerateContent`.
pub(crate) fn build_request_body(
    model: &Model,
    context: &Context,
    options: &StreamOptions,
    thinking_budget: Option<u32>,
) -> Value {
    let contents = convert_messages(model, context);

    let mut generation_config = json!({});
    if let Some(max) = options.max_tokens {
        generation_config["maxOutputTokens"] = json!(max);
    }
    if let Some(t) = options.temperature {
        generation_config["temperature"] = json!(t);
    }
    if let Some(budget) = thinking_budget.filter(|b| *b > 0) {
        generation_config["thinkingConfig"] = json!({
            "thinkingBudget": budget,
            "includeThoughts": true,
        });
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": generation_config,
    });

    if let Some(system) = context.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        body["systemInstruction"] = json!({
            "parts": [{ "text": scrub_text(system) }],
        });
    }
    if let Some(tools) = convert_tools(context) {
        body["tools"] = tools;
    }

    body
}

fn convert_tools(context: &Context) -> Option<Value> {
    if context.tools.is_empty() {
        return None;
    }
    let declarations: Vec<Value> = context
        .tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            })
        })
        .collect();
    Some(json!([{ "functionDeclarations": declarations }]))
}

/// Convert history into the Gemini `contents` array.
pub(crate) fn convert_messages(model: &Model, context: &Context) -> Vec<Value> {
    let include_id = requires_tool_call_id(&model.id);
    let normalizer = |id: &str| restrict_tool_id(id);
    let transformed = transform_messages(
        &context.messages,
        &TransformOptions {
            current_provider: &model.provider,
            current_model: &model.id,
            normalize_tool_id: if include_id { Some(&normalizer) } else { None },
            convert_thinking_to_text: false,
        },
    );

    let is_gemini3 = model.id.to_lowercase().contains("gemini-3");
    let mut contents: Vec<Value> = Vec::new();

    for msg in &transformed {
        match msg {
            Message::User(user) => {
                let parts: Vec<Value> = match &user.content {
                    UserContent::Text(t) => vec![json!({ "text": scrub_text(t) })],
                    UserContent::Blocks(blocks) => blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text, .. } => {
                                Some(json!({ "text": scrub_text(text) }))
                            }
                            ContentBlock::Image { data, mime_type } if model.supports_images() => {
                                Some(json!({
                                    "inlineData": { "mimeType": mime_type, "data": data },
                                }))
                            }
                            _ => None,
                        })
                        .collect(),
                };
                if !parts.is_empty() {
                    contents.push(json!({ "role": "user", "parts": parts }));
                }
            }
            Message::Assistant(assistant) => {
                let is_same =
                    assistant.provider == model.provider && assistant.model == model.id;
                let mut parts: Vec<Value> = Vec::new();
                for block in &assistant.content {
                    match block {
                        ContentBlock::Text {
                            text,
                            text_signature,
                        } => {
                            if text.trim().is_empty() {
                                continue;
                            }
                            let mut part = json!({ "text": scrub_text(text) });
                            if let Some(sig) =
                                resolve_thought_signature(is_same, text_signature.as_deref())
                            {
                                part["thoughtSignature"] = json!(sig);
                            }
                            parts.push(part);
                        }
                        ContentBlock::Thinking {
                            thinking,
                            thinking_signature,
                        } => {
                            if thinking.trim().is_empty() {
                                continue;
                            }
                            if is_same {
                                let mut part =
                                    json!({ "thought": true, "text": scrub_text(thinking) });
                                if let Some(sig) = resolve_thought_signature(
                                    is_same,
                                    thinking_signature.as_deref(),
                                ) {
                                    part["thoughtSignature"] = json!(sig);
                                }
                                parts.push(part);
                            } else {
                                parts.push(json!({ "text": scrub_text(thinking) }));
                            }
                        }
                        ContentBlock::ToolCall {
                            id,
                            name,
                            arguments,
                            thought_signature,
                        } => {
                            let sig =
                                resolve_thought_signature(is_same, thought_signature.as_deref());
                            if is_gemini3 && sig.is_none() {
                                // Replaying a foreign, unsigned call verbatim
                                // makes Gemini 3 imitate the raw format.
                                parts.push(json!({
                                    "text": format!(
                                        "[Historical context: a different model called tool \
                                         \"{name}\" with arguments: {arguments}. Do not mimic \
                                         this format - use proper function calling.]"
                                    ),
                                }));
                                continue;
                            }
                            let mut fc = json!({
                                "functionCall": {
                                    "name": name,
                                    "args": arguments,
                                }
                            });
                            if include_id {
                                fc["functionCall"]["id"] = json!(id);
                            }
                            if let Some(sig) = sig {
                                fc["thoughtSignature"] = json!(sig);
                            }
                            parts.push(fc);
                        }
                        ContentBlock::Image { .. } => {}
                    }
                }
                if !parts.is_empty() {
                    contents.push(json!({ "role": "model", "parts": parts }));
                }
            }
            Message::ToolResult(tr) => {
                let text: String = tr
                    .content
                    .iter()
                    .filter_map(ContentBlock::as_text)
                    .collect::<Vec<_>>()
                    .join("\n");
                let images: Vec<Value> = if model.supports_images() {
                    tr.content
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Image { data, mime_type } => Some(json!({
                                "inlineData": { "mimeType": mime_type, "data": data },
                            })),
                            _ => None,
                        })
                        .collect()
                } else {
                    vec![]
                };
                let response_value = if !text.is_empty() {
                    scrub_text(&text)
                } else if !images.is_empty() {
                    "(see attached image)".to_string()
                } else {
                    String::new()
                };

                // Only Gemini 3 accepts parts inside a functionResponse.
                let multimodal_fn = model.id.contains("gemini-3");
                let mut fn_response = json!({
                    "name": tr.tool_name,
                    "response": if tr.is_error {
                        json!({ "error": response_value })
                    } else {
                        json!({ "output": response_value })
                    },
                });
                if include_id {
                    fn_response["id"] = json!(tr.tool_call_id);
                }
                if !images.is_empty() && multimodal_fn {
                    fn_response["parts"] = json!(images);
                }
                let part = json!({ "functionResponse": fn_response });

                // Adjacent function responses group into one user turn.
                let coalesced = contents.last_mut().is_some_and(|last| {
                    let grouped = last["role"] == "user"
                        && last["parts"]
                            .as_array()
                            .is_some_and(|parts| {
                                parts.iter().any(|p| p.get("functionResponse").is_some())
                            });
                    if grouped {
                        last["parts"].as_array_mut().expect("checked").push(part.clone());
                    }
                    grouped
                });
                if !coalesced {
                    contents.push(json!({ "role": "user", "parts": [part] }));
                }

                if !images.is_empty() && !multimodal_fn {
                    let mut parts = vec![json!({ "text": "Tool result image:" })];
                    parts.extend(images);
                    contents.push(json!({ "role": "user", "parts": parts }));
                }
            }
        }
    }

    contents
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
