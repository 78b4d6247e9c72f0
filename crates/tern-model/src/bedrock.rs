// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! AWS Bedrock adapter — Converse API with SigV4 authentication.
//!
//! Uses the `POST /model/{modelId}/converse` endpoint and replays the
//! response through the standard event model.  The SigV4 signing algorithm
//! is implemented locally with `sha2` and `hex` to avoid pulling in the AWS
//! SDK.
//!
//! # Credentials
//! Read from env vars:
//! - `AWS_ACCESS_KEY_ID`
//! - `AWS_SECRET_ACCESS_KEY`
//! - `AWS_SESSION_TOKEN` (optional, for temporary credentials)
//! - `AWS_DEFAULT_REGION` or `AWS_REGION` (fallback: `us-east-1`)

use anyhow::{anyhow, bail, Context as _, Result};
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::accumulate::MessageAccumulator;
use crate::adapter::ProviderAdapter;
use crate::catalog::calculate_cost;
use crate::event_stream::{assistant_message_event_stream, AssistantMessageEventStream};
use crate::options::{adjust_max_tokens_for_thinking, build_base_options, clamp_reasoning};
use crate::sanitize::scrub_text;
use crate::transform::{transform_messages, TransformOptions};
use crate::types::{
    ContentBlock, Context, DoneReason, ErrorReason, Message, Model, SimpleStreamOptions,
    StreamOptions, ThinkingLevel, UserContent,
};

pub struct BedrockConverseAdapter;

impl BedrockConverseAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BedrockConverseAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for BedrockConverseAdapter {
    fn api(&self) -> &'static str {
        "bedrock-converse-stream"
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
    let access_key = std::env::var("AWS_ACCESS_KEY_ID").context("AWS_ACCESS_KEY_ID not set")?;
    let secret_key =
        std::env::var("AWS_SECRET_ACCESS_KEY").context("AWS_SECRET_ACCESS_KEY not set")?;
    let session_token = std::env::var("AWS_SESSION_TOKEN").ok();
    let region = std::env::var("AWS_DEFAULT_REGION")
        .or_else(|_| std::env::var("AWS_REGION"))
        .unwrap_or_else(|_| "us-east-1".into());

    let body = build_request_body(model, context, options, thinking_budget);
    let body_bytes = serde_json::to_vec(&body)?;

    let host = format!("bedrock-runtime.{region}.amazonaws.com");
    let path = format!("/model/{}/converse", urlencoded(&model.id));
    let url = format!("https://{host}{path}");
    debug!(model = %model.id, %region, "sending bedrock request");

    // SigV4 signatures embed the request timestamp, so each retry attempt
    // signs afresh rather than replaying the same builder.
    const MAX_ATTEMPTS: u32 = 3;
    let client = crate::http::client();
    let mut last_error: Option<anyhow::Error> = None;

    for attempt in 1..=MAX_ATTEMPTS {
        if let Some(token) = &options.cancel {
            if token.is_cancelled() {
                bail!("request aborted");
            }
        }

        let date_time = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let signed = sign_request(&SigningInput {
            access_key: &access_key,
            secret_key: &secret_key,
            session_token: session_token.as_deref(),
            region: &region,
            host: &host,
            path: &path,
            date_time: &date_time,
            body: &body_bytes,
        });

        let mut req = client
            .post(&url)
            .header("content-type", "application/json")
            .header("x-amz-date", &date_time)
            .header("Authorization", &signed.authorization)
            .body(body_bytes.clone());
        if let Some(tok) = &session_token {
            req = req.header("x-amz-security-token", tok);
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                let response: Value =
                    resp.json().await.context("Bedrock response parse failed")?;
                return apply_response(&response, acc);
            }
            Ok(resp) if crate::http::is_retryable_status(resp.status()) => {
                last_error = Some(anyhow!(
                    "Bedrock error {}",
                    crate::http::error_body(resp).await
                ));
            }
            Ok(resp) => {
                bail!("Bedrock error {}", crate::http::error_body(resp).await);
            }
            Err(e) => {
                last_error = Some(anyhow!(e).context("Bedrock request failed"));
            }
        }

        if attempt < MAX_ATTEMPTS {
            let mut delay = 1000 * 2u64.pow(attempt - 1);
            if let Some(cap) = options.max_retry_delay_ms {
                delay = delay.min(cap);
            }
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("Bedrock request failed")))
}

/// Replay the synchronous Converse response through the accumulator.
fn apply_response(response: &Value, acc: &mut MessageAccumulator) -> Result<DoneReason> {
    if let Some(parts) = response["output"]["message"]["content"].as_array() {
        for part in parts {
            if let Some(rc) = part.get("reasoningContent") {
                if let Some(text) = rc["reasoningText"]["text"].as_str() {
                    acc.append_thinking(text);
                }
                if let Some(sig) = rc["reasoningText"]["signature"].as_str() {
                    acc.set_thinking_signature(sig);
                }
            } else if let Some(tu) = part.get("toolUse") {
                let id = tu["toolUseId"].as_str().unwrap_or("");
                let name = tu["name"].as_str().unwrap_or("");
                acc.begin_tool_call(id, name);
                acc.append_tool_args(&tu["input"].to_string());
                acc.close_open_block();
            } else if let Some(text) = part["text"].as_str() {
                acc.append_text(text);
            }
        }
    }

    if let Some(usage) = response.get("usage").filter(|u| !u.is_null()) {
        let u = acc.usage_mut();
        u.input = usage["inputTokens"].as_u64().unwrap_or(0);
        u.output = usage["outputTokens"].as_u64().unwrap_or(0);
        u.cache_read = usage["cacheReadInputTokens"].as_u64().unwrap_or(0);
        u.cache_write = usage["cacheWriteInputTokens"].as_u64().unwrap_or(0);
        u.total_tokens = usage["totalTokens"].as_u64().unwrap_or(0);
    }

    Ok(match response["stopReason"].as_str() {
        Some("max_tokens") => DoneReason::Length,
        Some("tool_use") => DoneReason::ToolUse,
        _ if acc.has_tool_calls() => DoneReason::ToolUse,
        _ => DoneReason::Stop,
    })
}

/// Build the Converse request body.
pub(crate) fn build_request_body(
    model: &Model,
    context: &Context,
    options: &StreamOptions,
    thinking_budget: Option<u32>,
) -> Value {
    let messages = convert_messages(model, context);

    let mut body = json!({
        "messages": messages,
        "inferenceConfig": {
            "maxTokens": options.max_tokens.unwrap_or(4096),
        },
    });
    if let Some(t) = options.temperature {
        body["inferenceConfig"]["temperature"] = json!(t);
    }
    if let Some(system) = context.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        body["system"] = json!([{ "text": scrub_text(system) }]);
    }
    if !context.tools.is_empty() {
        let tools: Vec<Value> = context
            .tools
            .iter()
            .map(|t| {
                json!({
                    "toolSpec": {
                        "name": t.name,
                        "description": t.description,
                        "inputSchema": { "json": t.parameters },
                    }
                })
            })
            .collect();
        body["toolConfig"] = json!({ "tools": tools });
    }
    if let Some(budget) = thinking_budget.filter(|b| *b > 0) {
        body["additionalModelRequestFields"] = json!({
            "thinking": { "type": "enabled", "budget_tokens": budget },
        });
    }
    body
}

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
                let content: Vec<Value> = match &user.content {
                    UserContent::Text(t) => vec![json!({ "text": scrub_text(t) })],
                    UserContent::Blocks(blocks) => {
                        blocks.iter().filter_map(|b| wire_block(model, b)).collect()
                    }
                };
                if !content.is_empty() {
                    out.push(json!({ "role": "user", "content": content }));
                }
            }
            Message::Assistant(assistant) => {
                let is_same =
                    assistant.provider == model.provider && assistant.model == model.id;
                let mut content: Vec<Value> = Vec::new();
                for block in &assistant.content {
                    match block {
                        ContentBlock::Text { text, .. } => {
                            if !text.trim().is_empty() {
                                content.push(json!({ "text": scrub_text(text) }));
                            }
                        }
                        ContentBlock::Thinking {
                            thinking,
                            thinking_signature,
                        } => match thinking_signature {
                            Some(sig) if is_same => content.push(json!({
                                "reasoningContent": {
                                    "reasoningText": { "text": thinking, "signature": sig },
                                }
                            })),
                            _ => {
                                if !thinking.trim().is_empty() {
                                    content.push(json!({ "text": scrub_text(thinking) }));
                                }
                            }
                        },
                        ContentBlock::ToolCall {
                            id,
                            name,
                            arguments,
                            ..
                        } => content.push(json!({
                            "toolUse": {
                                "toolUseId": id,
                                "name": name,
                                "input": arguments,
                            }
                        })),
                        ContentBlock::Image { .. } => {}
                    }
                }
                if !content.is_empty() {
                    out.push(json!({ "role": "assistant", "content": content }));
                }
            }
            Message::ToolResult(tr) => {
                let content: Vec<Value> =
                    tr.content.iter().filter_map(|b| wire_block(model, b)).collect();
                let result = json!({
                    "toolResult": {
                        "toolUseId": tr.tool_call_id,
                        "content": content,
                        "status": if tr.is_error { "error" } else { "success" },
                    }
                });
                // Converse groups tool results into one user turn.
                if let Some(last) = out.last_mut() {
                    let grouped = last["role"] == "user"
                        && last["content"]
                            .as_array()
                            .is_some_and(|c| c.iter().all(|b| b.get("toolResult").is_some()));
                    if grouped {
                        last["content"].as_array_mut().expect("checked").push(result);
                        continue;
                    }
                }
                out.push(json!({ "role": "user", "content": [result] }));
            }
        }
    }
    out
}

fn wire_block(model: &Model, block: &ContentBlock) -> Option<Value> {
    match block {
        ContentBlock::Text { text, .. } => Some(json!({ "text": scrub_text(text) })),
        ContentBlock::Image { data, mime_type } if model.supports_images() => Some(json!({
            "image": {
                "format": image_format(mime_type),
                "source": { "bytes": data },
            }
        })),
        _ => None,
    }
}

fn image_format(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" | "image/jpg" => "jpeg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "png",
    }
}

// ── SigV4 signing ─────────────────────────────────────────────────────────────

struct SigningInput<'a> {
    access_key: &'a str,
    secret_key: &'a str,
    session_token: Option<&'a str>,
    region: &'a str,
    host: &'a str,
    path: &'a str,
    date_time: &'a str,
    body: &'a [u8],
}

struct SignedRequest {
    authorization: String,
}

fn sign_request(input: &SigningInput) -> SignedRequest {
    const SERVICE: &str = "bedrock";
    let date = &input.date_time[..8];

    let mut headers: Vec<(&str, &str)> = vec![
        ("content-type", "application/json"),
        ("host", input.host),
        ("x-amz-date", input.date_time),
    ];
    if let Some(tok) = input.session_token {
        headers.push(("x-amz-security-token", tok));
    }
    headers.sort_by_key(|&(k, _)| k);

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{k}:{}\n", v.trim()))
        .collect();
    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| *k)
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "POST\n{}\n\n{}\n{}\n{}",
        input.path,
        canonical_headers,
        signed_headers,
        hex_sha256(input.body),
    );

    let credential_scope = format!("{date}/{}/{SERVICE}/aws4_request", input.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        input.date_time,
        credential_scope,
        hex_sha256(canonical_request.as_bytes()),
    );

    let signing_key =
        derive_signing_key(input.secret_key.as_bytes(), date, input.region, SERVICE);
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    SignedRequest {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
            input.access_key, credential_scope, signed_headers, signature,
        ),
    }
}

fn sha256(data: &[u8]) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().to_vec()
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// HMAC-SHA256 from the raw SHA-256 primitive.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    const BLOCK: usize = 64;
    let norm_key = if key.len() > BLOCK {
        sha256(key)
    } else {
        key.to_vec()
    };
    let mut padded = [0u8; BLOCK];
    padded[..norm_key.len()].copy_from_slice(&norm_key);
    let ipad: Vec<u8> = padded.iter().map(|&b| b ^ 0x36).collect();
    let opad: Vec<u8> = padded.iter().map(|&b| b ^ 0x5c).collect();
    let inner = {
        let mut h = Sha256::new();
        h.update(&ipad);
        h.update(data);
        h.finalize().to_vec()
    };
    let mut h = Sha256::new();
    h.update(&opad);
    h.update(&inner);
    h.finalize().to_vec()
}

fn derive_signing_key(secret: &[u8], date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_secret = [b"AWS4", secret].concat();
    let k_date = hmac_sha256(&k_secret, date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Percent-encode the model id for the request path (`:` in inference
/// profile ids must be escaped).
fn urlencoded(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
                c.to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
