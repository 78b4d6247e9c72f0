// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Wire-format tests: spin up a minimal HTTP/1.1 mock server, point each
//! adapter at it, issue a call, and assert both the HTTP request the adapter
//! sent and the final message it produced.
//!
//! These tests run without API keys and without external network access.
//! They exercise the full adapter pipeline: serialisation → HTTP → SSE
//! parsing → event accumulation.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use tern_model::{
    stream as adapter_stream, CacheRetention, ContentBlock, Context, InputModality, Message,
    Model, ModelCost, StopReason, StreamOptions, ToolSchema,
};

// ── Minimal HTTP/1.1 mock server ──────────────────────────────────────────────

#[derive(Debug)]
struct CapturedRequest {
    path: String,
    headers: HashMap<String, String>,
    body: Value,
}

/// Bind a mock server on a random loopback port.  It serves the scripted
/// `(status, body)` responses in order, one per connection, capturing every
/// request.  Returns the port and a receiver yielding captured requests.
async fn mock_server(
    responses: Vec<(u16, String)>,
) -> (u16, tokio::sync::mpsc::UnboundedReceiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<CapturedRequest>();

    tokio::spawn(async move {
        for (status, resp_body) in responses {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            let mut request_line = String::new();
            reader.read_line(&mut request_line).await.unwrap();
            let path = request_line
                .trim()
                .split(' ')
                .nth(1)
                .unwrap_or("")
                .to_string();

            let mut headers: HashMap<String, String> = HashMap::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let line = line.trim();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    let name = name.trim().to_lowercase();
                    let value = value.trim().to_string();
                    if name == "content-length" {
                        content_length = value.parse().unwrap_or(0);
                    }
                    headers.insert(name, value);
                }
            }

            let mut body_bytes = vec![0u8; content_length];
            reader.read_exact(&mut body_bytes).await.unwrap();
            let body: Value = serde_json::from_slice(&body_bytes).unwrap_or(Value::Null);

            let _ = tx.send(CapturedRequest {
                path,
                headers,
                body,
            });

            let reason = match status {
                200 => "OK",
                429 => "Too Many Requests",
                _ => "Error",
            };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{resp_body}",
                resp_body.len(),
            );
            let _ = write_half.write_all(response.as_bytes()).await;
            let _ = write_half.shutdown().await;
        }
    });

    (port, rx)
}

fn model_on_port(api: &str, provider: &str, id: &str, port: u16) -> Model {
    Model {
        id: id.into(),
        name: id.into(),
        api: api.into(),
        provider: provider.into(),
        base_url: format!("http://127.0.0.1:{port}"),
        reasoning: false,
        input: vec![InputModality::Text],
        cost: ModelCost {
            input: 1.0,
            output: 2.0,
            cache_read: 0.1,
            cache_write: 0.0,
        },
        context_window: 100_000,
        max_tokens: 4096,
        headers: None,
        compat: None,
    }
}

fn options_with_key(key: &str) -> StreamOptions {
    StreamOptions {
        max_tokens: Some(1024),
        api_key: Some(key.into()),
        cache_retention: CacheRetention::None,
        max_retry_delay_ms: Some(10),
        ..StreamOptions::default()
    }
}

fn sse(frames: &[Value]) -> String {
    frames
        .iter()
        .map(|f| format!("data: {f}\n\n"))
        .collect::<String>()
}

// ── Anthropic ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn anthropic_round_trip_text_and_tool_call() {
    let body = sse(&[
        json!({"type": "message_start",
               "message": {"usage": {"input_tokens": 12, "cache_read_input_tokens": 4}}}),
        json!({"type": "content_block_delta",
               "delta": {"type": "text_delta", "text": "Let me check."}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "content_block_start", "index": 1,
               "content_block": {"type": "tool_use", "id": "toolu_1", "name": "ls"}}),
        json!({"type": "content_block_delta", "index": 1,
               "delta": {"type": "input_json_delta", "partial_json": "{\"path\":\"/tmp\"}"}}),
        json!({"type": "content_block_stop", "index": 1}),
        json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"},
               "usage": {"output_tokens": 9}}),
        json!({"type": "message_stop"}),
    ]);
    let (port, mut rx) = mock_server(vec![(200, body)]).await;
    let model = model_on_port("anthropic-messages", "anthropic", "claude-opus-4-6", port);

    let ctx = Context {
        system_prompt: Some("be terse".into()),
        messages: vec![Message::user("list /tmp")],
        tools: vec![ToolSchema {
            name: "ls".into(),
            description: "list files".into(),
            parameters: json!({"type": "object"}),
        }],
    };
    let stream = adapter_stream(&model, ctx, options_with_key("sk-test")).unwrap();
    let message = stream.result().await;

    let request = rx.recv().await.unwrap();
    assert_eq!(request.path, "/v1/messages");
    assert_eq!(request.headers.get("x-api-key").unwrap(), "sk-test");
    assert_eq!(
        request.headers.get("anthropic-version").unwrap(),
        "2023-06-01"
    );
    assert_eq!(request.body["system"], "be terse");
    assert_eq!(request.body["tools"][0]["input_schema"]["type"], "object");

    assert_eq!(message.stop_reason, StopReason::ToolUse);
    assert_eq!(message.text(), "Let me check.");
    let calls = message.tool_calls();
    assert_eq!(calls[0].id, "toolu_1");
    assert_eq!(calls[0].arguments, json!({"path": "/tmp"}));
    assert_eq!(message.usage.input, 12);
    assert_eq!(message.usage.cache_read, 4);
    assert_eq!(message.usage.output, 9);
    // Cost follows the per-megatoken pricing table.
    assert!(message.usage.cost.total > 0.0);
}

#[tokio::test]
async fn anthropic_client_error_becomes_single_error_event() {
    let (port, _rx) = mock_server(vec![(
        400,
        r#"{"error":{"message":"prompt is too long"}}"#.into(),
    )])
    .await;
    let model = model_on_port("anthropic-messages", "anthropic", "claude-opus-4-6", port);
    let stream = adapter_stream(
        &model,
        Context {
            messages: vec![Message::user("hi")],
            ..Context::default()
        },
        options_with_key("sk-test"),
    )
    .unwrap();
    let message = stream.result().await;
    assert_eq!(message.stop_reason, StopReason::Error);
    assert!(message
        .error_message
        .as_deref()
        .unwrap()
        .contains("prompt is too long"));
}

#[tokio::test]
async fn rate_limited_request_is_retried_in_adapter() {
    let ok_body = sse(&[
        json!({"type": "content_block_delta",
               "delta": {"type": "text_delta", "text": "recovered"}}),
        json!({"type": "message_stop"}),
    ]);
    let (port, mut rx) = mock_server(vec![
        (429, r#"{"error":{"message":"rate limited"}}"#.into()),
        (200, ok_body),
    ])
    .await;
    let model = model_on_port("anthropic-messages", "anthropic", "claude-opus-4-6", port);
    let stream = adapter_stream(
        &model,
        Context {
            messages: vec![Message::user("hi")],
            ..Context::default()
        },
        options_with_key("sk-test"),
    )
    .unwrap();
    let message = stream.result().await;
    assert_eq!(message.stop_reason, StopReason::Stop);
    assert_eq!(message.text(), "recovered");
    // Both requests reached the server.
    assert!(rx.recv().await.is_some());
    assert!(rx.recv().await.is_some());
}

// ── OpenAI Responses ──────────────────────────────────────────────────────────

#[tokio::test]
async fn openai_responses_round_trip() {
    let body = sse(&[
        json!({"type": "response.output_text.delta", "delta": "Hello"}),
        json!({"type": "response.output_text.delta", "delta": " there"}),
        json!({"type": "response.completed", "response": {"usage": {
            "input_tokens": 20, "output_tokens": 4, "total_tokens": 24,
            "input_tokens_details": {"cached_tokens": 8}}}}),
    ]);
    let (port, mut rx) = mock_server(vec![(200, body)]).await;
    let model = model_on_port("openai-responses", "openai", "gpt-5.2", port);

    let mut options = options_with_key("sk-oai");
    options.cache_retention = CacheRetention::Short;
    options.session_id = Some("sess-42".into());
    let stream = adapter_stream(
        &model,
        Context {
            system_prompt: Some("sys".into()),
            messages: vec![Message::user("hi")],
            tools: vec![],
        },
        options,
    )
    .unwrap();
    let message = stream.result().await;

    let request = rx.recv().await.unwrap();
    assert_eq!(request.path, "/responses");
    assert_eq!(
        request.headers.get("authorization").unwrap(),
        "Bearer sk-oai"
    );
    assert_eq!(request.body["instructions"], "sys");
    assert_eq!(request.body["prompt_cache_key"], "sess-42");
    assert_eq!(request.body["store"], false);
    assert_eq!(request.body["input"][0]["role"], "user");

    assert_eq!(message.text(), "Hello there");
    assert_eq!(message.usage.input, 12);
    assert_eq!(message.usage.cache_read, 8);
    assert_eq!(message.usage.total_tokens, 24);
}

#[tokio::test]
async fn codex_sends_account_id_header_from_jwt() {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        json!({"https://api.openai.com/auth": {"chatgpt_account_id": "acct-77"}})
            .to_string()
            .as_bytes(),
    );
    let token = format!("{header}.{payload}.sig");

    let body = sse(&[
        json!({"type": "response.output_text.delta", "delta": "ok"}),
        json!({"type": "response.completed", "response": {}}),
    ]);
    let (port, mut rx) = mock_server(vec![(200, body)]).await;
    let model = model_on_port("openai-codex-responses", "openai-codex", "gpt-5.2-codex", port);

    let stream = adapter_stream(
        &model,
        Context {
            messages: vec![Message::user("hi")],
            ..Context::default()
        },
        options_with_key(&token),
    )
    .unwrap();
    let message = stream.result().await;
    assert_eq!(message.text(), "ok");

    let request = rx.recv().await.unwrap();
    assert_eq!(request.headers.get("chatgpt-account-id").unwrap(), "acct-77");
    assert!(request
        .headers
        .get("authorization")
        .unwrap()
        .starts_with("Bearer "));
}

// ── Google ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn google_round_trip_with_function_call() {
    let body = sse(&[
        json!({"candidates": [{"content": {"parts": [
            {"thought": true, "text": "hmm"},
            {"text": "Checking now."}
        ]}}]}),
        json!({"candidates": [{
            "content": {"parts": [{"functionCall": {"name": "grep", "args": {"q": "x"}}}]},
            "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 30, "candidatesTokenCount": 6,
                              "totalTokenCount": 36}}),
    ]);
    let (port, mut rx) = mock_server(vec![(200, body)]).await;
    let model = model_on_port("google-generative-ai", "google", "gemini-2.5-pro", port);

    let stream = adapter_stream(
        &model,
        Context {
            system_prompt: Some("sys".into()),
            messages: vec![Message::user("find x")],
            tools: vec![ToolSchema {
                name: "grep".into(),
                description: "search".into(),
                parameters: json!({"type": "object"}),
            }],
        },
        options_with_key("g-key"),
    )
    .unwrap();
    let message = stream.result().await;

    let request = rx.recv().await.unwrap();
    assert!(request
        .path
        .contains("/v1beta/models/gemini-2.5-pro:streamGenerateContent"));
    assert_eq!(request.headers.get("x-goog-api-key").unwrap(), "g-key");
    assert_eq!(
        request.body["systemInstruction"]["parts"][0]["text"],
        "sys"
    );
    assert_eq!(
        request.body["tools"][0]["functionDeclarations"][0]["name"],
        "grep"
    );

    assert_eq!(message.stop_reason, StopReason::ToolUse);
    assert!(matches!(message.content[0], ContentBlock::Thinking { .. }));
    assert_eq!(message.tool_calls()[0].name, "grep");
    assert_eq!(message.usage.input, 30);
    assert_eq!(message.usage.total_tokens, 36);
}

// ── Cross-adapter properties ──────────────────────────────────────────────────

#[tokio::test]
async fn dangling_tool_call_is_closed_before_user_message_on_the_wire() {
    let body = sse(&[
        json!({"type": "content_block_delta",
               "delta": {"type": "text_delta", "text": "ok"}}),
        json!({"type": "message_stop"}),
    ]);
    let (port, mut rx) = mock_server(vec![(200, body)]).await;
    let model = model_on_port("anthropic-messages", "anthropic", "claude-opus-4-6", port);

    let mut assistant = tern_model::AssistantMessage::empty_for(&model);
    assistant.stop_reason = StopReason::ToolUse;
    assistant.content = vec![ContentBlock::tool_call("t9", "ls", json!({}))];

    // The tool call never got a result before the user interrupted.
    let ctx = Context {
        system_prompt: None,
        messages: vec![
            Message::user("first"),
            Message::Assistant(assistant),
            Message::user("actually, stop"),
        ],
        tools: vec![],
    };
    adapter_stream(&model, ctx, options_with_key("k"))
        .unwrap()
        .result()
        .await;

    let request = rx.recv().await.unwrap();
    let messages = request.body["messages"].as_array().unwrap();
    // user, assistant(tool_use), user(tool_result synthetic), user(interrupt)
    let kinds: Vec<String> = messages
        .iter()
        .map(|m| {
            let role = m["role"].as_str().unwrap();
            let is_result = m["content"]
                .as_array()
                .map(|c| c.iter().any(|b| b["type"] == "tool_result"))
                .unwrap_or(false);
            if is_result {
                format!("{role}:tool_result")
            } else {
                role.to_string()
            }
        })
        .collect();
    assert_eq!(kinds, vec!["user", "assistant", "user:tool_result", "user"]);
    let synthetic = &messages[2]["content"][0];
    assert_eq!(synthetic["tool_use_id"], "t9");
    assert_eq!(synthetic["content"][0]["text"], "Interrupted by user message");
}

#[tokio::test]
async fn missing_api_key_fails_without_network() {
    // Port 1 is never listening; a request attempt would error differently.
    let model = model_on_port("anthropic-messages", "anthropic", "claude-opus-4-6", 1);
    let message = adapter_stream(
        &model,
        Context::default(),
        StreamOptions::default(),
    )
    .unwrap()
    .result()
    .await;
    assert_eq!(message.stop_reason, StopReason::Error);
    assert!(message
        .error_message
        .as_deref()
        .unwrap()
        .contains("No API key for provider: anthropic"));
}
