// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Codex Responses adapter.
//!
//! Speaks the same Responses wire format as the OpenAI dialect but against
//! the ChatGPT backend, which authenticates with an OAuth access token and
//! additionally requires a `chatgpt-account-id` header.  The account id is
//! embedded in the token's JWT payload; the payload is decoded without
//! signature verification — the server verifies, this client only routes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;

use crate::adapter::ProviderAdapter;
use crate::event_stream::AssistantMessageEventStream;
use crate::openai::{resolve_effort, spawn_stream, RequestStyle};
use crate::options::build_base_options;
use crate::types::{Context, Model, SimpleStreamOptions, StreamOptions};

pub struct CodexResponsesAdapter;

impl CodexResponsesAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CodexResponsesAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for CodexResponsesAdapter {
    fn api(&self) -> &'static str {
        "openai-codex-responses"
    }

    fn stream(
        &self,
        model: Model,
        context: Context,
        options: StreamOptions,
    ) -> AssistantMessageEventStream {
        spawn_stream(model, context, options, None, RequestStyle::Codex)
    }

    fn stream_simple(
        &self,
        model: Model,
        context: Context,
        options: SimpleStreamOptions,
    ) -> AssistantMessageEventStream {
        let effort = resolve_effort(&model, &options);
        let base = build_base_options(&model, &options);
        spawn_stream(model, context, base, effort, RequestStyle::Codex)
    }
}

/// Extract the ChatGPT account id from an OAuth access token.
///
/// The token is a JWT whose payload carries
/// `{"https://api.openai.com/auth": {"chatgpt_account_id": "..."}}`.
/// Returns `None` for opaque tokens (plain API keys) so callers can simply
/// omit the header.
pub(crate) fn chatgpt_account_id(token: &str) -> Option<String> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    // A JWT has exactly three segments.
    parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let decoded = URL_SAFE_NO_PAD.decode(payload.as_bytes()).ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;
    claims["https://api.openai.com/auth"]["chatgpt_account_id"]
        .as_str()
        .map(str::to_string)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
