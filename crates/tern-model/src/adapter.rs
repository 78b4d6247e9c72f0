// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Provider adapter trait and api-name registry.
//!
//! Dispatch is a flat registry mapping `api` names to adapter instances —
//! a small capability set (`stream`, `stream_simple`) rather than an
//! inheritance hierarchy.  Builtin adapters are registered on first use;
//! extensions may register additional dialects under a `source_id` so they
//! can be unloaded as a group.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::{anyhow, Result};

use crate::event_stream::AssistantMessageEventStream;
use crate::types::{AssistantMessage, Context, Model, SimpleStreamOptions, StreamOptions};

/// One API dialect implementation.
///
/// Both entry points return immediately; the adapter drives the provider
/// call from a spawned task and reports every failure — including missing
/// credentials — as the stream's single terminal `error` event.
pub trait ProviderAdapter: Send + Sync {
    /// The api name this adapter serves, e.g. `"anthropic-messages"`.
    fn api(&self) -> &'static str;

    fn stream(
        &self,
        model: Model,
        context: Context,
        options: StreamOptions,
    ) -> AssistantMessageEventStream;

    /// Wraps [`ProviderAdapter::stream`], translating the reasoning level
    /// into provider-specific parameters.
    fn stream_simple(
        &self,
        model: Model,
        context: Context,
        options: SimpleStreamOptions,
    ) -> AssistantMessageEventStream;
}

struct Registered {
    adapter: Arc<dyn ProviderAdapter>,
    source_id: Option<String>,
}

static REGISTRY: RwLock<Option<HashMap<String, Registered>>> = RwLock::new(None);

fn ensure_builtins() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let builtins: Vec<Arc<dyn ProviderAdapter>> = vec![
            Arc::new(crate::anthropic::AnthropicMessagesAdapter::new()),
            Arc::new(crate::openai::OpenAiResponsesAdapter::openai()),
            Arc::new(crate::openai::OpenAiResponsesAdapter::azure()),
            Arc::new(crate::codex::CodexResponsesAdapter::new()),
            Arc::new(crate::google::GoogleAdapter::generative_ai()),
            Arc::new(crate::google::GoogleAdapter::vertex()),
            Arc::new(crate::google::GoogleAdapter::gemini_cli()),
            Arc::new(crate::bedrock::BedrockConverseAdapter::new()),
            Arc::new(crate::mock::MockAdapter::default()),
        ];
        let mut guard = REGISTRY.write().unwrap_or_else(|p| p.into_inner());
        let map = guard.get_or_insert_with(HashMap::new);
        for adapter in builtins {
            map.insert(
                adapter.api().to_string(),
                Registered {
                    adapter,
                    source_id: None,
                },
            );
        }
    });
}

/// Register an adapter, replacing any previous registration for its api.
pub fn register_adapter(adapter: Arc<dyn ProviderAdapter>, source_id: Option<&str>) {
    ensure_builtins();
    let mut guard = REGISTRY.write().unwrap_or_else(|p| p.into_inner());
    let map = guard.get_or_insert_with(HashMap::new);
    map.insert(
        adapter.api().to_string(),
        Registered {
            adapter,
            source_id: source_id.map(str::to_string),
        },
    );
}

/// Look up the adapter registered for an api name.
pub fn get_adapter(api: &str) -> Option<Arc<dyn ProviderAdapter>> {
    ensure_builtins();
    let guard = REGISTRY.read().unwrap_or_else(|p| p.into_inner());
    guard.as_ref()?.get(api).map(|r| Arc::clone(&r.adapter))
}

/// Remove every adapter registered under `source_id`.
pub fn unregister_adapters(source_id: &str) {
    let mut guard = REGISTRY.write().unwrap_or_else(|p| p.into_inner());
    if let Some(map) = guard.as_mut() {
        map.retain(|_, r| r.source_id.as_deref() != Some(source_id));
    }
}

fn resolve(api: &str) -> Result<Arc<dyn ProviderAdapter>> {
    get_adapter(api).ok_or_else(|| anyhow!("no API adapter registered for api: {api}"))
}

/// Stream an LLM response using the adapter registered for the model's api.
pub fn stream(
    model: &Model,
    context: Context,
    options: StreamOptions,
) -> Result<AssistantMessageEventStream> {
    Ok(resolve(&model.api)?.stream(model.clone(), context, options))
}

/// Stream using the simple API with reasoning-level support.
pub fn stream_simple(
    model: &Model,
    context: Context,
    options: SimpleStreamOptions,
) -> Result<AssistantMessageEventStream> {
    Ok(resolve(&model.api)?.stream_simple(model.clone(), context, options))
}

/// Complete an LLM call and return the final message.
pub async fn complete(
    model: &Model,
    context: Context,
    options: StreamOptions,
) -> Result<AssistantMessage> {
    Ok(stream(model, context, options)?.result().await)
}

/// Complete using the simple API and return the final message.
pub async fn complete_simple(
    model: &Model,
    context: Context,
    options: SimpleStreamOptions,
) -> Result<AssistantMessage> {
    Ok(stream_simple(model, context, options)?.result().await)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_dialects_are_registered() {
        for api in [
            "anthropic-messages",
            "openai-responses",
            "azure-openai-responses",
            "openai-codex-responses",
            "google-generative-ai",
            "google-vertex",
            "google-gemini-cli",
            "bedrock-converse-stream",
            "mock",
        ] {
            assert!(get_adapter(api).is_some(), "missing builtin adapter: {api}");
        }
    }

    #[test]
    fn unknown_api_resolves_to_error() {
        let err = resolve("no-such-api").err().unwrap();
        assert!(err.to_string().contains("no-such-api"));
    }

    struct DummyAdapter;

    impl ProviderAdapter for DummyAdapter {
        fn api(&self) -> &'static str {
            "dummy-api"
        }
        fn stream(
            &self,
            _model: Model,
            _context: Context,
            _options: StreamOptions,
        ) -> AssistantMessageEventStream {
            crate::event_stream::assistant_message_event_stream()
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

    #[test]
    fn source_scoped_registration_and_unregistration() {
        register_adapter(Arc::new(DummyAdapter), Some("test-ext"));
        assert!(get_adapter("dummy-api").is_some());
        unregister_adapters("test-ext");
        assert!(get_adapter("dummy-api").is_none());
        // Builtins survive source-scoped unregistration.
        assert!(get_adapter("anthropic-messages").is_some());
    }
}
