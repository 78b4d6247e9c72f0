// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Unified streaming interface over heterogeneous LLM provider APIs.
//!
//! Every supported dialect converts an internal [`Context`] to its wire
//! form, parses the provider's stream back into a uniform
//! [`AssistantMessageEvent`] sequence, and normalises failure modes into a
//! single terminal `error` event.  Dispatch is by api name through the
//! adapter registry; see [`stream`] and [`stream_simple`].

pub mod accumulate;
pub mod adapter;
pub mod catalog;
pub mod event_stream;
pub mod http;
pub mod json;
pub mod options;
pub mod overflow;
pub mod sanitize;
pub mod transform;
mod types;

mod anthropic;
mod bedrock;
mod codex;
mod google;
mod mock;
mod openai;

pub use adapter::{
    complete, complete_simple, get_adapter, register_adapter, stream, stream_simple,
    unregister_adapters, ProviderAdapter,
};
pub use anthropic::AnthropicMessagesAdapter;
pub use bedrock::BedrockConverseAdapter;
pub use codex::CodexResponsesAdapter;
pub use event_stream::{assistant_message_event_stream, AssistantMessageEventStream, EventStream};
pub use google::GoogleAdapter;
pub use mock::{MockAdapter, MockEvent, ScriptedMockAdapter};
pub use openai::OpenAiResponsesAdapter;
pub use types::*;
