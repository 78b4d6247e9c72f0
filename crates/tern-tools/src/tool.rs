// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tern_model::ContentBlock;

/// The result of executing a tool: content blocks (text and/or images) plus
/// an opaque details payload that rides along in the session transcript.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    pub details: Value,
}

impl ToolResult {
    /// Plain-text result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            details: Value::Null,
        }
    }

    /// Concatenation of all text blocks.
    pub fn to_text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Callback for streaming partial results while a tool runs.
pub type OnPartialResult<'a> = &'a (dyn Fn(ToolResult) + Send + Sync);

/// Trait that every tool offered to the agent must implement.
///
/// The agent validates arguments against [`Tool::parameters`] (a JSON
/// Schema) before calling [`Tool::execute`]; on validation failure a
/// synthetic error result is produced and `execute` is never called.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Identifier the model calls the tool by.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters(&self) -> Value;

    /// Human-readable label for UIs.  Defaults to the identifier.
    fn label(&self) -> &str {
        self.name()
    }

    /// Execute the tool.  Implementations must observe `cancel` and return
    /// promptly once it fires; `on_partial` may be invoked any number of
    /// times to stream intermediate results.
    async fn execute(
        &self,
        call_id: &str,
        args: &Value,
        cancel: &CancellationToken,
        on_partial: OnPartialResult<'_>,
    ) -> anyhow::Result<ToolResult>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
