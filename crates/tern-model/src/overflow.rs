// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Context-overflow detection across provider error vocabularies.

use std::sync::OnceLock;

use regex::RegexSet;

use crate::types::{AssistantMessage, Model};

/// Case-insensitive patterns recognising "prompt too large" errors.
///
/// Checked before the retryable-error bank: an overflow match always
/// classifies the failure as overflow, never as retryable.
const OVERFLOW_PATTERNS: &[&str] = &[
    // Anthropic
    r"prompt is too long",
    r"exceeds the model's maximum context",
    // OpenAI
    r"maximum context length",
    r"context_length_exceeded",
    r"max_tokens.*exceeds.*model maximum",
    // Google
    r"exceeds the maximum number of tokens",
    r"request payload size exceeds the limit",
    // xAI / Groq / general
    r"token limit",
    r"too many tokens",
    r"rate_limit_exceeded.*tokens",
    // Cerebras / Mistral
    r"context window",
    r"input.*too long",
    r"context.?(window|length|limit)",
    r"max.?context",
];

fn overflow_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new(OVERFLOW_PATTERNS.iter().map(|p| format!("(?i){p}")))
            .expect("overflow patterns are valid regexes")
    })
}

/// True when `error` matches the overflow vocabulary of any provider.
pub fn is_overflow_error(error: &str) -> bool {
    overflow_set().is_match(error)
}

/// Detect context overflow on a finished assistant message.
///
/// Checks the error message against the pattern bank, then the silent case:
/// the provider accepted the request but reported more input tokens than the
/// model's context window.  Some providers report `input` post-cache-hit,
/// which may undercount the true prompt size — `margin` widens the window
/// before the silent check fires so a borderline cache-discounted reading is
/// not misclassified.
pub fn is_context_overflow(message: &AssistantMessage, model: &Model, margin: u64) -> bool {
    if message.stop_reason.is_failure() {
        if let Some(err) = &message.error_message {
            if is_overflow_error(err) {
                return true;
            }
        }
    }
    model.context_window > 0 && message.usage.input > model.context_window + margin
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
