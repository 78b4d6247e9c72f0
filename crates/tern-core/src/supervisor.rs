// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Terminal-error classification and supervisor event types.
//!
//! A failed run is classified in strict order: context overflow first (the
//! overflow bank wins — an overflowing request must be compacted, never
//! retried), then transient failures worth an exponential-backoff retry,
//! then everything else, which surfaces to the user.

use std::sync::OnceLock;

use regex::RegexSet;
use serde::{Deserialize, Serialize};

use tern_model::AssistantMessage;

use crate::compact::CompactionResult;

/// Case-insensitive patterns recognising transient failures.
const RETRYABLE_PATTERNS: &[&str] = &[
    r"overloaded",
    r"rate.?limit",
    r"\b429\b",
    r"\b5\d{2}\b",
    r"service.?unavailable",
    r"connection.?(reset|refused|timeout|error)",
    r"fetch.?failed",
    r"terminated",
    r"ECONNRESET",
    r"ETIMEDOUT",
    r"retry.?delay",
    r"too.?many.?requests",
];

fn retryable_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new(RETRYABLE_PATTERNS.iter().map(|p| format!("(?i){p}")))
            .expect("retryable patterns are valid regexes")
    })
}

/// Whether a failed assistant message is worth retrying.  Overflow errors
/// are excluded — they are handled by compaction.
pub fn is_retryable_error(message: &AssistantMessage) -> bool {
    let Some(error) = message.error_message.as_deref() else {
        return false;
    };
    if tern_model::overflow::is_overflow_error(error) {
        return false;
    }
    retryable_set().is_match(error)
}

/// Exponential-backoff retry configuration.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay_ms: 2000,
            max_delay_ms: 60000,
        }
    }
}

/// Backoff delay for a 1-based attempt: `min(base · 2^(attempt−1), max)`.
pub fn retry_delay_ms(attempt: u32, settings: &RetrySettings) -> u64 {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    settings
        .base_delay_ms
        .saturating_mul(factor)
        .min(settings.max_delay_ms)
}

/// Why an automatic compaction ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionReason {
    /// The context estimate plus the output reserve no longer fit.
    Threshold,
    /// The provider rejected the request (or silently reported more input
    /// tokens than the window holds).
    Overflow,
}

/// Events emitted by the supervisor around retries and compaction.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    AutoRetryStart {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        error_message: String,
    },
    AutoRetryEnd {
        success: bool,
        attempt: u32,
        final_error: Option<String>,
    },
    AutoCompactionStart {
        reason: CompactionReason,
    },
    AutoCompactionEnd {
        result: Option<CompactionResult>,
        aborted: bool,
        error_message: Option<String>,
        will_retry: bool,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tern_model::{InputModality, Model, StopReason};

    fn errored(error: &str) -> AssistantMessage {
        let model = Model {
            id: "m".into(),
            name: "M".into(),
            api: "mock".into(),
            provider: "mock".into(),
            base_url: String::new(),
            reasoning: false,
            input: vec![InputModality::Text],
            cost: Default::default(),
            context_window: 0,
            max_tokens: 0,
            headers: None,
            compat: None,
        };
        let mut m = AssistantMessage::empty_for(&model);
        m.stop_reason = StopReason::Error;
        m.error_message = Some(error.into());
        m
    }

    #[test]
    fn transient_failures_are_retryable() {
        for error in [
            "overloaded_error: Overloaded",
            "429 too many requests",
            "HTTP 503 service unavailable",
            "connection reset by peer",
            "ECONNRESET",
            "ETIMEDOUT while reading response",
            "rate_limit_exceeded, please slow down",
        ] {
            assert!(is_retryable_error(&errored(error)), "not retryable: {error}");
        }
    }

    #[test]
    fn overflow_errors_are_never_retryable() {
        // "rate_limit_exceeded ... tokens" matches both banks; overflow wins.
        assert!(!is_retryable_error(&errored(
            "rate_limit_exceeded: too many tokens in prompt"
        )));
        assert!(!is_retryable_error(&errored("prompt is too long")));
        assert!(!is_retryable_error(&errored("context_length_exceeded")));
    }

    #[test]
    fn ordinary_errors_are_not_retryable() {
        assert!(!is_retryable_error(&errored("invalid api key")));
        assert!(!is_retryable_error(&errored(
            "No API key for provider: anthropic"
        )));
    }

    #[test]
    fn message_without_error_is_not_retryable() {
        let mut m = errored("x");
        m.error_message = None;
        assert!(!is_retryable_error(&m));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let settings = RetrySettings::default();
        assert_eq!(retry_delay_ms(1, &settings), 2000);
        assert_eq!(retry_delay_ms(2, &settings), 4000);
        assert_eq!(retry_delay_ms(3, &settings), 8000);
        assert_eq!(retry_delay_ms(10, &settings), 60000);
    }
}
