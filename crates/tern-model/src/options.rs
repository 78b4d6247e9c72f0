// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Reasoning-level translation shared by `stream_simple` implementations.
//!
//! Two provider families exist: token-budget providers (Anthropic, Google,
//! Bedrock) receive a thinking budget in tokens, effort-label providers
//! (OpenAI Responses) receive `"minimal" | "low" | "medium" | "high"`.

use crate::types::{Model, SimpleStreamOptions, StreamOptions, ThinkingBudgets, ThinkingLevel};

/// Default thinking budgets, overridable per call via [`ThinkingBudgets`].
pub const DEFAULT_BUDGET_MINIMAL: u32 = 1024;
pub const DEFAULT_BUDGET_LOW: u32 = 2048;
pub const DEFAULT_BUDGET_MEDIUM: u32 = 8192;
pub const DEFAULT_BUDGET_HIGH: u32 = 16384;

/// Minimum tokens that must remain for ordinary output after a thinking
/// budget is carved out.
const MIN_OUTPUT_TOKENS: u32 = 1024;

/// Default output cap when neither the options nor the model specify one.
const FALLBACK_MAX_TOKENS: u32 = 32_000;

/// Lower [`SimpleStreamOptions`] into plain [`StreamOptions`], defaulting
/// `max_tokens` to `min(model.max_tokens, 32000)`.
pub fn build_base_options(model: &Model, options: &SimpleStreamOptions) -> StreamOptions {
    let default_max = if model.max_tokens > 0 {
        model.max_tokens.min(FALLBACK_MAX_TOKENS)
    } else {
        FALLBACK_MAX_TOKENS
    };
    StreamOptions {
        temperature: options.temperature,
        max_tokens: Some(options.max_tokens.unwrap_or(default_max)),
        api_key: options.api_key.clone(),
        cache_retention: options.cache_retention,
        session_id: options.session_id.clone(),
        headers: options.headers.clone(),
        max_retry_delay_ms: options.max_retry_delay_ms,
        cancel: options.cancel.clone(),
    }
}

/// Clamp `xhigh` down to `high` for models that do not support it.
pub fn clamp_reasoning(level: ThinkingLevel) -> ThinkingLevel {
    match level {
        ThinkingLevel::Xhigh => ThinkingLevel::High,
        other => other,
    }
}

/// Resolve the token budget for a thinking level.
pub fn thinking_budget(level: ThinkingLevel, budgets: Option<&ThinkingBudgets>) -> u32 {
    let pick = |custom: Option<u32>, default: u32| custom.unwrap_or(default);
    match level {
        ThinkingLevel::Off => 0,
        ThinkingLevel::Minimal => pick(budgets.and_then(|b| b.minimal), DEFAULT_BUDGET_MINIMAL),
        ThinkingLevel::Low => pick(budgets.and_then(|b| b.low), DEFAULT_BUDGET_LOW),
        ThinkingLevel::Medium => pick(budgets.and_then(|b| b.medium), DEFAULT_BUDGET_MEDIUM),
        // xhigh shares the high budget on token-budget providers.
        ThinkingLevel::High | ThinkingLevel::Xhigh => {
            pick(budgets.and_then(|b| b.high), DEFAULT_BUDGET_HIGH)
        }
    }
}

/// Compute `(adjusted_max_tokens, thinking_budget)` for a reasoning call.
///
/// The adjusted total is `max_tokens + budget`; when `max_tokens` alone is
/// below the 1024-token output floor, the thinking budget is reduced first
/// so at least 1024 tokens remain for ordinary output.
pub fn adjust_max_tokens_for_thinking(
    max_tokens: u32,
    level: ThinkingLevel,
    budgets: Option<&ThinkingBudgets>,
) -> (u32, u32) {
    let budget = thinking_budget(level, budgets);
    let total = max_tokens + budget;
    if max_tokens < MIN_OUTPUT_TOKENS {
        let budget = total.saturating_sub(MIN_OUTPUT_TOKENS);
        (MIN_OUTPUT_TOKENS, budget)
    } else {
        (total, budget)
    }
}

/// Reasoning-effort label for effort-based providers.
pub fn effort_label(level: ThinkingLevel) -> Option<&'static str> {
    match level {
        ThinkingLevel::Off => None,
        ThinkingLevel::Minimal => Some("minimal"),
        ThinkingLevel::Low => Some("low"),
        ThinkingLevel::Medium => Some("medium"),
        ThinkingLevel::High | ThinkingLevel::Xhigh => Some("high"),
    }
}

/// Per-model effort policy for models whose serving stack restricts the
/// accepted effort labels.  Kept as a lookup table rather than general
/// clamping logic so each model's quirk stays inspectable.
pub fn model_effort_policy(model_id: &str, level: ThinkingLevel) -> ThinkingLevel {
    if model_id.contains("gpt-5.1-codex-mini") {
        return match level {
            ThinkingLevel::Minimal => ThinkingLevel::Low,
            ThinkingLevel::Xhigh => ThinkingLevel::High,
            _ => ThinkingLevel::Medium,
        };
    }
    level
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InputModality, ModelCost};

    fn model_with_max(max_tokens: u32) -> Model {
        Model {
            id: "m".into(),
            name: "M".into(),
            api: "mock".into(),
            provider: "mock".into(),
            base_url: String::new(),
            reasoning: true,
            input: vec![InputModality::Text],
            cost: ModelCost::default(),
            context_window: 200_000,
            max_tokens,
            headers: None,
            compat: None,
        }
    }

    #[test]
    fn base_options_default_max_tokens_from_model() {
        let opts = build_base_options(&model_with_max(8192), &SimpleStreamOptions::default());
        assert_eq!(opts.max_tokens, Some(8192));
    }

    #[test]
    fn base_options_cap_at_32000() {
        let opts = build_base_options(&model_with_max(64_000), &SimpleStreamOptions::default());
        assert_eq!(opts.max_tokens, Some(32_000));
    }

    #[test]
    fn base_options_explicit_max_tokens_wins() {
        let simple = SimpleStreamOptions {
            max_tokens: Some(500),
            ..SimpleStreamOptions::default()
        };
        let opts = build_base_options(&model_with_max(8192), &simple);
        assert_eq!(opts.max_tokens, Some(500));
    }

    #[test]
    fn clamp_reasoning_only_touches_xhigh() {
        assert_eq!(clamp_reasoning(ThinkingLevel::Xhigh), ThinkingLevel::High);
        assert_eq!(clamp_reasoning(ThinkingLevel::Low), ThinkingLevel::Low);
        assert_eq!(clamp_reasoning(ThinkingLevel::Off), ThinkingLevel::Off);
    }

    #[test]
    fn default_budgets_match_documented_values() {
        assert_eq!(thinking_budget(ThinkingLevel::Minimal, None), 1024);
        assert_eq!(thinking_budget(ThinkingLevel::Low, None), 2048);
        assert_eq!(thinking_budget(ThinkingLevel::Medium, None), 8192);
        assert_eq!(thinking_budget(ThinkingLevel::High, None), 16384);
        assert_eq!(thinking_budget(ThinkingLevel::Xhigh, None), 16384);
    }

    #[test]
    fn custom_budgets_override_defaults() {
        let budgets = ThinkingBudgets {
            medium: Some(4000),
            ..ThinkingBudgets::default()
        };
        assert_eq!(thinking_budget(ThinkingLevel::Medium, Some(&budgets)), 4000);
        // Levels without overrides keep the defaults.
        assert_eq!(thinking_budget(ThinkingLevel::Low, Some(&budgets)), 2048);
    }

    #[test]
    fn adjust_adds_budget_to_max_tokens() {
        let (max, budget) = adjust_max_tokens_for_thinking(8000, ThinkingLevel::Medium, None);
        assert_eq!(budget, 8192);
        assert_eq!(max, 16_192);
    }

    #[test]
    fn adjust_enforces_output_floor_by_shrinking_budget() {
        let (max, budget) = adjust_max_tokens_for_thinking(512, ThinkingLevel::Minimal, None);
        assert_eq!(max, 1024);
        // total = 512 + 1024 = 1536; floor leaves 512 for thinking
        assert_eq!(budget, 512);
    }

    #[test]
    fn adjust_never_produces_negative_budget() {
        let (max, budget) = adjust_max_tokens_for_thinking(
            100,
            ThinkingLevel::Minimal,
            Some(&ThinkingBudgets {
                minimal: Some(0),
                ..ThinkingBudgets::default()
            }),
        );
        assert_eq!(max, 1024);
        assert_eq!(budget, 0);
    }

    #[test]
    fn effort_labels_for_each_level() {
        assert_eq!(effort_label(ThinkingLevel::Off), None);
        assert_eq!(effort_label(ThinkingLevel::Minimal), Some("minimal"));
        assert_eq!(effort_label(ThinkingLevel::Xhigh), Some("high"));
    }

    #[test]
    fn codex_mini_policy_table_is_exact() {
        let m = "gpt-5.1-codex-mini";
        assert_eq!(model_effort_policy(m, ThinkingLevel::Minimal), ThinkingLevel::Low);
        assert_eq!(model_effort_policy(m, ThinkingLevel::Xhigh), ThinkingLevel::High);
        assert_eq!(model_effort_policy(m, ThinkingLevel::Low), ThinkingLevel::Medium);
        assert_eq!(model_effort_policy(m, ThinkingLevel::High), ThinkingLevel::Medium);
        assert_eq!(model_effort_policy(m, ThinkingLevel::Off), ThinkingLevel::Medium);
    }

    #[test]
    fn other_models_keep_requested_level() {
        assert_eq!(
            model_effort_policy("gpt-5.2", ThinkingLevel::Xhigh),
            ThinkingLevel::Xhigh
        );
    }
}
