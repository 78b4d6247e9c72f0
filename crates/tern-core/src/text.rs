// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Small text utilities shared by session pickers and transcript display:
//! fuzzy filtering for selector lists and head truncation for long values.

/// Result of a truncation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncated {
    pub text: String,
    pub truncated: bool,
}

/// Keep the tail of `text`, dropping the head when it exceeds `max_chars`.
///
/// Truncation happens at a character boundary and is marked with a leading
/// ellipsis notice.
pub fn truncate_head(text: &str, max_chars: usize) -> Truncated {
    let char_count = text.chars().count();
    if char_count <= max_chars {
        return Truncated {
            text: text.to_string(),
            truncated: false,
        };
    }
    let kept: String = text
        .chars()
        .skip(char_count - max_chars)
        .collect();
    Truncated {
        text: format!("[...]{kept}"),
        truncated: true,
    }
}

/// Fuzzy-match `pattern` against `candidate` (case-insensitive).
///
/// Returns `Some(score)` when every pattern char appears in order in the
/// candidate, `None` otherwise.
///
/// Scoring:
/// - +1 per matched character
/// - +5 bonus when the match starts at position 0
/// - +3 bonus for each consecutive character match
pub fn fuzzy_score(pattern: &str, candidate: &str) -> Option<usize> {
    if pattern.is_empty() {
        return Some(0);
    }

    let pattern_lc: Vec<char> = pattern.to_lowercase().chars().collect();
    let candidate_lc: Vec<char> = candidate.to_lowercase().chars().collect();

    let mut score = 0usize;
    let mut pi = 0usize;
    let mut last_match: Option<usize> = None;

    for (ci, c) in candidate_lc.iter().enumerate() {
        if pi < pattern_lc.len() && *c == pattern_lc[pi] {
            score += 1;
            if pi == 0 && ci == 0 {
                score += 5;
            }
            if let Some(last) = last_match {
                if ci == last + 1 {
                    score += 3;
                }
            }
            last_match = Some(ci);
            pi += 1;
        }
    }

    if pi == pattern_lc.len() {
        Some(score)
    } else {
        None
    }
}

/// Filter `items` to those matching `query`, best matches first.
///
/// The result is always a subset of `items`; ties keep the original order.
pub fn fuzzy_filter<'a, T>(
    items: &'a [T],
    query: &str,
    key: impl Fn(&T) -> &str,
) -> Vec<&'a T> {
    let mut scored: Vec<(usize, usize, &T)> = items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| fuzzy_score(query, key(item)).map(|score| (score, i, item)))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    scored.into_iter().map(|(_, _, item)| item).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
