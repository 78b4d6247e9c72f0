// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Best-effort parsing of streamed, potentially incomplete JSON.

use serde_json::Value;

/// Suffixes tried, in order, to complete a truncated JSON fragment.
const COMPLETION_SUFFIXES: &[&str] = &["}", "}}", "}}}", "]", "]}", "\"}", "\"]"];

/// Parse tool-call arguments that arrived as an incremental text stream.
///
/// Tries a standard parse first, then appends each completion suffix until
/// one yields valid JSON.  Falls back to the empty object so a truncated
/// stream can never surface a string where callers expect an object.
pub fn parse_streaming_json(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Object(Default::default());
    }

    if let Ok(v) = serde_json::from_str::<Value>(text) {
        return v;
    }

    for suffix in COMPLETION_SUFFIXES {
        let candidate = format!("{text}{suffix}");
        if let Ok(v) = serde_json::from_str::<Value>(&candidate) {
            return v;
        }
    }

    Value::Object(Default::default())
}

/// Like [`parse_streaming_json`] but guarantees the result is an object,
/// wrapping or discarding non-object parses.
pub fn parse_streaming_json_object(text: &str) -> Value {
    match parse_streaming_json(text) {
        v @ Value::Object(_) => v,
        _ => Value::Object(Default::default()),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
