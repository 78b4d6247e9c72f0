// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-argument validation against the tool's JSON Schema.
//!
//! Errors come back as human-readable `path: reason` strings suitable for
//! attaching to a synthetic error tool result, so the model can correct its
//! arguments on the next turn.

use serde_json::Value;

/// Validate `arguments` against `schema`.  Returns an empty list when valid.
pub fn validate_tool_arguments(schema: &Value, arguments: &Value) -> Vec<String> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => return vec![format!("Invalid schema: {e}")],
    };

    validator
        .iter_errors(arguments)
        .map(|error| {
            let path = error.instance_path().to_string();
            let path = if path.is_empty() {
                "(root)".to_string()
            } else {
                path
            };
            format!("{path}: {error}")
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "depth": { "type": "integer", "minimum": 0 }
            },
            "required": ["path"]
        })
    }

    #[test]
    fn valid_arguments_pass() {
        let errors = validate_tool_arguments(&schema(), &json!({"path": "/tmp", "depth": 2}));
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn missing_required_field_is_reported_at_root() {
        let errors = validate_tool_arguments(&schema(), &json!({}));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("(root): "), "got: {}", errors[0]);
        assert!(errors[0].contains("path"));
    }

    #[test]
    fn wrong_type_reports_the_field_path() {
        let errors = validate_tool_arguments(&schema(), &json!({"path": 42}));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("/path: "), "got: {}", errors[0]);
    }

    #[test]
    fn multiple_violations_all_reported() {
        let errors =
            validate_tool_arguments(&schema(), &json!({"path": 42, "depth": -1}));
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn uncompilable_schema_reports_schema_error() {
        let errors = validate_tool_arguments(&json!({"type": "nonsense"}), &json!({}));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Invalid schema"));
    }

    #[test]
    fn empty_object_schema_accepts_anything() {
        let errors = validate_tool_arguments(&json!({}), &json!({"anything": [1, 2]}));
        assert!(errors.is_empty());
    }
}
