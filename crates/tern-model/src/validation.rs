// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-argument validation against a tool's JSON-Schema `parameters`.
//!
//! Validation understands the schema subset tools actually use: a `type` per
//! property (string, number, integer, boolean, array, object), a `required`
//! list, and a `properties` map. Models occasionally emit camelCase keys for
//! snake_case parameters; a required key missing in snake_case is rescued
//! from its camelCase spelling before validation. A failure is fatal for the
//! single tool call only — it surfaces as an error tool-result, never as a
//! turn abort.

use anyhow::{anyhow, bail, Result};
use serde_json::{Map, Value};

use crate::types::{Tool, ToolCallBlock};

/// Validate `call.arguments` against the schema of the tool named by the
/// call. Returns the validated argument object (unknown keys dropped).
pub fn validate_tool_arguments(tools: &[Tool], call: &ToolCallBlock) -> Result<Map<String, Value>> {
    let tool = tools
        .iter()
        .find(|t| t.name == call.name)
        .ok_or_else(|| anyhow!("Tool {} not found", call.name))?;

    let properties = tool
        .parameters
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let required: Vec<&str> = tool
        .parameters
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut args = call.arguments.clone();

    // camelCase rescue: move a required value spelled in camelCase under its
    // declared snake_case key.
    for key in &required {
        if !args.contains_key(*key) {
            let camel = snake_to_camel(key);
            if camel != **key {
                if let Some(value) = args.remove(&camel) {
                    args.insert((*key).to_string(), value);
                }
            }
        }
    }

    for key in &required {
        if !args.contains_key(*key) {
            bail!("Missing required argument \"{key}\" for tool {}", tool.name);
        }
    }

    let mut validated = Map::new();
    for (name, schema) in &properties {
        let Some(value) = args.get(name) else { continue };
        check_type(name, schema, value, &tool.name)?;
        validated.insert(name.clone(), value.clone());
    }
    Ok(validated)
}

fn check_type(name: &str, schema: &Value, value: &Value, tool_name: &str) -> Result<()> {
    let Some(expected) = schema.get("type").and_then(Value::as_str) else {
        return Ok(());
    };
    let ok = match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    };
    if !ok {
        bail!(
            "Invalid argument \"{name}\" for tool {tool_name}: expected {expected}, got {}",
            json_type_name(value)
        );
    }
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn snake_to_camel(key: &str) -> String {
    let mut parts = key.split('_').filter(|p| !p.is_empty());
    let Some(first) = parts.next() else {
        return key.to_string();
    };
    let mut out = first.to_string();
    for part in parts {
        let mut chars = part.chars();
        if let Some(c) = chars.next() {
            out.extend(c.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_tool() -> Tool {
        Tool {
            name: "echo".into(),
            description: "Echo a value".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "value": { "type": "string" },
                    "count": { "type": "integer" },
                },
                "required": ["value"],
            }),
        }
    }

    fn call(args: Value) -> ToolCallBlock {
        ToolCallBlock {
            id: "t1".into(),
            name: "echo".into(),
            arguments: args.as_object().cloned().unwrap_or_default(),
            thought_signature: None,
        }
    }

    #[test]
    fn valid_arguments_pass() {
        let v = validate_tool_arguments(&[echo_tool()], &call(json!({"value": "hi", "count": 2}))).unwrap();
        assert_eq!(v.get("value"), Some(&json!("hi")));
        assert_eq!(v.get("count"), Some(&json!(2)));
    }

    #[test]
    fn unknown_tool_fails_with_not_found() {
        let mut c = call(json!({}));
        c.name = "missing".into();
        let err = validate_tool_arguments(&[echo_tool()], &c).unwrap_err();
        assert_eq!(err.to_string(), "Tool missing not found");
    }

    #[test]
    fn missing_required_fails() {
        let err = validate_tool_arguments(&[echo_tool()], &call(json!({"count": 1}))).unwrap_err();
        assert!(err.to_string().contains("value"), "{err}");
    }

    #[test]
    fn wrong_type_fails_naming_the_field() {
        let err = validate_tool_arguments(&[echo_tool()], &call(json!({"value": 42}))).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("value") && msg.contains("string"), "{msg}");
    }

    #[test]
    fn integer_rejects_float() {
        let err =
            validate_tool_arguments(&[echo_tool()], &call(json!({"value": "x", "count": 1.5}))).unwrap_err();
        assert!(err.to_string().contains("count"));
    }

    #[test]
    fn number_accepts_integers_and_floats() {
        let tool = Tool {
            name: "num".into(),
            description: String::new(),
            parameters: json!({
                "type": "object",
                "properties": { "n": { "type": "number" } },
                "required": ["n"],
            }),
        };
        let mut c = call(json!({"n": 3}));
        c.name = "num".into();
        assert!(validate_tool_arguments(&[tool.clone()], &c).is_ok());
        let mut c = call(json!({"n": 3.5}));
        c.name = "num".into();
        assert!(validate_tool_arguments(&[tool], &c).is_ok());
    }

    #[test]
    fn camel_case_variant_rescued_for_required_snake_key() {
        let tool = Tool {
            name: "read".into(),
            description: String::new(),
            parameters: json!({
                "type": "object",
                "properties": { "file_path": { "type": "string" } },
                "required": ["file_path"],
            }),
        };
        let mut c = call(json!({"filePath": "/tmp/x"}));
        c.name = "read".into();
        let v = validate_tool_arguments(&[tool], &c).unwrap();
        assert_eq!(v.get("file_path"), Some(&json!("/tmp/x")));
        assert!(v.get("filePath").is_none());
    }

    #[test]
    fn unknown_keys_are_dropped() {
        let v = validate_tool_arguments(
            &[echo_tool()],
            &call(json!({"value": "x", "stray": true})),
        )
        .unwrap();
        assert!(v.get("stray").is_none());
    }

    #[test]
    fn schema_without_required_accepts_empty_args() {
        let tool = Tool {
            name: "noop".into(),
            description: String::new(),
            parameters: json!({"type": "object", "properties": {}}),
        };
        let mut c = call(json!({}));
        c.name = "noop".into();
        assert!(validate_tool_arguments(&[tool], &c).is_ok());
    }
}
