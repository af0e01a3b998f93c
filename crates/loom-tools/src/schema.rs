// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Normalization and validation of tool argument JSON Schemas (Draft
//! 2020-12), applied once at registration time and then reused for every
//! dispatched call.

use serde_json::{Map, Value};

/// Normalize a tool's parameter schema for registration:
/// - inlines `$defs`/`definitions` referenced via local `$ref`s;
/// - strips `title` and `format`, which are documentation-only and
///   otherwise just bloat the schema sent to the model;
/// - converts `{"type": [...]}` into an equivalent `anyOf` of single-type
///   schemas, since some validators (and most models) only handle a single
///   `type` string cleanly.
pub fn normalize_schema(mut schema: Value) -> Value {
    inline_local_refs(&mut schema);
    strip_and_convert(&mut schema);
    schema
}

fn inline_local_refs(root: &mut Value) {
    let defs = root
        .get("$defs")
        .or_else(|| root.get("definitions"))
        .cloned();
    if let Some(defs) = defs {
        replace_refs(root, &defs);
    }
    if let Some(obj) = root.as_object_mut() {
        obj.remove("$defs");
        obj.remove("definitions");
    }
}

fn replace_refs(v: &mut Value, defs: &Value) {
    match v {
        Value::Object(map) => {
            if let Some(Value::String(r)) = map.get("$ref").cloned() {
                if let Some(name) = r.rsplit('/').next() {
                    if let Some(target) = defs.get(name) {
                        let mut inlined = target.clone();
                        replace_refs(&mut inlined, defs);
                        *v = inlined;
                        return;
                    }
                }
            }
            for val in map.values_mut() {
                replace_refs(val, defs);
            }
        }
        Value::Array(items) => {
            for item in items {
                replace_refs(item, defs);
            }
        }
        _ => {}
    }
}

fn strip_and_convert(v: &mut Value) {
    match v {
        Value::Object(map) => {
            map.remove("title");
            map.remove("format");

            if let Some(Value::Array(types)) = map.get("type").cloned() {
                let rest: Map<String, Value> = map
                    .iter()
                    .filter(|(k, _)| *k != "type")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let variants: Vec<Value> = types
                    .into_iter()
                    .map(|t| {
                        let mut variant = rest.clone();
                        variant.insert("type".to_string(), t);
                        Value::Object(variant)
                    })
                    .collect();
                map.clear();
                map.insert("anyOf".to_string(), Value::Array(variants));
            }

            for val in map.values_mut() {
                strip_and_convert(val);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_and_convert(item);
            }
        }
        _ => {}
    }
}

/// Validate `args` against a (normalized) parameter schema. Returns the
/// validator's error message on the first failure, matching the dispatch
/// contract's `ToolReturnValue{is_error=true, message=<validator message>}`.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
    validator.validate(args).map_err(|e| e.to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_title_and_format() {
        let schema = json!({
            "type": "object",
            "title": "Args",
            "properties": {
                "when": {"type": "string", "format": "date-time", "title": "When"}
            }
        });
        let normalized = normalize_schema(schema);
        assert!(normalized.get("title").is_none());
        assert!(normalized["properties"]["when"].get("format").is_none());
        assert!(normalized["properties"]["when"].get("title").is_none());
    }

    #[test]
    fn converts_type_array_to_any_of() {
        let schema = json!({
            "type": "object",
            "properties": {
                "count": {"type": ["integer", "null"]}
            }
        });
        let normalized = normalize_schema(schema);
        let variants = normalized["properties"]["count"]["anyOf"]
            .as_array()
            .expect("anyOf array");
        assert_eq!(variants.len(), 2);
        assert!(variants.iter().any(|v| v["type"] == "integer"));
        assert!(variants.iter().any(|v| v["type"] == "null"));
    }

    #[test]
    fn inlines_local_defs_refs() {
        let schema = json!({
            "type": "object",
            "$defs": {
                "Point": {"type": "object", "properties": {"x": {"type": "number"}}}
            },
            "properties": {
                "origin": {"$ref": "#/$defs/Point"}
            }
        });
        let normalized = normalize_schema(schema);
        assert!(normalized.get("$defs").is_none());
        assert_eq!(normalized["properties"]["origin"]["type"], "object");
        assert!(normalized["properties"]["origin"]["properties"]["x"].is_object());
    }

    #[test]
    fn valid_args_pass_validation() {
        let schema = json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        });
        assert!(validate_args(&schema, &json!({"path": "/tmp/x"})).is_ok());
    }

    #[test]
    fn missing_required_field_fails_validation() {
        let schema = json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        });
        assert!(validate_args(&schema, &json!({})).is_err());
    }

    #[test]
    fn wrong_type_fails_validation() {
        let schema = json!({
            "type": "object",
            "properties": {"count": {"type": "integer"}}
        });
        assert!(validate_args(&schema, &json!({"count": "not a number"})).is_err());
    }
}
