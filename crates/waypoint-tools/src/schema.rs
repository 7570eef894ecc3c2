//! Decoding of raw tool-call arguments against a tool's input schema.

use serde_json::Value;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::types::ToolCall;

/// Parse `call.content` and check it against `schema`.
///
/// An empty argument string decodes to an empty object.
pub fn decode_arguments(call: &ToolCall, schema: &Value) -> Result<Value> {
    let raw = call.content.trim();
    let args: Value = if raw.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(raw).map_err(|e| {
            WaypointError::ToolValidation(format!(
                "{}: arguments are not valid JSON: {}",
                call.tool, e
            ))
        })?
    };

    validate_against_schema(schema, &args).map_err(|violations| {
        WaypointError::ToolValidation(format!("{}: {}", call.tool, violations))
    })?;
    Ok(args)
}

/// Check `value` against a JSON Schema.
///
/// On failure returns every violation joined with `; `. A schema that does
/// not compile is reported the same way.
pub fn validate_against_schema(schema: &Value, value: &Value) -> std::result::Result<(), String> {
    let validator =
        jsonschema::Validator::new(schema).map_err(|e| format!("invalid schema: {}", e))?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let violations: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    Err(violations.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "integer"},
                "label": {"type": "string"}
            },
            "required": ["a", "b"]
        })
    }

    fn call(content: &str) -> ToolCall {
        ToolCall::new(Some("c1".into()), "add", content)
    }

    #[test]
    fn decodes_valid_arguments() {
        let args = decode_arguments(&call(r#"{"a": 1, "b": 2}"#), &schema()).unwrap();
        assert_eq!(args["a"], 1);
    }

    #[test]
    fn malformed_json_is_a_validation_error() {
        let err = decode_arguments(&call(r#"{"a": 1,"#), &schema()).unwrap_err();
        assert!(matches!(err, WaypointError::ToolValidation(msg) if msg.contains("not valid JSON")));
    }

    #[test]
    fn missing_required_field() {
        let err = decode_arguments(&call(r#"{"a": 1}"#), &schema()).unwrap_err();
        assert!(matches!(err, WaypointError::ToolValidation(msg) if msg.starts_with("add:") && msg.contains("\"b\"")));
    }

    #[test]
    fn wrong_property_type() {
        let err = decode_arguments(&call(r#"{"a": "one", "b": 2}"#), &schema()).unwrap_err();
        assert!(matches!(err, WaypointError::ToolValidation(msg) if msg.contains("integer")));
    }

    #[test]
    fn empty_arguments_decode_to_object() {
        let args = decode_arguments(&call(""), &json!({"type": "object"})).unwrap();
        assert_eq!(args, json!({}));
    }

    #[test]
    fn enum_and_nested_required_are_enforced() {
        let schema = json!({
            "type": "object",
            "properties": {
                "op": {"type": "string", "enum": ["add", "sub"]},
                "inner": {
                    "type": "object",
                    "properties": {"x": {"type": "integer"}},
                    "required": ["x"]
                }
            },
            "required": ["op"]
        });

        let err = decode_arguments(&call(r#"{"op": "pow", "inner": {}}"#), &schema).unwrap_err();
        let WaypointError::ToolValidation(msg) = err else {
            panic!("expected a validation error");
        };
        assert!(msg.contains("pow"), "{}", msg);
        assert!(msg.contains("\"x\""), "{}", msg);

        assert!(decode_arguments(&call(r#"{"op": "sub", "inner": {"x": 2}}"#), &schema).is_ok());
    }

    #[test]
    fn minimum_and_items_are_enforced() {
        let schema = json!({
            "type": "object",
            "properties": {
                "count": {"type": "integer", "minimum": 1},
                "tags": {"type": "array", "items": {"type": "string"}}
            }
        });
        assert!(decode_arguments(&call(r#"{"count": 0}"#), &schema).is_err());
        assert!(decode_arguments(&call(r#"{"tags": ["a", 2]}"#), &schema).is_err());
        assert!(decode_arguments(&call(r#"{"count": 3, "tags": ["a"]}"#), &schema).is_ok());
    }

    #[test]
    fn uncompilable_schema_is_reported() {
        let err = validate_against_schema(&json!({"type": 12}), &json!({})).unwrap_err();
        assert!(err.contains("invalid schema"));
    }
}
