//! Validates the case's final output against a structural subset of JSON
//! Schema: `type`, `enum`, `required`, `properties` (recursive) and `items`
//! (recursive). No `$ref`, no combinators, no numeric ranges — the subset is
//! deliberately small so verdicts stay deterministic and explainable.
//! Hard-fail.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::CoreError;
use crate::judge::{extract_final_output, parse_config, Judge};
use crate::model::{EvalCase, JudgeResult};

const JUDGE_ID: &str = "json_schema";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JsonSchemaConfig {}

#[derive(Debug, Default)]
pub struct JsonSchemaJudge {
    _config: JsonSchemaConfig,
}

impl JsonSchemaJudge {
    pub fn from_config(value: &Value) -> Result<Self, CoreError> {
        Ok(Self {
            _config: parse_config(JUDGE_ID, value)?,
        })
    }
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Recursive structural walk collecting one error string per violation.
fn validate_subset(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let expected_type = schema.get("type").and_then(Value::as_str);
    if let Some(expected) = expected_type {
        if !type_matches(value, expected) {
            errors.push(format!("{path}: expected type {expected}"));
            return;
        }
    }

    if let Some(enum_values) = schema.get("enum").and_then(Value::as_array) {
        if !enum_values.contains(value) {
            errors.push(format!("{path}: value not in enum"));
        }
    }

    if expected_type == Some("object") {
        if let Some(object) = value.as_object() {
            if let Some(required) = schema.get("required").and_then(Value::as_array) {
                for key in required.iter().filter_map(Value::as_str) {
                    if !object.contains_key(key) {
                        errors.push(format!("{path}: missing required key '{key}'"));
                    }
                }
            }
            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                for (key, prop_schema) in properties {
                    if let (Some(child), true) = (object.get(key), prop_schema.is_object()) {
                        validate_subset(prop_schema, child, &format!("{path}.{key}"), errors);
                    }
                }
            }
        }
    }

    if expected_type == Some("array") {
        if let (Some(items), Some(item_schema)) = (value.as_array(), schema.get("items")) {
            if item_schema.is_object() {
                for (index, item) in items.iter().enumerate() {
                    validate_subset(item_schema, item, &format!("{path}[{index}]"), errors);
                }
            }
        }
    }
}

impl Judge for JsonSchemaJudge {
    fn id(&self) -> &'static str {
        JUDGE_ID
    }

    fn evaluate(&self, case: &EvalCase) -> JudgeResult {
        let Some(schema) = case.json_schema.as_ref() else {
            return JudgeResult::skipped(JUDGE_ID, &case.case_id, "no json schema configured", true);
        };

        let Some(raw_output) = extract_final_output(case) else {
            return JudgeResult::new(
                JUDGE_ID,
                &case.case_id,
                0.0,
                false,
                "final output missing for json schema evaluation",
                true,
                Value::Null,
            );
        };

        let parsed = match &raw_output {
            Value::String(text) => match serde_json::from_str::<Value>(text) {
                Ok(parsed) => parsed,
                Err(err) => {
                    return JudgeResult::new(
                        JUDGE_ID,
                        &case.case_id,
                        0.0,
                        false,
                        "final output is not valid JSON",
                        true,
                        json!({ "error": err.to_string() }),
                    );
                }
            },
            other => other.clone(),
        };

        let mut errors = Vec::new();
        validate_subset(schema, &parsed, "$", &mut errors);
        let passed = errors.is_empty();

        JudgeResult::new(
            JUDGE_ID,
            &case.case_id,
            if passed { 1.0 } else { 0.0 },
            passed,
            if passed {
                "json schema checks passed"
            } else {
                "json schema mismatch"
            },
            true,
            json!({ "errors": errors }),
        )
    }
}
