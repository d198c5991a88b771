//! JSON-Schema subset used for agent and function input/output contracts.
//!
//! Supported keywords: `type` (string or list), `properties`, `required`,
//! `additionalProperties` (bool or schema), `items`, `enum`, `minimum`,
//! `maximum`, `minLength`, `maxLength`, `minItems`, `maxItems`. Annotation
//! keywords such as `title` and `description` are accepted and ignored.
//! `{}` and `true` accept everything; `false` accepts nothing.

use serde_json::{Map, Value};

use crate::error::CoreError;

/// Which side of a call a schema guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStage {
    Input,
    Output,
}

impl std::fmt::Display for SchemaStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaStage::Input => f.write_str("input"),
            SchemaStage::Output => f.write_str("output"),
        }
    }
}

const TYPE_NAMES: &[&str] = &["object", "array", "string", "number", "integer", "boolean", "null"];

/// Validate `value` for `target`, producing a `ValidationError` on mismatch.
pub fn validate_for(
    target: &str,
    stage: SchemaStage,
    schema: &Value,
    value: &Value,
) -> Result<(), CoreError> {
    validate(schema, value).map_err(|message| CoreError::validation(target, format!("{stage} {message}")))
}

/// Check `value` against `schema`. The error names the offending path.
pub fn validate(schema: &Value, value: &Value) -> Result<(), String> {
    check(schema, value, "$")
}

/// Whether `schema` uses only supported keywords with well-typed arguments.
pub fn check_schema(schema: &Value) -> Result<(), String> {
    well_formed(schema, "$")
}

fn check(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let rules = match schema {
        Value::Bool(true) => return Ok(()),
        Value::Bool(false) => return Err(format!("at {path}: no value is allowed")),
        Value::Object(rules) => rules,
        _ => return Ok(()),
    };

    if let Some(expected) = rules.get("type") {
        let names: Vec<&str> = match expected {
            Value::String(name) => vec![name.as_str()],
            Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !names.is_empty() && !names.iter().any(|name| has_type(value, name)) {
            return Err(format!(
                "at {path}: expected {}, got {}",
                names.join(" or "),
                json_type(value)
            ));
        }
    }

    if let Some(Value::Array(allowed)) = rules.get("enum") {
        if !allowed.contains(value) {
            return Err(format!("at {path}: value {value} is not one of {}", Value::Array(allowed.clone())));
        }
    }

    if let Some(x) = value.as_f64() {
        if let Some(min) = rules.get("minimum").and_then(Value::as_f64) {
            if x < min {
                return Err(format!("at {path}: {x} is below the minimum {min}"));
            }
        }
        if let Some(max) = rules.get("maximum").and_then(Value::as_f64) {
            if x > max {
                return Err(format!("at {path}: {x} is above the maximum {max}"));
            }
        }
    }

    match value {
        Value::String(s) => {
            let len = s.chars().count() as u64;
            bounds(rules, "minLength", "maxLength", len, path, "string length")?;
        }
        Value::Array(items) => {
            bounds(rules, "minItems", "maxItems", items.len() as u64, path, "item count")?;
            if let Some(item_schema) = rules.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{path}[{i}]"))?;
                }
            }
        }
        Value::Object(fields) => check_object(rules, fields, path)?,
        _ => {}
    }

    Ok(())
}

fn check_object(rules: &Map<String, Value>, fields: &Map<String, Value>, path: &str) -> Result<(), String> {
    if let Some(Value::Array(required)) = rules.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !fields.contains_key(name) {
                return Err(format!("at {path}: missing required property '{name}'"));
            }
        }
    }

    let properties = rules.get("properties").and_then(Value::as_object);
    for (key, field) in fields {
        let child = format!("{path}.{key}");
        match properties.and_then(|p| p.get(key)) {
            Some(field_schema) => check(field_schema, field, &child)?,
            None => match rules.get("additionalProperties") {
                Some(Value::Bool(false)) => {
                    return Err(format!("at {path}: unexpected property '{key}'"));
                }
                Some(extra @ Value::Object(_)) => check(extra, field, &child)?,
                _ => {}
            },
        }
    }
    Ok(())
}

fn bounds(
    rules: &Map<String, Value>,
    min_key: &str,
    max_key: &str,
    actual: u64,
    path: &str,
    what: &str,
) -> Result<(), String> {
    if let Some(min) = rules.get(min_key).and_then(Value::as_u64) {
        if actual < min {
            return Err(format!("at {path}: {what} {actual} is below {min_key} {min}"));
        }
    }
    if let Some(max) = rules.get(max_key).and_then(Value::as_u64) {
        if actual > max {
            return Err(format!("at {path}: {what} {actual} is above {max_key} {max}"));
        }
    }
    Ok(())
}

fn has_type(value: &Value, name: &str) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.as_f64().is_some_and(|x| x.fract() == 0.0),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => false,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn well_formed(schema: &Value, path: &str) -> Result<(), String> {
    let rules = match schema {
        Value::Bool(_) => return Ok(()),
        Value::Object(rules) => rules,
        other => return Err(format!("at {path}: schema must be an object, got {}", json_type(other))),
    };

    for (key, arg) in rules {
        let ok = match key.as_str() {
            "type" => match arg {
                Value::String(name) => TYPE_NAMES.contains(&name.as_str()),
                Value::Array(list) => list
                    .iter()
                    .all(|v| v.as_str().is_some_and(|n| TYPE_NAMES.contains(&n))),
                _ => false,
            },
            "properties" => match arg {
                Value::Object(props) => {
                    for (name, sub) in props {
                        well_formed(sub, &format!("{path}.properties.{name}"))?;
                    }
                    true
                }
                _ => false,
            },
            "required" => arg
                .as_array()
                .is_some_and(|names| names.iter().all(Value::is_string)),
            "additionalProperties" => match arg {
                Value::Bool(_) => true,
                Value::Object(_) => {
                    well_formed(arg, &format!("{path}.additionalProperties"))?;
                    true
                }
                _ => false,
            },
            "items" => {
                well_formed(arg, &format!("{path}.items"))?;
                true
            }
            "enum" => arg.is_array(),
            "minimum" | "maximum" => arg.is_number(),
            "minLength" | "maxLength" | "minItems" | "maxItems" => arg.is_u64(),
            _ => true,
        };
        if !ok {
            return Err(format!("at {path}: invalid value for '{key}'"));
        }
    }
    Ok(())
}
