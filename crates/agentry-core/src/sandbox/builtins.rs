//! Core builtins and the sandbox-implemented capability modules (`math`, `time`, `log`).

use std::time::Duration;

use serde_json::Value;

use crate::telemetry::GUEST_LOG_TARGET;

use super::budget::{estimate_size, Budget};
use super::capability::Capability;
use super::error::{SandboxError, SandboxResult};
use super::parser::number;

/// Functions callable without any capability.
pub const CORE_BUILTINS: &[&str] = &[
    "len", "keys", "values", "push", "contains", "str", "num", "type_of", "upper", "lower",
    "split", "join", "range", "error",
];

const MATH_FUNCTIONS: &[&str] = &["floor", "ceil", "round", "abs", "min", "max", "pow", "sqrt"];
const TIME_FUNCTIONS: &[&str] = &["sleep", "now"];
const LOG_FUNCTIONS: &[&str] = &["info", "warn"];

/// Functions the sandbox itself implements for `capability`.
/// `None` for host-provided modules, whose function set is decided by the provider.
pub fn module_functions(capability: Capability) -> Option<&'static [&'static str]> {
    match capability {
        Capability::Math => Some(MATH_FUNCTIONS),
        Capability::Time => Some(TIME_FUNCTIONS),
        Capability::Log => Some(LOG_FUNCTIONS),
        Capability::Fs | Capability::Net => None,
    }
}

pub fn is_core_builtin(name: &str) -> bool {
    CORE_BUILTINS.contains(&name)
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Text form used by `str`, `join` and string concatenation.
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn to_f64(value: &Value, line: usize, what: &str) -> SandboxResult<f64> {
    value.as_f64().ok_or_else(|| {
        SandboxError::runtime(
            line,
            format!("{what} expects a number, got {}", type_name(value)),
        )
    })
}

fn to_str<'a>(value: &'a Value, line: usize, what: &str) -> SandboxResult<&'a str> {
    value.as_str().ok_or_else(|| {
        SandboxError::runtime(
            line,
            format!("{what} expects a string, got {}", type_name(value)),
        )
    })
}

fn arity(name: &str, args: &[Value], min: usize, max: usize, line: usize) -> SandboxResult<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{min}..={max}")
        };
        return Err(SandboxError::runtime(
            line,
            format!("{name}() takes {expected} argument(s), got {}", args.len()),
        ));
    }
    Ok(())
}

pub fn call_core(
    name: &str,
    mut args: Vec<Value>,
    line: usize,
    budget: &Budget,
) -> SandboxResult<Value> {
    match name {
        "len" => {
            arity(name, &args, 1, 1, line)?;
            let n = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => {
                    return Err(SandboxError::runtime(
                        line,
                        format!("len() not supported for {}", type_name(other)),
                    ))
                }
            };
            Ok(Value::from(n))
        }
        "keys" | "values" => {
            arity(name, &args, 1, 1, line)?;
            let Value::Object(map) = args.swap_remove(0) else {
                return Err(SandboxError::runtime(line, format!("{name}() expects an object")));
            };
            Ok(if name == "keys" {
                Value::Array(map.into_iter().map(|(k, _)| Value::String(k)).collect())
            } else {
                Value::Array(map.into_iter().map(|(_, v)| v).collect())
            })
        }
        "push" => {
            arity(name, &args, 2, 2, line)?;
            let item = args.pop().unwrap_or(Value::Null);
            let Value::Array(mut items) = args.pop().unwrap_or(Value::Null) else {
                return Err(SandboxError::runtime(line, "push() expects an array"));
            };
            budget.reserve(24 + estimate_size(&item) + items.iter().map(estimate_size).sum::<usize>())?;
            items.push(item);
            Ok(Value::Array(items))
        }
        "contains" => {
            arity(name, &args, 2, 2, line)?;
            let found = match (&args[0], &args[1]) {
                (Value::String(hay), Value::String(needle)) => hay.contains(needle.as_str()),
                (Value::Array(items), needle) => items.contains(needle),
                (Value::Object(map), Value::String(key)) => map.contains_key(key),
                (hay, _) => {
                    return Err(SandboxError::runtime(
                        line,
                        format!("contains() not supported for {}", type_name(hay)),
                    ))
                }
            };
            Ok(Value::Bool(found))
        }
        "str" => {
            arity(name, &args, 1, 1, line)?;
            let text = display(&args[0]);
            budget.reserve(24 + text.len())?;
            Ok(Value::String(text))
        }
        "num" => {
            arity(name, &args, 1, 1, line)?;
            match &args[0] {
                Value::Number(_) => Ok(args.swap_remove(0)),
                Value::Bool(b) => Ok(Value::from(u8::from(*b))),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(number)
                    .map_err(|_| SandboxError::runtime(line, format!("num(): '{s}' is not a number"))),
                other => Err(SandboxError::runtime(
                    line,
                    format!("num() not supported for {}", type_name(other)),
                )),
            }
        }
        "type_of" => {
            arity(name, &args, 1, 1, line)?;
            Ok(Value::String(type_name(&args[0]).to_string()))
        }
        "upper" | "lower" => {
            arity(name, &args, 1, 1, line)?;
            let s = to_str(&args[0], line, name)?;
            Ok(Value::String(if name == "upper" {
                s.to_uppercase()
            } else {
                s.to_lowercase()
            }))
        }
        "split" => {
            arity(name, &args, 2, 2, line)?;
            let s = to_str(&args[0], line, name)?;
            let sep = to_str(&args[1], line, name)?;
            let parts: Vec<Value> = if sep.is_empty() {
                s.chars().map(|c| Value::String(c.to_string())).collect()
            } else {
                s.split(sep).map(|p| Value::String(p.to_string())).collect()
            };
            budget.reserve(24 + parts.len() * 24 + s.len())?;
            Ok(Value::Array(parts))
        }
        "join" => {
            arity(name, &args, 1, 2, line)?;
            let sep = match args.get(1) {
                Some(v) => to_str(v, line, name)?.to_string(),
                None => String::new(),
            };
            let Value::Array(items) = &args[0] else {
                return Err(SandboxError::runtime(line, "join() expects an array"));
            };
            let joined = items.iter().map(display).collect::<Vec<_>>().join(&sep);
            budget.reserve(24 + joined.len())?;
            Ok(Value::String(joined))
        }
        "range" => {
            arity(name, &args, 1, 2, line)?;
            let (start, end) = if args.len() == 1 {
                (0.0, to_f64(&args[0], line, name)?)
            } else {
                (to_f64(&args[0], line, name)?, to_f64(&args[1], line, name)?)
            };
            let (start, end) = (start.floor() as i64, end.floor() as i64);
            let count = end.saturating_sub(start).max(0) as usize;
            budget.reserve(24usize.saturating_add(count.saturating_mul(16)))?;
            Ok(Value::Array((start..end).map(Value::from).collect()))
        }
        "error" => {
            let message = args.first().map(display).unwrap_or_else(|| "error".into());
            Err(SandboxError::runtime(line, message))
        }
        other => Err(SandboxError::runtime(line, format!("unknown function '{other}'"))),
    }
}

pub fn call_module(
    capability: Capability,
    function: &str,
    args: Vec<Value>,
    line: usize,
    budget: &Budget,
    origin: &str,
) -> SandboxResult<Value> {
    match capability {
        Capability::Math => call_math(function, &args, line),
        Capability::Time => match function {
            "sleep" => {
                arity("time.sleep", &args, 1, 1, line)?;
                let ms = to_f64(&args[0], line, "time.sleep")?.max(0.0);
                budget.sleep(Duration::from_millis(ms as u64))?;
                Ok(Value::Null)
            }
            "now" => Ok(Value::from(chrono::Utc::now().timestamp_millis())),
            other => Err(unknown_member(capability, other, line)),
        },
        Capability::Log => {
            let message = args.iter().map(display).collect::<Vec<_>>().join(" ");
            match function {
                "info" => {
                    tracing::info!(target: GUEST_LOG_TARGET, function = origin, "{message}")
                }
                "warn" => {
                    tracing::warn!(target: GUEST_LOG_TARGET, function = origin, "{message}")
                }
                other => return Err(unknown_member(capability, other, line)),
            }
            Ok(Value::Null)
        }
        Capability::Fs | Capability::Net => Err(SandboxError::runtime(
            line,
            format!("module '{capability}' has no provider installed"),
        )),
    }
}

fn unknown_member(capability: Capability, function: &str, line: usize) -> SandboxError {
    SandboxError::runtime(line, format!("unknown function '{capability}.{function}'"))
}

fn call_math(function: &str, args: &[Value], line: usize) -> SandboxResult<Value> {
    let what = format!("math.{function}");
    let unary = |f: fn(f64) -> f64| -> SandboxResult<Value> {
        arity(&what, args, 1, 1, line)?;
        Ok(number(f(to_f64(&args[0], line, &what)?)))
    };
    match function {
        "floor" => unary(f64::floor),
        "ceil" => unary(f64::ceil),
        "round" => unary(f64::round),
        "abs" => unary(f64::abs),
        "sqrt" => {
            arity(&what, args, 1, 1, line)?;
            let x = to_f64(&args[0], line, &what)?;
            if x < 0.0 {
                return Err(SandboxError::runtime(line, "math.sqrt of a negative number"));
            }
            Ok(number(x.sqrt()))
        }
        "pow" => {
            arity(&what, args, 2, 2, line)?;
            let base = to_f64(&args[0], line, &what)?;
            let exp = to_f64(&args[1], line, &what)?;
            let result = base.powf(exp);
            if !result.is_finite() {
                return Err(SandboxError::runtime(line, "math.pow overflowed"));
            }
            Ok(number(result))
        }
        "min" | "max" => {
            // accepts either varargs or a single array
            let values: Vec<Value> = match args {
                [Value::Array(items)] => items.clone(),
                _ => args.to_vec(),
            };
            if values.is_empty() {
                return Err(SandboxError::runtime(line, format!("{what}() of nothing")));
            }
            let mut best = to_f64(&values[0], line, &what)?;
            for v in &values[1..] {
                let x = to_f64(v, line, &what)?;
                best = if function == "min" { best.min(x) } else { best.max(x) };
            }
            Ok(number(best))
        }
        other => Err(unknown_member(Capability::Math, other, line)),
    }
}
