//! Binding supplied arguments to declared parameters

use indexmap::IndexMap;
use thiserror::Error;

use crate::document::{ParamSpec, ParamType};
use crate::value::Value;

/// Parameters after coercion, in declaration order
pub type BoundParams = IndexMap<String, Value>;

/// A single parameter that failed to bind
#[derive(Debug, Clone, PartialEq)]
pub struct ParamFailure {
    pub name: String,
    pub reason: String,
}

impl std::fmt::Display for ParamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.reason)
    }
}

/// Every binding failure of one call
#[derive(Error, Debug, Clone, PartialEq)]
#[error("parameter validation failed: {}", summary(.failures))]
pub struct ParamValidationError {
    pub failures: Vec<ParamFailure>,
}

fn summary(failures: &[ParamFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Resolve declared parameters against supplied arguments
///
/// A supplied `null` counts as absent. Optional parameters with neither a
/// value nor a default bind to `null`. Failures are collected for every
/// parameter before returning.
pub fn bind(
    specs: &IndexMap<String, ParamSpec>,
    supplied: &IndexMap<String, Value>,
) -> Result<BoundParams, ParamValidationError> {
    let mut bound = IndexMap::with_capacity(specs.len());
    let mut failures = Vec::new();
    let mut fail = |name: &str, reason: String| {
        failures.push(ParamFailure {
            name: name.to_string(),
            reason,
        })
    };

    for (name, spec) in specs {
        let value = match supplied.get(name).filter(|v| !v.is_null()) {
            Some(value) => match coerce(value, spec.param_type) {
                Ok(value) => value,
                Err(reason) => {
                    fail(name, reason);
                    continue;
                }
            },
            None => match &spec.default {
                Some(default) => default.clone(),
                None if spec.required => {
                    fail(name, "missing required parameter".to_string());
                    continue;
                }
                None => Value::Null,
            },
        };

        if let (Some(pattern), Value::String(text)) = (&spec.pattern, &value) {
            if !pattern.is_match(text) {
                fail(
                    name,
                    format!("value '{}' does not match pattern '{}'", text, pattern.as_str()),
                );
                continue;
            }
        }
        bound.insert(name.clone(), value);
    }

    for name in supplied.keys() {
        if !specs.contains_key(name) {
            fail(name, "unknown parameter".to_string());
        }
    }

    if failures.is_empty() {
        Ok(bound)
    } else {
        Err(ParamValidationError { failures })
    }
}

/// Convert a supplied value to a declared type
pub fn coerce(value: &Value, target: ParamType) -> Result<Value, String> {
    let rejected = || {
        format!(
            "expected {}, got {} '{}'",
            target,
            value.type_name(),
            value.render()
        )
    };

    match target {
        ParamType::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => Ok(Value::String(value.render())),
            _ => Err(rejected()),
        },
        ParamType::Integer => match value {
            Value::Int(_) => Ok(value.clone()),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Ok(Value::Int(*f as i64))
            }
            Value::String(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| rejected()),
            _ => Err(rejected()),
        },
        ParamType::Float => match value {
            Value::Float(_) => Ok(value.clone()),
            Value::Int(n) => Ok(Value::Float(*n as f64)),
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(Value::Float(f)),
                _ => Err(rejected()),
            },
            _ => Err(rejected()),
        },
        ParamType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::Int(0) => Ok(Value::Bool(false)),
            Value::Int(1) => Ok(Value::Bool(true)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "off" | "0" => Ok(Value::Bool(false)),
                _ => Err(rejected()),
            },
            _ => Err(rejected()),
        },
        ParamType::List => match value {
            Value::List(_) => Ok(value.clone()),
            Value::String(s) if s.trim().is_empty() => Ok(Value::List(Vec::new())),
            Value::String(s) => Ok(Value::List(
                s.split(',')
                    .map(|item| Value::String(item.trim().to_string()))
                    .collect(),
            )),
            _ => Err(rejected()),
        },
    }
}
