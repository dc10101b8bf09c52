//! Argument validation
//!
//! Callers send loosely-typed JSON; every declared argument is coerced to
//! its declared type before a task is admitted. A value is either fully
//! coerced or rejected.

use crate::function::{ArgSpec, ArgType, CallArguments};
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Why a payload does not match a function's arguments
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("Parameter Missing: {0}")]
    Missing(String),

    #[error("Parameter is Invalid: {name} {raw} {arg_type}")]
    Invalid {
        name: String,
        raw: String,
        arg_type: ArgType,
    },
}

const TRUTHY: &[&str] = &["true", "1", "t", "y", "yes"];
const FALSY: &[&str] = &["false", "0", "f", "n", "no"];

/// Textual form of a raw value: a string is its contents, anything else its
/// compact JSON
pub fn stringify(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Coerce `raw` to `arg_type`, or `None` if it cannot be
pub fn validate(raw: &Value, arg_type: ArgType) -> Option<Value> {
    match arg_type {
        ArgType::Integer => to_integer(raw).map(Value::from),
        ArgType::Float => to_float(raw)
            .and_then(Number::from_f64)
            .map(Value::Number),
        ArgType::String => Some(Value::String(stringify(raw))),
        ArgType::Boolean => {
            let lower = stringify(raw).to_lowercase();
            if TRUTHY.contains(&lower.as_str()) {
                Some(Value::Bool(true))
            } else if FALSY.contains(&lower.as_str()) {
                Some(Value::Bool(false))
            } else {
                None
            }
        }
        ArgType::List => raw.is_array().then(|| raw.clone()),
        ArgType::Dict => raw.is_object().then(|| raw.clone()),
    }
}

fn to_integer(raw: &Value) -> Option<i64> {
    if let Value::Number(n) = raw {
        if n.is_f64() {
            // Truncate toward zero; 2^63 itself is out of range
            let truncated = n.as_f64()?.trunc();
            let in_range = truncated.is_finite()
                && truncated >= i64::MIN as f64
                && truncated < 9_223_372_036_854_775_808.0;
            return in_range.then_some(truncated as i64);
        }
    }
    stringify(raw).trim().parse().ok()
}

fn to_float(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Validate `supplied` against `specs`, failing on the first problem.
///
/// Keys without a matching spec are dropped; absent optional arguments are
/// simply left out.
pub fn build_call_arguments(
    specs: &[ArgSpec],
    supplied: &Map<String, Value>,
) -> Result<CallArguments, ArgumentError> {
    let mut arguments = CallArguments::new();

    for spec in specs {
        match supplied.get(&spec.name) {
            Some(raw) => {
                let value = validate(raw, spec.arg_type).ok_or_else(|| ArgumentError::Invalid {
                    name: spec.name.clone(),
                    raw: stringify(raw),
                    arg_type: spec.arg_type,
                })?;
                arguments.insert(spec.name.clone(), value);
            }
            None if spec.is_required => return Err(ArgumentError::Missing(spec.name.clone())),
            None => {}
        }
    }

    Ok(arguments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integer() {
        assert_eq!(validate(&json!(3), ArgType::Integer), Some(json!(3)));
        assert_eq!(validate(&json!(3.9), ArgType::Integer), Some(json!(3)));
        assert_eq!(validate(&json!(-3.9), ArgType::Integer), Some(json!(-3)));
        assert_eq!(validate(&json!(" 42 "), ArgType::Integer), Some(json!(42)));
        assert_eq!(validate(&json!("-7"), ArgType::Integer), Some(json!(-7)));
        assert_eq!(validate(&json!("3.5"), ArgType::Integer), None);
        assert_eq!(validate(&json!("abc"), ArgType::Integer), None);
        assert_eq!(validate(&json!(true), ArgType::Integer), None);
        assert_eq!(validate(&json!(null), ArgType::Integer), None);
        assert_eq!(validate(&json!(1e300), ArgType::Integer), None);
        assert_eq!(validate(&json!(u64::MAX), ArgType::Integer), None);
    }

    #[test]
    fn test_float() {
        assert_eq!(validate(&json!(2), ArgType::Float), Some(json!(2.0)));
        assert_eq!(validate(&json!(2.5), ArgType::Float), Some(json!(2.5)));
        assert_eq!(validate(&json!("1.25"), ArgType::Float), Some(json!(1.25)));
        assert_eq!(validate(&json!(true), ArgType::Float), None);
        assert_eq!(validate(&json!(false), ArgType::Float), None);
        assert_eq!(validate(&json!("x"), ArgType::Float), None);
        assert_eq!(validate(&json!("nan"), ArgType::Float), None);
        assert_eq!(validate(&json!([1.0]), ArgType::Float), None);
    }

    #[test]
    fn test_string() {
        assert_eq!(validate(&json!("hi"), ArgType::String), Some(json!("hi")));
        assert_eq!(validate(&json!(1), ArgType::String), Some(json!("1")));
        assert_eq!(validate(&json!(true), ArgType::String), Some(json!("true")));
        assert_eq!(validate(&json!(null), ArgType::String), Some(json!("null")));
        assert_eq!(validate(&json!([1, 2]), ArgType::String), Some(json!("[1,2]")));
    }

    #[test]
    fn test_boolean() {
        for truthy in [json!("true"), json!("Yes"), json!("T"), json!(1), json!(true), json!("y")] {
            assert_eq!(validate(&truthy, ArgType::Boolean), Some(json!(true)), "{}", truthy);
        }
        for falsy in [json!("FALSE"), json!("no"), json!("f"), json!(0), json!(false), json!("n")] {
            assert_eq!(validate(&falsy, ArgType::Boolean), Some(json!(false)), "{}", falsy);
        }
        assert_eq!(validate(&json!("maybe"), ArgType::Boolean), None);
        assert_eq!(validate(&json!(2), ArgType::Boolean), None);
        assert_eq!(validate(&json!(1.0), ArgType::Boolean), None);
    }

    #[test]
    fn test_list_and_dict_are_not_coerced() {
        assert_eq!(validate(&json!([1]), ArgType::List), Some(json!([1])));
        assert_eq!(validate(&json!("[1]"), ArgType::List), None);
        assert_eq!(validate(&json!({"a": 1}), ArgType::List), None);

        assert_eq!(validate(&json!({"a": 1}), ArgType::Dict), Some(json!({"a": 1})));
        assert_eq!(validate(&json!([]), ArgType::Dict), None);
        assert_eq!(validate(&json!("{}"), ArgType::Dict), None);
    }

    fn specs() -> Vec<ArgSpec> {
        vec![
            ArgSpec::required("x", ArgType::Integer, ""),
            ArgSpec::required("y", ArgType::Integer, ""),
            ArgSpec::optional("label", ArgType::String, ""),
        ]
    }

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_build_call_arguments() {
        let args = build_call_arguments(&specs(), &map(json!({"x": "3", "y": 4.7, "extra": 1})))
            .unwrap();
        assert_eq!(args.integer("x").unwrap(), 3);
        assert_eq!(args.integer("y").unwrap(), 4);
        assert!(!args.contains("label"));
        assert!(!args.contains("extra"));
    }

    #[test]
    fn test_build_call_arguments_missing() {
        let err = build_call_arguments(&specs(), &map(json!({"x": 1}))).unwrap_err();
        assert_eq!(err, ArgumentError::Missing("y".to_string()));
        assert_eq!(err.to_string(), "Parameter Missing: y");
    }

    #[test]
    fn test_build_call_arguments_invalid_fails_fast() {
        let err = build_call_arguments(&specs(), &map(json!({"x": "abc"}))).unwrap_err();
        assert_eq!(err.to_string(), "Parameter is Invalid: x abc INTEGER");
    }
}
