/// Filters operating on numbers
use std::collections::HashMap;

use serde_json::value::{to_value, Value};

use super::arg_or_kwarg;
use crate::errors::{Error, Result};

/// Returns a plural suffix if the value is not equal to ±1, or a singular
/// suffix otherwise. The plural suffix defaults to `s` and the singular to
/// the empty string.
pub fn pluralize(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let num = try_get_value!("pluralize", "value", f64, value);

    let plural = match arg_or_kwarg(args, 0, kwargs, "plural") {
        Some(val) => try_get_value!("pluralize", "plural", String, val),
        None => "s".to_string(),
    };

    let singular = match arg_or_kwarg(args, 1, kwargs, "singular") {
        Some(val) => try_get_value!("pluralize", "singular", String, val),
        None => String::new(),
    };

    // English uses plural when it isn't one
    if (num.abs() - 1.).abs() > f64::EPSILON {
        Ok(to_value(plural).unwrap())
    } else {
        Ok(to_value(singular).unwrap())
    }
}

/// Returns a rounded number using the `method` arg (`common`, `ceil` or
/// `floor`) and `precision` decimal places.
pub fn round(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let num = try_get_value!("round", "value", f64, value);
    let method = match arg_or_kwarg(args, 0, kwargs, "method") {
        Some(val) => try_get_value!("round", "method", String, val),
        None => "common".to_string(),
    };
    let precision = match arg_or_kwarg(args, 1, kwargs, "precision") {
        Some(val) => try_get_value!("round", "precision", i32, val),
        None => 0,
    };
    let multiplier = if precision == 0 { 1. } else { 10_f64.powi(precision) };

    match method.as_ref() {
        "common" => to_value((multiplier * num).round() / multiplier).map_err(Error::json),
        "ceil" => to_value((multiplier * num).ceil() / multiplier).map_err(Error::json),
        "floor" => to_value((multiplier * num).floor() / multiplier).map_err(Error::json),
        _ => Err(Error::msg(format!(
            "Filter `round` received an incorrect value for arg `method`: got `{}`, only common, ceil and floor are allowed",
            method
        ))),
    }
}

/// Returns the absolute value of the number.
pub fn abs(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.checked_abs()
                    .map(Value::from)
                    .ok_or_else(|| Error::msg("Filter `abs` overflowed on i64::MIN"))
            } else {
                to_value(n.as_f64().unwrap().abs()).map_err(Error::json)
            }
        }
        _ => Err(Error::msg("Filter `abs` was used on a value that isn't a number")),
    }
}

/// Returns a human-readable file size (i.e. 110 MB) from an integer.
#[cfg(feature = "humansize")]
pub fn filesizeformat(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    use humansize::{file_size_opts, FileSize};

    let num = try_get_value!("filesizeformat", "value", usize, value);
    num.file_size(file_size_opts::CONVENTIONAL)
        .map_err(|error| {
            Error::msg(format!(
                "Filter `filesizeformat` was called on a negative number: {}",
                error
            ))
        })
        .map(to_value)
        .map(std::result::Result::unwrap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pluralize_single() {
        let result = pluralize(&json!(1), &[], &HashMap::new());
        assert_eq!(result.unwrap(), json!(""));
    }

    #[test]
    fn test_pluralize_multiple() {
        let result = pluralize(&json!(2), &[], &HashMap::new());
        assert_eq!(result.unwrap(), json!("s"));
    }

    #[test]
    fn test_pluralize_zero() {
        let result = pluralize(&json!(0), &[], &HashMap::new());
        assert_eq!(result.unwrap(), json!("s"));
    }

    #[test]
    fn test_pluralize_custom_suffixes() {
        let result = pluralize(&json!(1), &[json!("es"), json!("y")], &HashMap::new());
        assert_eq!(result.unwrap(), json!("y"));
    }

    #[test]
    fn test_round_default() {
        let result = round(&json!(2.1), &[], &HashMap::new());
        assert_eq!(result.unwrap(), json!(2.0));
    }

    #[test]
    fn test_round_ceil_precision() {
        let kwargs: HashMap<String, Value> =
            [("method".to_string(), json!("ceil")), ("precision".to_string(), json!(1))]
                .into_iter()
                .collect();
        let result = round(&json!(2.11), &[], &kwargs);
        assert_eq!(result.unwrap(), json!(2.2));
    }

    #[test]
    fn test_abs() {
        assert_eq!(abs(&json!(-3), &[], &HashMap::new()).unwrap(), json!(3));
        assert_eq!(abs(&json!(-1.5), &[], &HashMap::new()).unwrap(), json!(1.5));
        assert_eq!(abs(&json!(4), &[], &HashMap::new()).unwrap(), json!(4));
    }

    #[cfg(feature = "humansize")]
    #[test]
    fn test_filesizeformat() {
        let result = filesizeformat(&json!(123456789), &[], &HashMap::new());
        assert_eq!(result.unwrap(), json!("117.74 MB"));
    }
}
