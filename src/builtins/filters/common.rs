/// Filters operating on multiple types of values
use std::collections::HashMap;

use serde_json::value::{to_value, Value};

use super::arg_or_kwarg;
use crate::context::{ValueRender, ValueTruthy};
use crate::errors::{Error, Result};
use crate::utils;

/// Returns the number of items in an array/object or the number of
/// characters in a string.
pub fn length(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    match value {
        Value::Array(arr) => Ok(Value::from(arr.len())),
        Value::Object(obj) => Ok(Value::from(obj.len())),
        Value::String(s) => Ok(Value::from(s.chars().count())),
        _ => Err(Error::msg(
            "Filter `length` was used on a value that isn't an array, an object, or a string.",
        )),
    }
}

/// Reverses a string or an array.
pub fn reverse(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    match value {
        Value::Array(arr) => {
            let mut rev = arr.clone();
            rev.reverse();
            to_value(rev).map_err(Error::json)
        }
        Value::String(s) => Ok(to_value(s.chars().rev().collect::<String>()).unwrap()),
        _ => Err(Error::msg(format!(
            "Filter `reverse` received an incorrect type for arg `value`: got `{}` but expected Array|String",
            value
        ))),
    }
}

/// Returns the default value given as the `value` arg when the filtered
/// value is undefined or null. Undefined values are substituted before the
/// filter even runs; this handles the explicit-null case.
pub fn default(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let default = match arg_or_kwarg(args, 0, kwargs, "value") {
        Some(d) => d,
        None => return Err(Error::msg("Filter `default` expected an arg called `value`")),
    };

    match value {
        Value::Null => Ok(default.clone()),
        _ => Ok(value.clone()),
    }
}

/// HTML-escapes the value and marks the result safe so it won't be
/// escaped a second time on output.
pub fn escape_html(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    if utils::as_safe_string(value).is_some() {
        return Ok(value.clone());
    }
    match value {
        Value::String(s) => Ok(utils::mark_safe(utils::escape_html(s))),
        Value::Number(_) | Value::Bool(_) => Ok(value.clone()),
        _ => Err(Error::msg("Filter `escape` received an incorrect type for arg `value`")),
    }
}

/// HTML-escapes even values already marked safe.
pub fn forceescape(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let s = match utils::as_safe_string(value) {
        Some(inner) => inner.to_string(),
        None => try_get_value!("forceescape", "value", String, value),
    };
    Ok(utils::mark_safe(utils::escape_html(&s)))
}

/// Marks a string as already-escaped; output will not escape it again.
pub fn safe(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    match value {
        Value::String(s) => Ok(utils::mark_safe(s.clone())),
        _ => Ok(value.clone()),
    }
}

/// Coerces to an integer: numbers are truncated, strings parsed.
pub fn int(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let default = match arg_or_kwarg(args, 0, kwargs, "default") {
        Some(d) => Some(try_get_value!("int", "default", i64, d)),
        None => None,
    };

    let result = match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i)
            } else {
                n.as_f64().map(|f| f as i64)
            }
        }
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|f| f as i64))
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    };

    match result.or(default) {
        Some(i) => Ok(Value::from(i)),
        None => Err(Error::msg(format!("Filter `int` couldn't convert `{}`", value.render()))),
    }
}

/// Coerces to a float.
pub fn float(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let default = match arg_or_kwarg(args, 0, kwargs, "default") {
        Some(d) => Some(try_get_value!("float", "default", f64, d)),
        None => None,
    };

    let result = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };

    match result.or(default) {
        Some(f) => to_value(f).map_err(Error::json),
        None => Err(Error::msg(format!("Filter `float` couldn't convert `{}`", value.render()))),
    }
}

/// Renders any value to its string form.
pub fn string(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    Ok(Value::String(value.render().into_owned()))
}

/// Coerces to a boolean using template truthiness.
pub fn bool_filter(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    Ok(Value::Bool(value.is_truthy()))
}

/// Serializes the value to JSON; `pretty=true` indents it.
pub fn json_encode(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let pretty = match arg_or_kwarg(args, 0, kwargs, "pretty") {
        Some(p) => try_get_value!("json_encode", "pretty", bool, p),
        None => false,
    };

    let serialized = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    serialized.map(Value::String).map_err(Error::json)
}

/// Formats a timestamp or an RFC 3339 string with a strftime format
/// (default `%Y-%m-%d`).
#[cfg(feature = "chrono")]
pub fn date(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

    let format = match arg_or_kwarg(args, 0, kwargs, "format") {
        Some(f) => try_get_value!("date", "format", String, f),
        None => "%Y-%m-%d".to_string(),
    };

    let formatted = match value {
        Value::Number(n) => match n.as_i64() {
            Some(timestamp) => match Utc.timestamp_opt(timestamp, 0) {
                chrono::LocalResult::Single(dt) => dt.format(&format).to_string(),
                _ => {
                    return Err(Error::msg(format!(
                        "Filter `date` received an out-of-range timestamp: {}",
                        timestamp
                    )));
                }
            },
            None => {
                return Err(Error::msg("Filter `date` received a non-integer timestamp"));
            }
        },
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                dt.format(&format).to_string()
            } else if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
                dt.format(&format).to_string()
            } else if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                d.format(&format).to_string()
            } else {
                return Err(Error::msg(format!(
                    "Filter `date` was unable to parse `{}` as a datetime",
                    s
                )));
            }
        }
        _ => {
            return Err(Error::msg(
                "Filter `date` received an incorrect type for arg `value`: expected a timestamp or a datetime string",
            ));
        }
    };

    Ok(Value::String(formatted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_length_on_everything() {
        assert_eq!(length(&json!([1, 2, 3]), &[], &HashMap::new()).unwrap(), json!(3));
        assert_eq!(length(&json!("日本語"), &[], &HashMap::new()).unwrap(), json!(3));
        assert_eq!(length(&json!({"a": 1}), &[], &HashMap::new()).unwrap(), json!(1));
        assert!(length(&json!(1), &[], &HashMap::new()).is_err());
    }

    #[test]
    fn test_default_only_replaces_null() {
        assert_eq!(default(&json!(null), &[json!("x")], &HashMap::new()).unwrap(), json!("x"));
        assert_eq!(default(&json!(""), &[json!("x")], &HashMap::new()).unwrap(), json!(""));
        assert_eq!(default(&json!(0), &[json!("x")], &HashMap::new()).unwrap(), json!(0));
    }

    #[test]
    fn test_escape_marks_safe() {
        let escaped = escape_html(&json!("<b>"), &[], &HashMap::new()).unwrap();
        assert_eq!(crate::utils::as_safe_string(&escaped), Some("&lt;b&gt;"));
        // double-applying doesn't escape twice
        let again = escape_html(&escaped, &[], &HashMap::new()).unwrap();
        assert_eq!(crate::utils::as_safe_string(&again), Some("&lt;b&gt;"));
    }

    #[test]
    fn test_forceescape_escapes_safe_values() {
        let marked = crate::utils::mark_safe("<b>");
        let forced = forceescape(&marked, &[], &HashMap::new()).unwrap();
        assert_eq!(crate::utils::as_safe_string(&forced), Some("&lt;b&gt;"));
    }

    #[test]
    fn test_int_conversions() {
        assert_eq!(int(&json!("42"), &[], &HashMap::new()).unwrap(), json!(42));
        assert_eq!(int(&json!(" 1.9 "), &[], &HashMap::new()).unwrap(), json!(1));
        assert_eq!(int(&json!(true), &[], &HashMap::new()).unwrap(), json!(1));
        assert!(int(&json!("abc"), &[], &HashMap::new()).is_err());
        assert_eq!(int(&json!("abc"), &[json!(0)], &HashMap::new()).unwrap(), json!(0));
    }

    #[test]
    fn test_bool_filter() {
        assert_eq!(bool_filter(&json!(""), &[], &HashMap::new()).unwrap(), json!(false));
        assert_eq!(bool_filter(&json!([1]), &[], &HashMap::new()).unwrap(), json!(true));
    }

    #[test]
    fn test_json_encode() {
        assert_eq!(
            json_encode(&json!({"a": [1, 2]}), &[], &HashMap::new()).unwrap(),
            json!(r#"{"a":[1,2]}"#)
        );
    }

    #[cfg(feature = "chrono")]
    #[test]
    fn test_date_from_timestamp() {
        assert_eq!(date(&json!(1648252203), &[], &HashMap::new()).unwrap(), json!("2022-03-25"));
    }

    #[cfg(feature = "chrono")]
    #[test]
    fn test_date_from_string() {
        assert_eq!(
            date(&json!("2022-03-25T18:30:03Z"), &[json!("%Y/%m/%d")], &HashMap::new()).unwrap(),
            json!("2022/03/25")
        );
    }
}
