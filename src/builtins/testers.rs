//! The builtin tests, used with the `is` keyword.

use std::collections::HashMap;
use std::sync::Mutex;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::value::Value;

use crate::errors::{Error, Result};

/// The test protocol: `value` is `None` when the tested expression
/// resolved to nothing, so a test can tell "missing" from "null".
pub trait Test: Sync + Send {
    fn test(&self, value: Option<&Value>, args: &[Value]) -> Result<bool>;
}

impl<F> Test for F
where
    F: Fn(Option<&Value>, &[Value]) -> Result<bool> + Sync + Send,
{
    fn test(&self, value: Option<&Value>, args: &[Value]) -> Result<bool> {
        self(value, args)
    }
}

/// Rejects calls with more arguments than the test accepts.
pub fn check_arg_count(test_name: &str, args: &[Value], max: usize) -> Result<()> {
    if args.len() <= max {
        return Ok(());
    }
    if max == 0 {
        Err(Error::msg(format!("Test `{}` takes no arguments", test_name)))
    } else {
        Err(Error::msg(format!(
            "Test `{}` takes at most {} argument(s), {} were given",
            test_name,
            max,
            args.len()
        )))
    }
}

/// Unwraps the tested value, erroring for tests that have nothing to say
/// about undefined input.
pub fn require_value<'v>(test_name: &str, value: Option<&'v Value>) -> Result<&'v Value> {
    value.ok_or_else(|| {
        Error::msg(format!("Test `{}` needs a defined value to check", test_name))
    })
}

fn string_operand<'v>(test_name: &str, side: &str, value: &'v Value) -> Result<&'v str> {
    value.as_str().ok_or_else(|| {
        Error::msg(format!("Test `{}` needs a string as its {}", test_name, side))
    })
}

/// `x is defined`: the name resolved to something, null included.
pub fn defined(value: Option<&Value>, args: &[Value]) -> Result<bool> {
    check_arg_count("defined", args, 0)?;
    Ok(value.is_some())
}

/// `x is undefined`: the opposite of `defined`.
pub fn undefined(value: Option<&Value>, args: &[Value]) -> Result<bool> {
    check_arg_count("undefined", args, 0)?;
    Ok(value.is_none())
}

/// `x is none`: explicitly null. An undefined value is not none.
pub fn none(value: Option<&Value>, args: &[Value]) -> Result<bool> {
    check_arg_count("none", args, 0)?;
    Ok(value.is_some_and(Value::is_null))
}

/// `x is string`
pub fn string(value: Option<&Value>, args: &[Value]) -> Result<bool> {
    check_arg_count("string", args, 0)?;
    Ok(require_value("string", value)?.is_string())
}

/// `x is number`
pub fn number(value: Option<&Value>, args: &[Value]) -> Result<bool> {
    check_arg_count("number", args, 0)?;
    Ok(require_value("number", value)?.is_number())
}

fn integer_operand(test_name: &str, value: Option<&Value>) -> Result<i64> {
    require_value(test_name, value)?.as_i64().ok_or_else(|| {
        Error::msg(format!("Test `{}` only works on integers", test_name))
    })
}

/// `x is odd`
pub fn odd(value: Option<&Value>, args: &[Value]) -> Result<bool> {
    check_arg_count("odd", args, 0)?;
    Ok(integer_operand("odd", value)?.rem_euclid(2) == 1)
}

/// `x is even`
pub fn even(value: Option<&Value>, args: &[Value]) -> Result<bool> {
    check_arg_count("even", args, 0)?;
    Ok(integer_operand("even", value)?.rem_euclid(2) == 0)
}

/// `x is divisibleby(n)`
pub fn divisible_by(value: Option<&Value>, args: &[Value]) -> Result<bool> {
    check_arg_count("divisibleby", args, 1)?;
    let dividend = integer_operand("divisibleby", value)?;
    let divisor = args
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::msg("Test `divisibleby` needs an integer argument"))?;
    if divisor == 0 {
        return Err(Error::msg("Test `divisibleby` cannot divide by zero"));
    }
    Ok(dividend % divisor == 0)
}

/// `x is iterable`: anything a `{% for %}` accepts.
pub fn iterable(value: Option<&Value>, args: &[Value]) -> Result<bool> {
    check_arg_count("iterable", args, 0)?;
    let value = require_value("iterable", value)?;
    Ok(value.is_array() || value.is_object())
}

/// `x is mapping`: key-value iteration specifically.
pub fn mapping(value: Option<&Value>, args: &[Value]) -> Result<bool> {
    check_arg_count("mapping", args, 0)?;
    Ok(require_value("mapping", value)?.is_object())
}

/// `x is starting_with("pre")`
pub fn starting_with(value: Option<&Value>, args: &[Value]) -> Result<bool> {
    check_arg_count("starting_with", args, 1)?;
    let haystack = string_operand("starting_with", "value", require_value("starting_with", value)?)?;
    let prefix = string_operand("starting_with", "argument", args.first().unwrap_or(&Value::Null))?;
    Ok(haystack.starts_with(prefix))
}

/// `x is ending_with("post")`
pub fn ending_with(value: Option<&Value>, args: &[Value]) -> Result<bool> {
    check_arg_count("ending_with", args, 1)?;
    let haystack = string_operand("ending_with", "value", require_value("ending_with", value)?)?;
    let suffix = string_operand("ending_with", "argument", args.first().unwrap_or(&Value::Null))?;
    Ok(haystack.ends_with(suffix))
}

/// `x is containing(needle)`: substring for strings, element for arrays,
/// key for objects.
pub fn containing(value: Option<&Value>, args: &[Value]) -> Result<bool> {
    check_arg_count("containing", args, 1)?;
    let needle = args
        .first()
        .ok_or_else(|| Error::msg("Test `containing` needs an argument to look for"))?;

    match require_value("containing", value)? {
        Value::String(haystack) => {
            Ok(haystack.contains(string_operand("containing", "argument", needle)?))
        }
        Value::Array(items) => Ok(items.contains(needle)),
        Value::Object(map) => {
            Ok(map.contains_key(string_operand("containing", "argument", needle)?))
        }
        _ => Err(Error::msg(
            "Test `containing` only works on strings, arrays and objects",
        )),
    }
}

lazy_static! {
    // one compilation per distinct pattern for the life of the process
    static ref PATTERN_CACHE: Mutex<HashMap<String, Regex>> = Mutex::new(HashMap::new());
}

/// `x is matching("^re$")`: regex match against the whole value.
pub fn matching(value: Option<&Value>, args: &[Value]) -> Result<bool> {
    check_arg_count("matching", args, 1)?;
    let haystack = string_operand("matching", "value", require_value("matching", value)?)?;
    let pattern = string_operand("matching", "argument", args.first().unwrap_or(&Value::Null))?;

    let mut cache = PATTERN_CACHE.lock().expect("pattern cache lock");
    if !cache.contains_key(pattern) {
        let compiled = Regex::new(pattern).map_err(|e| {
            Error::chain(format!("Test `matching` got an invalid regex `{}`", pattern), e)
        })?;
        cache.insert(pattern.to_string(), compiled);
    }
    Ok(cache[pattern].is_match(haystack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_arg_count_enforced() {
        assert!(defined(Some(&json!(1)), &[json!("extra")]).is_err());
        assert!(divisible_by(Some(&json!(4)), &[json!(2), json!(3)]).is_err());
        assert!(divisible_by(Some(&json!(4)), &[json!(2)]).is_ok());
    }

    #[test]
    fn test_undefined_values_are_rejected_where_meaningless() {
        assert!(string(None, &[]).is_err());
        assert!(odd(None, &[]).is_err());
        assert!(iterable(None, &[]).is_err());
    }

    #[test]
    fn test_defined_and_undefined() {
        assert!(defined(Some(&json!("anything")), &[]).unwrap());
        assert!(defined(Some(&json!(null)), &[]).unwrap());
        assert!(!defined(None, &[]).unwrap());
        assert!(undefined(None, &[]).unwrap());
        assert!(!undefined(Some(&json!(0)), &[]).unwrap());
    }

    #[test]
    fn test_none_distinguishes_null_from_missing() {
        assert!(none(Some(&json!(null)), &[]).unwrap());
        assert!(!none(Some(&json!(false)), &[]).unwrap());
        assert!(!none(None, &[]).unwrap());
    }

    #[test]
    fn test_type_checks() {
        assert!(string(Some(&json!("s")), &[]).unwrap());
        assert!(!string(Some(&json!(9)), &[]).unwrap());
        assert!(number(Some(&json!(2.5)), &[]).unwrap());
        assert!(mapping(Some(&json!({})), &[]).unwrap());
        assert!(!mapping(Some(&json!([])), &[]).unwrap());
        assert!(iterable(Some(&json!([])), &[]).unwrap());
        assert!(!iterable(Some(&json!("text")), &[]).unwrap());
    }

    #[test]
    fn test_parity_handles_negatives() {
        assert!(odd(Some(&json!(-3)), &[]).unwrap());
        assert!(even(Some(&json!(-4)), &[]).unwrap());
        assert!(!odd(Some(&json!(0)), &[]).unwrap());
        assert!(odd(Some(&json!(2.5)), &[]).is_err());
    }

    #[test]
    fn test_divisible_by() {
        assert!(divisible_by(Some(&json!(12)), &[json!(4)]).unwrap());
        assert!(!divisible_by(Some(&json!(13)), &[json!(4)]).unwrap());
        assert!(divisible_by(Some(&json!(13)), &[json!(0)]).is_err());
        assert!(divisible_by(Some(&json!(13)), &[json!("four")]).is_err());
    }

    #[test]
    fn test_affix_checks() {
        assert!(starting_with(Some(&json!("index.html")), &[json!("index")]).unwrap());
        assert!(!starting_with(Some(&json!("index.html")), &[json!(".html")]).unwrap());
        assert!(ending_with(Some(&json!("index.html")), &[json!(".html")]).unwrap());
        assert!(starting_with(Some(&json!(5)), &[json!("5")]).is_err());
    }

    #[test]
    fn test_containing_across_types() {
        assert!(containing(Some(&json!("fragment")), &[json!("agme")]).unwrap());
        assert!(containing(Some(&json!(["x", "y"])), &[json!("y")]).unwrap());
        assert!(containing(Some(&json!({"key": 0})), &[json!("key")]).unwrap());
        assert!(!containing(Some(&json!([1])), &[json!(2)]).unwrap());
        assert!(containing(Some(&json!(true)), &[json!("t")]).is_err());
    }

    #[test]
    fn test_matching() {
        assert!(matching(Some(&json!("v1.17.1")), &[json!(r"^v\d+\.\d+\.\d+$")]).unwrap());
        assert!(!matching(Some(&json!("draft")), &[json!("^final$")]).unwrap());
        assert!(matching(Some(&json!("x")), &[json!("[broken")]).is_err());
        // the cache serves repeats of the same pattern
        assert!(matching(Some(&json!("v2.0.0")), &[json!(r"^v\d+\.\d+\.\d+$")]).unwrap());
    }
}
