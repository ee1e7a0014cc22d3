//! The builtin global functions and the function protocols.

use std::collections::HashMap;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::value::{from_value, Value};

use crate::errors::{Error, Result};

/// The function protocol: global functions take keyword arguments only
/// and produce a value.
pub trait Function: Sync + Send {
    fn call(&self, args: &HashMap<String, Value>) -> Result<Value>;

    /// When `true`, string results skip autoescaping.
    fn is_safe(&self) -> bool {
        false
    }
}

impl<F> Function for F
where
    F: Fn(&HashMap<String, Value>) -> Result<Value> + Sync + Send,
{
    fn call(&self, args: &HashMap<String, Value>) -> Result<Value> {
        self(args)
    }
}

/// The async function protocol, for sources resolved by `await fn(...)`
/// and `{% async for %}` in async renders.
pub trait AsyncFunction: Sync + Send {
    fn call<'a>(&'a self, args: &'a HashMap<String, Value>) -> BoxFuture<'a, Result<Value>>;
}

impl<F> AsyncFunction for F
where
    F: for<'a> Fn(&'a HashMap<String, Value>) -> BoxFuture<'a, Result<Value>> + Sync + Send,
{
    fn call<'a>(&'a self, args: &'a HashMap<String, Value>) -> BoxFuture<'a, Result<Value>> {
        self(args)
    }
}

/// Pulls a typed optional argument out of the kwargs map.
fn optional_arg<T: DeserializeOwned>(
    fn_name: &str,
    args: &HashMap<String, Value>,
    key: &str,
) -> Result<Option<T>> {
    match args.get(key) {
        None => Ok(None),
        Some(raw) => from_value(raw.clone()).map(Some).map_err(|_| {
            Error::msg(format!(
                "Function `{}` got a `{}` argument of the wrong type: `{}`",
                fn_name, key, raw
            ))
        }),
    }
}

/// Like [`optional_arg`] but the argument must be there.
fn required_arg<T: DeserializeOwned>(
    fn_name: &str,
    args: &HashMap<String, Value>,
    key: &str,
) -> Result<T> {
    optional_arg(fn_name, args, key)?
        .ok_or_else(|| Error::msg(format!("Function `{}` requires a `{}` argument", fn_name, key)))
}

/// `range(end=, start=0, step_by=1)`: the half-open integer interval
/// `[start, end)` as an array.
pub fn range(args: &HashMap<String, Value>) -> Result<Value> {
    let start: i64 = optional_arg("range", args, "start")?.unwrap_or(0);
    let end: i64 = required_arg("range", args, "end")?;
    let step_by: i64 = optional_arg("range", args, "step_by")?.unwrap_or(1);

    if step_by < 1 {
        return Err(Error::msg("Function `range` needs `step_by` to be at least 1"));
    }
    if end < start {
        return Err(Error::msg(format!(
            "Function `range` needs `start` ({}) to not exceed `end` ({})",
            start, end
        )));
    }

    let values: Vec<Value> =
        (start..end).step_by(step_by as usize).map(Value::from).collect();
    Ok(Value::Array(values))
}

/// `now(timestamp=false, utc=false)`: the current datetime as an RFC 3339
/// string, or epoch seconds with `timestamp=true`.
#[cfg(feature = "chrono")]
pub fn now(args: &HashMap<String, Value>) -> Result<Value> {
    use chrono::{Local, Utc};

    let as_timestamp: bool = optional_arg("now", args, "timestamp")?.unwrap_or(false);
    let use_utc: bool = optional_arg("now", args, "utc")?.unwrap_or(false);

    let (epoch, formatted) = if use_utc {
        let t = Utc::now();
        (t.timestamp(), t.to_rfc3339())
    } else {
        let t = Local::now();
        (t.timestamp(), t.to_rfc3339())
    };

    if as_timestamp {
        Ok(Value::from(epoch))
    } else {
        Ok(Value::String(formatted))
    }
}

/// `throw(message=)`: fails the render with the given message, for
/// asserting template invariants from data.
pub fn throw(args: &HashMap<String, Value>) -> Result<Value> {
    let message: String = required_arg("throw", args, "message")?;
    Err(Error::msg(message))
}

/// `get_random(end=, start=0)`: a random integer in `[start, end)`.
#[cfg(feature = "rand")]
pub fn get_random(args: &HashMap<String, Value>) -> Result<Value> {
    use rand::Rng;

    let start: i64 = optional_arg("get_random", args, "start")?.unwrap_or(0);
    let end: i64 = required_arg("get_random", args, "end")?;
    if end <= start {
        return Err(Error::msg("Function `get_random` needs `start` to be below `end`"));
    }

    Ok(Value::from(rand::thread_rng().gen_range(start..end)))
}

/// `cycle(items=, index=)`: picks from `items` by `index`, wrapping
/// around at the end.
pub fn cycle(args: &HashMap<String, Value>) -> Result<Value> {
    let items: Vec<Value> = required_arg("cycle", args, "items")?;
    if items.is_empty() {
        return Err(Error::msg("Function `cycle` needs a non-empty `items` array"));
    }
    let index: usize = required_arg("cycle", args, "index")?;

    Ok(items[index % items.len()].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(pairs: Vec<(&str, Value)>) -> HashMap<String, Value> {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_range_end_only() {
        let result = range(&args(vec![("end", json!(4))])).unwrap();
        assert_eq!(result, json!([0, 1, 2, 3]));
    }

    #[test]
    fn test_range_with_start_and_step() {
        let result = range(&args(vec![
            ("start", json!(10)),
            ("end", json!(16)),
            ("step_by", json!(3)),
        ]))
        .unwrap();
        assert_eq!(result, json!([10, 13]));
    }

    #[test]
    fn test_range_empty_interval() {
        let result = range(&args(vec![("start", json!(5)), ("end", json!(5))])).unwrap();
        assert_eq!(result, json!([]));
    }

    #[test]
    fn test_range_argument_errors() {
        assert!(range(&HashMap::new()).is_err());
        assert!(range(&args(vec![("end", json!("ten"))])).is_err());
        assert!(range(&args(vec![("end", json!(3)), ("step_by", json!(0))])).is_err());
        assert!(range(&args(vec![("start", json!(9)), ("end", json!(3))])).is_err());
    }

    #[test]
    fn test_throw_uses_the_message() {
        let err = throw(&args(vec![("message", json!("bad data"))])).unwrap_err();
        assert_eq!(err.to_string(), "bad data");
        assert!(throw(&HashMap::new()).is_err());
    }

    #[test]
    fn test_cycle_wraps() {
        let call = args(vec![("items", json!(["a", "b", "c"])), ("index", json!(7))]);
        assert_eq!(cycle(&call).unwrap(), json!("b"));
        assert!(cycle(&args(vec![("items", json!([])), ("index", json!(0))])).is_err());
        assert!(cycle(&args(vec![("items", json!(["a"]))])).is_err());
    }

    #[cfg(feature = "chrono")]
    #[test]
    fn test_now_shapes() {
        let stamped = now(&args(vec![("timestamp", json!(true))])).unwrap();
        assert!(stamped.is_i64());
        let formatted = now(&HashMap::new()).unwrap();
        assert!(formatted.as_str().is_some_and(|s| s.contains('T')));
    }

    #[cfg(feature = "rand")]
    #[test]
    fn test_get_random_bounds() {
        let call = args(vec![("start", json!(-2)), ("end", json!(2))]);
        for _ in 0..32 {
            let v = get_random(&call).unwrap().as_i64().unwrap();
            assert!((-2..2).contains(&v));
        }
        assert!(get_random(&args(vec![("end", json!(0))])).is_err());
    }
}
