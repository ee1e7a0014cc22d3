/// Filters operating on objects
use std::collections::HashMap;

use serde_json::value::{Map, Value};

use super::arg_or_kwarg;
use crate::errors::{Error, Result};

/// Returns a value by its `key`, with an optional `default`.
pub fn get(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let obj = try_get_value!("get", "value", Map<String, Value>, value);
    let key = match arg_or_kwarg(args, 0, kwargs, "key") {
        Some(k) => try_get_value!("get", "key", String, k),
        None => return Err(Error::msg("Filter `get` expected an arg called `key`")),
    };

    match obj.get(&key) {
        Some(val) => Ok(val.clone()),
        None => match arg_or_kwarg(args, 1, kwargs, "default") {
            Some(default) => Ok(default.clone()),
            None => Err(Error::msg(format!("Filter `get` tried to get key `{}` but it wasn't found", key))),
        },
    }
}

/// Returns the keys of an object as an array.
pub fn keys(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let obj = try_get_value!("keys", "value", Map<String, Value>, value);
    Ok(Value::Array(obj.keys().map(|k| Value::String(k.clone())).collect()))
}

/// Returns the values of an object as an array.
pub fn values(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let obj = try_get_value!("values", "value", Map<String, Value>, value);
    Ok(Value::Array(obj.values().cloned().collect()))
}

/// Returns `[key, value]` pairs of an object as an array.
pub fn items(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let obj = try_get_value!("items", "value", Map<String, Value>, value);
    Ok(Value::Array(
        obj.into_iter()
            .map(|(k, v)| Value::Array(vec![Value::String(k), v]))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get() {
        let obj = json!({"a": 1});
        assert_eq!(get(&obj, &[json!("a")], &HashMap::new()).unwrap(), json!(1));
        assert_eq!(get(&obj, &[json!("b"), json!(0)], &HashMap::new()).unwrap(), json!(0));
        assert!(get(&obj, &[json!("b")], &HashMap::new()).is_err());
    }

    #[test]
    fn test_keys_values_items() {
        let obj = json!({"a": 1, "b": 2});
        assert_eq!(keys(&obj, &[], &HashMap::new()).unwrap(), json!(["a", "b"]));
        assert_eq!(values(&obj, &[], &HashMap::new()).unwrap(), json!([1, 2]));
        assert_eq!(items(&obj, &[], &HashMap::new()).unwrap(), json!([["a", 1], ["b", 2]]));
    }
}
