/// Filters operating on array
use std::collections::HashMap;

use serde_json::value::{to_value, Value};

use super::arg_or_kwarg;
use crate::errors::{Error, Result};
use crate::renderer::ops::values_equal;

/// Returns the first element of an array, or null when it is empty.
pub fn first(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let arr = try_get_value!("first", "value", Vec<Value>, value);
    Ok(arr.into_iter().next().unwrap_or(Value::Null))
}

/// Returns the last element of an array, or null when it is empty.
pub fn last(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let arr = try_get_value!("last", "value", Vec<Value>, value);
    Ok(arr.into_iter().next_back().unwrap_or(Value::Null))
}

/// Joins the rendered elements with `sep` (default empty).
pub fn join(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let arr = try_get_value!("join", "value", Vec<Value>, value);
    let sep = match arg_or_kwarg(args, 0, kwargs, "sep") {
        Some(s) => try_get_value!("join", "sep", String, s),
        None => String::new(),
    };

    let rendered: Vec<String> = arr
        .iter()
        .map(|v| crate::context::ValueRender::render(v).into_owned())
        .collect();
    Ok(Value::String(rendered.join(&sep)))
}

/// Sorts an array of numbers or strings ascending; `reverse=true` flips it.
pub fn sort(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let mut arr = try_get_value!("sort", "value", Vec<Value>, value);
    if arr.is_empty() {
        return Ok(Value::Array(arr));
    }
    let reverse = match arg_or_kwarg(args, 0, kwargs, "reverse") {
        Some(r) => try_get_value!("sort", "reverse", bool, r),
        None => false,
    };

    let all_numbers = arr.iter().all(Value::is_number);
    let all_strings = arr.iter().all(Value::is_string);
    if !all_numbers && !all_strings {
        return Err(Error::msg(
            "Filter `sort` can only sort arrays whose elements are all numbers or all strings",
        ));
    }

    if all_numbers {
        arr.sort_by(|a, b| {
            a.as_f64().unwrap().partial_cmp(&b.as_f64().unwrap()).expect("numbers are comparable")
        });
    } else {
        arr.sort_by(|a, b| a.as_str().unwrap().cmp(b.as_str().unwrap()));
    }
    if reverse {
        arr.reverse();
    }

    Ok(Value::Array(arr))
}

/// Returns the `[start, end)` window of an array. Either bound may be
/// negative to count from the back; out-of-range bounds clamp instead of
/// erroring, so an oversized window just returns what exists.
pub fn slice(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let arr = try_get_value!("slice", "value", Vec<Value>, value);

    fn clamp(bound: i64, len: usize) -> usize {
        if bound < 0 {
            (len as i64 + bound).max(0) as usize
        } else {
            (bound as usize).min(len)
        }
    }

    let start = match arg_or_kwarg(args, 0, kwargs, "start") {
        Some(v) => try_get_value!("slice", "start", i64, v),
        None => 0,
    };
    let end = match arg_or_kwarg(args, 1, kwargs, "end") {
        Some(v) => try_get_value!("slice", "end", i64, v),
        None => arr.len() as i64,
    };

    let start = clamp(start, arr.len());
    let end = clamp(end, arr.len());
    if start >= end {
        return Ok(Value::Array(Vec::new()));
    }
    Ok(Value::Array(arr[start..end].to_vec()))
}

/// Removes duplicate elements, keeping first occurrences.
pub fn unique(value: &Value, _: &[Value], _: &HashMap<String, Value>) -> Result<Value> {
    let arr = try_get_value!("unique", "value", Vec<Value>, value);
    let mut seen: Vec<Value> = Vec::with_capacity(arr.len());
    for item in arr {
        if !seen.iter().any(|s| values_equal(s, &item)) {
            seen.push(item);
        }
    }
    Ok(Value::Array(seen))
}

/// Appends another array (or a single value) to this one.
pub fn concat(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let mut arr = try_get_value!("concat", "value", Vec<Value>, value);
    let with = match arg_or_kwarg(args, 0, kwargs, "with") {
        Some(w) => w,
        None => return Err(Error::msg("Filter `concat` expected an arg called `with`")),
    };

    match with {
        Value::Array(other) => arr.extend(other.iter().cloned()),
        single => arr.push(single.clone()),
    }

    to_value(arr).map_err(Error::json)
}

/// Extracts `attribute` from every element.
pub fn map(value: &Value, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value> {
    let arr = try_get_value!("map", "value", Vec<Value>, value);
    let attribute = match arg_or_kwarg(args, 0, kwargs, "attribute") {
        Some(a) => try_get_value!("map", "attribute", String, a),
        None => return Err(Error::msg("Filter `map` expected an arg called `attribute`")),
    };

    let mapped: Vec<Value> = arr
        .iter()
        .map(|item| {
            crate::context::dotted_pointer(item, &attribute).cloned().unwrap_or(Value::Null)
        })
        .collect();
    Ok(Value::Array(mapped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_and_last() {
        assert_eq!(first(&json!([1, 2, 3]), &[], &HashMap::new()).unwrap(), json!(1));
        assert_eq!(last(&json!([1, 2, 3]), &[], &HashMap::new()).unwrap(), json!(3));
        assert_eq!(first(&json!([]), &[], &HashMap::new()).unwrap(), json!(null));
    }

    #[test]
    fn test_join() {
        assert_eq!(
            join(&json!(["a", "b", 1]), &[json!(", ")], &HashMap::new()).unwrap(),
            json!("a, b, 1")
        );
        assert_eq!(join(&json!([]), &[json!(", ")], &HashMap::new()).unwrap(), json!(""));
    }

    #[test]
    fn test_sort() {
        assert_eq!(
            sort(&json!([3, 1.5, 2]), &[], &HashMap::new()).unwrap(),
            json!([1.5, 2, 3])
        );
        assert_eq!(
            sort(&json!(["b", "a"]), &[json!(true)], &HashMap::new()).unwrap(),
            json!(["b", "a"])
        );
        assert!(sort(&json!([1, "a"]), &[], &HashMap::new()).is_err());
    }

    #[test]
    fn test_slice() {
        let arr = json!([0, 1, 2, 3, 4]);
        let kwargs: HashMap<String, Value> =
            [("end".to_string(), json!(2))].into_iter().collect();
        assert_eq!(slice(&arr, &[], &kwargs).unwrap(), json!([0, 1]));
        assert_eq!(slice(&arr, &[json!(1), json!(3)], &HashMap::new()).unwrap(), json!([1, 2]));
        assert_eq!(slice(&arr, &[json!(-2)], &HashMap::new()).unwrap(), json!([3, 4]));
        assert_eq!(slice(&arr, &[json!(0), json!(-1)], &HashMap::new()).unwrap(), json!([0, 1, 2, 3]));
        // clamped, not an error
        assert_eq!(slice(&arr, &[json!(3), json!(99)], &HashMap::new()).unwrap(), json!([3, 4]));
        assert_eq!(slice(&arr, &[json!(4), json!(1)], &HashMap::new()).unwrap(), json!([]));
    }

    #[test]
    fn test_unique() {
        assert_eq!(
            unique(&json!([1, 2, 1, 3, 2]), &[], &HashMap::new()).unwrap(),
            json!([1, 2, 3])
        );
    }

    #[test]
    fn test_concat() {
        assert_eq!(
            concat(&json!([1, 2]), &[json!([3, 4])], &HashMap::new()).unwrap(),
            json!([1, 2, 3, 4])
        );
        assert_eq!(concat(&json!([1]), &[json!(2)], &HashMap::new()).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_map() {
        let input = json!([{"name": "a"}, {"name": "b"}, {}]);
        assert_eq!(
            map(&input, &[json!("name")], &HashMap::new()).unwrap(),
            json!(["a", "b", null])
        );
    }
}
