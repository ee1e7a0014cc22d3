//! Value-level operator semantics, shared between the runtime evaluator
//! and the compile-time constant folder so folding can never change what
//! a template renders.

use serde_json::{Number, Value};

use crate::context::{ValueRender, ValueTruthy};
use crate::errors::{Error, Result};
use crate::parser::ast::{CompareOperator, MathOperator};

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn number_from_f64(value: f64) -> Result<Value> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| Error::runtime(format!("Math operation produced a non-finite float ({})", value)))
}

/// Applies a math operator. Integer operands stay integers where the
/// operator allows it; `/` always produces a float.
pub fn apply_math(operator: MathOperator, lhs: &Value, rhs: &Value) -> Result<Value> {
    let type_error = || {
        Error::runtime(format!(
            "Tried to do math (`{}`) with non-number operands: `{}` and `{}`",
            operator,
            lhs.render(),
            rhs.render()
        ))
    };

    if let (Some(l), Some(r)) = (lhs.as_i64(), rhs.as_i64()) {
        match operator {
            MathOperator::Add => {
                return l
                    .checked_add(r)
                    .map(Value::from)
                    .ok_or_else(|| Error::runtime("Integer overflow in `+`"));
            }
            MathOperator::Sub => {
                return l
                    .checked_sub(r)
                    .map(Value::from)
                    .ok_or_else(|| Error::runtime("Integer overflow in `-`"));
            }
            MathOperator::Mul => {
                return l
                    .checked_mul(r)
                    .map(Value::from)
                    .ok_or_else(|| Error::runtime("Integer overflow in `*`"));
            }
            MathOperator::FloorDiv => {
                if r == 0 {
                    return Err(Error::runtime("Tried to floor-divide by zero"));
                }
                return Ok(Value::from(l.div_euclid(r)));
            }
            MathOperator::Mod => {
                if r == 0 {
                    return Err(Error::runtime("Tried to take a modulo by zero"));
                }
                return Ok(Value::from(l % r));
            }
            MathOperator::Pow => {
                if let Ok(exp) = u32::try_from(r) {
                    return l
                        .checked_pow(exp)
                        .map(Value::from)
                        .ok_or_else(|| Error::runtime("Integer overflow in `**`"));
                }
                return number_from_f64((l as f64).powf(r as f64));
            }
            MathOperator::Div => (),
        }
    }

    let l = as_f64(lhs).ok_or_else(type_error)?;
    let r = as_f64(rhs).ok_or_else(type_error)?;

    match operator {
        MathOperator::Add => number_from_f64(l + r),
        MathOperator::Sub => number_from_f64(l - r),
        MathOperator::Mul => number_from_f64(l * r),
        MathOperator::Div => {
            if r == 0.0 {
                Err(Error::runtime("Tried to divide by zero"))
            } else {
                number_from_f64(l / r)
            }
        }
        MathOperator::FloorDiv => {
            if r == 0.0 {
                Err(Error::runtime("Tried to floor-divide by zero"))
            } else {
                number_from_f64((l / r).floor())
            }
        }
        MathOperator::Mod => {
            if r == 0.0 {
                Err(Error::runtime("Tried to take a modulo by zero"))
            } else {
                number_from_f64(l % r)
            }
        }
        MathOperator::Pow => number_from_f64(l.powf(r)),
    }
}

/// Value equality with `1 == 1.0` holding across integer/float
pub fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(l), Value::Number(r)) => match (l.as_f64(), r.as_f64()) {
            (Some(l), Some(r)) => l == r,
            _ => l == r,
        },
        _ => lhs == rhs,
    }
}

/// Applies one comparison operator.
pub fn apply_compare(operator: CompareOperator, lhs: &Value, rhs: &Value) -> Result<bool> {
    match operator {
        CompareOperator::Eq => Ok(values_equal(lhs, rhs)),
        CompareOperator::NotEq => Ok(!values_equal(lhs, rhs)),
        CompareOperator::In => value_in(lhs, rhs),
        CompareOperator::NotIn => value_in(lhs, rhs).map(|b| !b),
        _ => {
            let ordering = match (lhs, rhs) {
                (Value::Number(_), Value::Number(_)) => {
                    let l = lhs.as_f64().unwrap();
                    let r = rhs.as_f64().unwrap();
                    l.partial_cmp(&r)
                }
                (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
                _ => None,
            };
            let ordering = ordering.ok_or_else(|| {
                Error::runtime(format!(
                    "Tried to compare (`{}`) values that aren't both numbers or both strings: `{}` and `{}`",
                    operator,
                    lhs.render(),
                    rhs.render()
                ))
            })?;
            Ok(match operator {
                CompareOperator::Lt => ordering.is_lt(),
                CompareOperator::Lte => ordering.is_le(),
                CompareOperator::Gt => ordering.is_gt(),
                CompareOperator::Gte => ordering.is_ge(),
                _ => unreachable!(),
            })
        }
    }
}

/// `needle in haystack` for substrings, array membership and object keys
pub fn value_in(needle: &Value, haystack: &Value) -> Result<bool> {
    match haystack {
        Value::Array(arr) => Ok(arr.iter().any(|item| values_equal(item, needle))),
        Value::String(s) => match needle {
            Value::String(n) => Ok(s.contains(n.as_str())),
            _ => Err(Error::runtime(format!(
                "Tried to check if `{}` is in a string, but it isn't a string",
                needle.render()
            ))),
        },
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            _ => Err(Error::runtime(format!(
                "Tried to check if `{}` is a key of an object, but it isn't a string",
                needle.render()
            ))),
        },
        _ => Err(Error::runtime(format!(
            "`in` can only search strings, arrays and objects, not `{}`",
            haystack.render()
        ))),
    }
}

/// `a ~ b`: renders both sides and concatenates
pub fn concat_values(lhs: &Value, rhs: &Value) -> Result<Value> {
    let left = match lhs {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => lhs.render(),
        _ => {
            return Err(Error::runtime(format!(
                "Tried to concatenate (`~`) a value that isn't a string, number or bool: `{}`",
                lhs.render()
            )));
        }
    };
    let right = match rhs {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => rhs.render(),
        _ => {
            return Err(Error::runtime(format!(
                "Tried to concatenate (`~`) a value that isn't a string, number or bool: `{}`",
                rhs.render()
            )));
        }
    };
    Ok(Value::String(format!("{}{}", left, right)))
}

/// Materializes `start..end` as an array of integers
pub fn expand_range(start: &Value, end: &Value) -> Result<Value> {
    let (start, end) = match (start.as_i64(), end.as_i64()) {
        (Some(s), Some(e)) => (s, e),
        _ => {
            return Err(Error::runtime(format!(
                "Range bounds must be integers, got `{}` and `{}`",
                start.render(),
                end.render()
            )));
        }
    };
    if end < start {
        return Err(Error::runtime(format!(
            "Range end ({}) must not be smaller than its start ({})",
            end, start
        )));
    }
    Ok(Value::Array((start..end).map(Value::from).collect()))
}

/// `value[lower:upper:step]` over arrays and strings
pub fn apply_slice(
    value: &Value,
    lower: Option<&Value>,
    upper: Option<&Value>,
    step: Option<&Value>,
) -> Result<Value> {
    fn clamp_index(idx: Option<&Value>, len: usize, default: usize) -> Result<usize> {
        match idx {
            None => Ok(default),
            Some(v) => {
                let i = v.as_i64().ok_or_else(|| {
                    Error::runtime(format!("Slice indexes must be integers, got `{}`", v.render()))
                })?;
                let i = if i < 0 { (len as i64 + i).max(0) } else { i.min(len as i64) };
                Ok(i as usize)
            }
        }
    }

    let step = match step {
        None => 1,
        Some(v) => v.as_i64().ok_or_else(|| {
            Error::runtime(format!("Slice step must be an integer, got `{}`", v.render()))
        })?,
    };
    if step <= 0 {
        return Err(Error::runtime("Slice steps must be positive"));
    }
    let step = step as usize;

    match value {
        Value::Array(arr) => {
            let lo = clamp_index(lower, arr.len(), 0)?;
            let hi = clamp_index(upper, arr.len(), arr.len())?;
            let items = if lo < hi {
                arr[lo..hi].iter().step_by(step).cloned().collect()
            } else {
                Vec::new()
            };
            Ok(Value::Array(items))
        }
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let lo = clamp_index(lower, chars.len(), 0)?;
            let hi = clamp_index(upper, chars.len(), chars.len())?;
            let out: String = if lo < hi {
                chars[lo..hi].iter().step_by(step).collect()
            } else {
                String::new()
            };
            Ok(Value::String(out))
        }
        _ => Err(Error::runtime(format!(
            "Only arrays and strings can be sliced, not `{}`",
            value.render()
        ))),
    }
}

/// Whether a value is "nullish" for `??` and `?.`: null counts, empty
/// strings and zeroes do not.
pub fn is_nullish(value: &Value) -> bool {
    value.is_null()
}

/// Escaping can be skipped entirely for scalars that cannot contain HTML
/// special characters. This is an exact value-type check.
#[inline]
pub fn escape_exempt(value: &Value) -> bool {
    matches!(value, Value::Number(_) | Value::Bool(_))
}

/// Truthiness, re-exported where the processor needs a free function
#[inline]
pub fn is_truthy(value: &Value) -> bool {
    value.is_truthy()
}
