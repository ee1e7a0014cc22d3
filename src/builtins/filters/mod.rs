//! The builtin filters and the filter protocol.

use std::collections::{HashMap, HashSet};

use lazy_static::lazy_static;
use serde_json::Value;

use crate::errors::Result;

pub mod array;
pub mod common;
pub mod number;
pub mod object;
pub mod string;

/// The filter function type definition
pub trait Filter: Sync + Send {
    /// The filter function type definition
    fn filter(
        &self,
        value: &Value,
        args: &[Value],
        kwargs: &HashMap<String, Value>,
    ) -> Result<Value>;
}

impl<F> Filter for F
where
    F: Fn(&Value, &[Value], &HashMap<String, Value>) -> Result<Value> + Sync + Send,
{
    fn filter(
        &self,
        value: &Value,
        args: &[Value],
        kwargs: &HashMap<String, Value>,
    ) -> Result<Value> {
        self(value, args, kwargs)
    }
}

/// Reads an argument given either positionally or by name.
pub(crate) fn arg_or_kwarg<'a>(
    args: &'a [Value],
    index: usize,
    kwargs: &'a HashMap<String, Value>,
    name: &str,
) -> Option<&'a Value> {
    args.get(index).or_else(|| kwargs.get(name))
}

lazy_static! {
    /// Filters known to be deterministic and side-effect-free. These are
    /// eligible for compile-time evaluation and output coalescing; the
    /// environment can extend the set, never shrink it.
    pub static ref PURE_FILTERS: HashSet<&'static str> = [
        "upper", "lower", "title", "capitalize", "swapcase", "trim", "strip", "lstrip",
        "rstrip", "escape", "e", "forceescape", "default", "d", "int", "float", "string",
        "str", "bool", "length", "count", "first", "last", "join", "center", "ljust",
        "rjust", "truncate", "wordwrap", "indent", "urlencode",
    ]
    .into_iter()
    .collect();
}

/// Applies a builtin pure filter at compile time. `None` means the name
/// isn't a builtin pure filter (or isn't compiled in) and must stay a
/// runtime call.
pub(crate) fn eval_const_filter(
    name: &str,
    value: &Value,
    args: &[Value],
    kwargs: &HashMap<String, Value>,
) -> Option<Result<Value>> {
    let result = match name {
        "upper" => string::upper(value, args, kwargs),
        "lower" => string::lower(value, args, kwargs),
        "title" => string::title(value, args, kwargs),
        "capitalize" => string::capitalize(value, args, kwargs),
        "swapcase" => string::swapcase(value, args, kwargs),
        "trim" | "strip" => string::trim(value, args, kwargs),
        "lstrip" => string::trim_start(value, args, kwargs),
        "rstrip" => string::trim_end(value, args, kwargs),
        "center" => string::center(value, args, kwargs),
        "ljust" => string::ljust(value, args, kwargs),
        "rjust" => string::rjust(value, args, kwargs),
        "truncate" => string::truncate(value, args, kwargs),
        "wordwrap" => string::wordwrap(value, args, kwargs),
        "indent" => string::indent(value, args, kwargs),
        #[cfg(feature = "urlencode")]
        "urlencode" => string::urlencode(value, args, kwargs),
        "escape" | "e" => common::escape_html(value, args, kwargs),
        "forceescape" => common::forceescape(value, args, kwargs),
        "default" | "d" => common::default(value, args, kwargs),
        "int" => common::int(value, args, kwargs),
        "float" => common::float(value, args, kwargs),
        "string" | "str" => common::string(value, args, kwargs),
        "bool" => common::bool_filter(value, args, kwargs),
        "length" | "count" => common::length(value, args, kwargs),
        "first" => array::first(value, args, kwargs),
        "last" => array::last(value, args, kwargs),
        "join" => array::join(value, args, kwargs),
        _ => return None,
    };
    Some(result)
}
