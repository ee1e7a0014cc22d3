//! Loop state for `{% for %}` / `{% while %}` / `{% async for %}` bodies.

use std::borrow::Cow;

use serde_json::Value;

use crate::errors::{Error, Result};
use crate::renderer::stack_frame::Val;

/// Current state of a loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForLoopState {
    Normal,
    Break,
    Continue,
}

/// The values iterated over
#[derive(Debug)]
pub enum ForLoopValues<'a> {
    /// Array-style iteration
    Array(Vec<Val<'a>>),
    /// Object-style iteration: (key, value) pairs
    KeyValue(Vec<(String, Val<'a>)>),
    /// A `{% while %}` loop: no values, only break/continue state
    None,
}

/// Tracks one loop through its iterations
#[derive(Debug)]
pub struct ForLoop<'a> {
    /// The key name in `{% for k, v in object %}`
    pub key_name: Option<String>,
    /// The value name in `{% for v in array %}`; empty for while loops
    pub value_name: String,
    /// 0-indexed current iteration
    pub current: usize,
    pub values: ForLoopValues<'a>,
    pub state: ForLoopState,
    /// Recursion depth of a `recursive` loop, 0-indexed
    pub depth: usize,
    /// Whether the loop was allowed to count its iterable. Async loops
    /// never are; `loop.length` and friends error there.
    pub len_known: bool,
    /// Whether the body reads `loop.*`; set from the compiler's scan
    pub exposes_loop: bool,
    /// The loop's own AST when it is `recursive`, so `loop(children)` can
    /// re-render the body
    pub recursive_node: Option<std::sync::Arc<crate::parser::ast::Forloop>>,
}

impl<'a> ForLoop<'a> {
    pub fn from_array(value_name: &str, container: Val<'a>) -> Self {
        let values = match container {
            Cow::Borrowed(Value::Array(items)) => {
                ForLoopValues::Array(items.iter().map(Cow::Borrowed).collect())
            }
            Cow::Owned(Value::Array(items)) => {
                ForLoopValues::Array(items.into_iter().map(Cow::Owned).collect())
            }
            _ => unreachable!("from_array is only called with arrays"),
        };
        ForLoop {
            key_name: None,
            value_name: value_name.to_string(),
            current: 0,
            values,
            state: ForLoopState::Normal,
            depth: 0,
            len_known: true,
            exposes_loop: true,
            recursive_node: None,
        }
    }

    pub fn from_object(key_name: &str, value_name: &str, container: Val<'a>) -> Self {
        let values = match container {
            Cow::Borrowed(Value::Object(map)) => ForLoopValues::KeyValue(
                map.iter().map(|(k, v)| (k.clone(), Cow::Borrowed(v))).collect(),
            ),
            Cow::Owned(Value::Object(map)) => ForLoopValues::KeyValue(
                map.into_iter().map(|(k, v)| (k, Cow::Owned(v))).collect(),
            ),
            _ => unreachable!("from_object is only called with objects"),
        };
        ForLoop {
            key_name: Some(key_name.to_string()),
            value_name: value_name.to_string(),
            current: 0,
            values,
            state: ForLoopState::Normal,
            depth: 0,
            len_known: true,
            exposes_loop: true,
            recursive_node: None,
        }
    }

    /// State-only loop for `{% while %}`
    pub fn for_while() -> Self {
        ForLoop {
            key_name: None,
            value_name: String::new(),
            current: 0,
            values: ForLoopValues::None,
            state: ForLoopState::Normal,
            depth: 0,
            len_known: false,
            exposes_loop: false,
            recursive_node: None,
        }
    }

    #[inline]
    pub fn increment(&mut self) {
        self.current += 1;
        self.state = ForLoopState::Normal;
    }

    #[inline]
    pub fn break_loop(&mut self) {
        self.state = ForLoopState::Break;
    }

    #[inline]
    pub fn continue_loop(&mut self) {
        self.state = ForLoopState::Continue;
    }

    pub fn len(&self) -> usize {
        match &self.values {
            ForLoopValues::Array(values) => values.len(),
            ForLoopValues::KeyValue(values) => values.len(),
            ForLoopValues::None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_over(&self) -> bool {
        self.current >= self.len()
    }

    pub fn current_key(&self) -> Option<String> {
        match &self.values {
            ForLoopValues::KeyValue(values) => values.get(self.current).map(|(k, _)| k.clone()),
            _ => None,
        }
    }

    pub fn current_value(&self) -> Option<Val<'a>> {
        match &self.values {
            ForLoopValues::Array(values) => values.get(self.current).cloned(),
            ForLoopValues::KeyValue(values) => values.get(self.current).map(|(_, v)| v.clone()),
            ForLoopValues::None => None,
        }
    }

    fn value_at(&self, index: usize) -> Option<Val<'a>> {
        match &self.values {
            ForLoopValues::Array(values) => values.get(index).cloned(),
            ForLoopValues::KeyValue(values) => values.get(index).map(|(_, v)| v.clone()),
            ForLoopValues::None => None,
        }
    }

    /// Resolves one `loop.<attr>` access.
    pub fn attribute(&self, attr: &str) -> Result<Option<Val<'a>>> {
        let len_gated = matches!(attr, "length" | "last" | "revindex" | "revindex0" | "nextitem");
        if len_gated && !self.len_known {
            return Err(Error::runtime(format!(
                "`loop.{}` needs the whole iterable buffered, which async loops never do",
                attr
            )));
        }

        let value = match attr {
            "index" => Some(Cow::Owned(Value::from(self.current + 1))),
            "index0" => Some(Cow::Owned(Value::from(self.current))),
            "first" => Some(Cow::Owned(Value::Bool(self.current == 0))),
            "last" => Some(Cow::Owned(Value::Bool(self.current + 1 == self.len()))),
            "length" => Some(Cow::Owned(Value::from(self.len()))),
            "revindex" => Some(Cow::Owned(Value::from(self.len() - self.current))),
            "revindex0" => Some(Cow::Owned(Value::from(self.len() - self.current - 1))),
            "depth" => Some(Cow::Owned(Value::from(self.depth + 1))),
            "depth0" => Some(Cow::Owned(Value::from(self.depth))),
            "previtem" => {
                if self.current == 0 {
                    None
                } else {
                    self.value_at(self.current - 1)
                }
            }
            "nextitem" => self.value_at(self.current + 1),
            _ => {
                return Err(Error::runtime(format!("Unknown loop attribute `loop.{}`", attr)));
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_array_loop_attributes() {
        let container = json!(["a", "b", "c"]);
        let mut for_loop = ForLoop::from_array("x", Cow::Borrowed(&container));

        assert_eq!(for_loop.attribute("index").unwrap().unwrap().as_ref(), &json!(1));
        assert_eq!(for_loop.attribute("first").unwrap().unwrap().as_ref(), &json!(true));
        assert_eq!(for_loop.attribute("length").unwrap().unwrap().as_ref(), &json!(3));
        assert_eq!(for_loop.attribute("revindex").unwrap().unwrap().as_ref(), &json!(3));
        assert!(for_loop.attribute("previtem").unwrap().is_none());
        assert_eq!(for_loop.attribute("nextitem").unwrap().unwrap().as_ref(), &json!("b"));

        for_loop.increment();
        for_loop.increment();
        assert_eq!(for_loop.attribute("last").unwrap().unwrap().as_ref(), &json!(true));
        assert_eq!(for_loop.attribute("previtem").unwrap().unwrap().as_ref(), &json!("b"));
        assert!(for_loop.attribute("nextitem").unwrap().is_none());
    }

    #[test]
    fn test_len_gated_attributes_error_when_unknown() {
        let container = json!([1]);
        let mut for_loop = ForLoop::from_array("x", Cow::Borrowed(&container));
        for_loop.len_known = false;

        assert!(for_loop.attribute("index").is_ok());
        assert!(for_loop.attribute("length").is_err());
        assert!(for_loop.attribute("last").is_err());
        assert!(for_loop.attribute("nextitem").is_err());
        assert!(for_loop.attribute("previtem").is_ok());
    }

    #[test]
    fn test_key_value_loop() {
        let container = json!({"a": 1, "b": 2});
        let for_loop = ForLoop::from_object("k", "v", Cow::Borrowed(&container));
        assert_eq!(for_loop.current_key(), Some("a".to_string()));
        assert_eq!(for_loop.current_value().unwrap().as_ref(), &json!(1));
        assert_eq!(for_loop.len(), 2);
    }

    #[test]
    fn test_unknown_attribute() {
        let container = json!([1]);
        let for_loop = ForLoop::from_array("x", Cow::Borrowed(&container));
        assert!(for_loop.attribute("wat").is_err());
    }
}
