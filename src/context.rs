use std::borrow::Cow;

use serde::ser::Serialize;
use serde_json::value::{to_value, Map, Value};

use crate::utils::as_safe_string;

/// The struct that holds the context of a template rendering.
///
/// Light wrapper around a JSON object for easier insertions of
/// Serializable values. Renders borrow it directly, so building a context
/// once and rendering many times costs nothing extra.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    data: Value,
}

impl Default for Context {
    fn default() -> Self {
        Context { data: Value::Object(Map::new()) }
    }
}

impl Context {
    /// Initializes an empty context
    pub fn new() -> Self {
        Context::default()
    }

    fn map_mut(&mut self) -> &mut Map<String, Value> {
        match self.data {
            Value::Object(ref mut m) => m,
            _ => unreachable!("context data is always an object"),
        }
    }

    fn map(&self) -> &Map<String, Value> {
        match self.data {
            Value::Object(ref m) => m,
            _ => unreachable!("context data is always an object"),
        }
    }

    /// Converts the `val` parameter to `Value` and insert it into the context.
    ///
    /// Panics if the serialization fails; use [`Context::try_insert`] for
    /// types whose serialization can error.
    ///
    /// ```rust
    /// # use kida::Context;
    /// let mut context = Context::new();
    /// context.insert("number_users", &42);
    /// ```
    pub fn insert<T: Serialize + ?Sized, S: Into<String>>(&mut self, key: S, val: &T) {
        self.map_mut().insert(key.into(), to_value(val).unwrap());
    }

    /// Converts the `val` parameter to `Value` and insert it into the
    /// context, propagating serialization failures.
    pub fn try_insert<T: Serialize + ?Sized, S: Into<String>>(
        &mut self,
        key: S,
        val: &T,
    ) -> crate::Result<()> {
        self.map_mut().insert(key.into(), to_value(val).map_err(crate::Error::json)?);
        Ok(())
    }

    /// Appends the data of the `source` parameter to `self`, overwriting
    /// existing keys. The source context will be dropped.
    pub fn extend(&mut self, source: Context) {
        if let Value::Object(source_map) = source.data {
            self.map_mut().extend(source_map);
        }
    }

    /// Looks up a value previously inserted in the context
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map().get(key)
    }

    /// Removes a value from the context, returning it
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.map_mut().remove(key)
    }

    /// Checks if a value exists at a specific key
    pub fn contains_key(&self, key: &str) -> bool {
        self.map().contains_key(key)
    }

    /// The context as a borrowed JSON object; what renders read
    pub fn as_value(&self) -> &Value {
        &self.data
    }

    /// Converts the context to a `serde_json::Value` consuming the context
    pub fn into_json(self) -> Value {
        self.data
    }

    /// Builds a `Context` from a `serde_json::Value`; errors if the value
    /// isn't an object.
    pub fn from_value(value: Value) -> crate::Result<Self> {
        match value {
            Value::Object(_) => Ok(Context { data: value }),
            _ => Err(crate::Error::msg(
                "Creating a Context from a Value requires it to be a JSON object",
            )),
        }
    }

    /// Builds a `Context` from any value implementing `Serialize`, as long
    /// as it serializes to an object.
    pub fn from_serialize(value: impl Serialize) -> crate::Result<Self> {
        let obj = to_value(value).map_err(crate::Error::json)?;
        Context::from_value(obj)
    }
}

impl From<Context> for Value {
    fn from(ctx: Context) -> Self {
        ctx.data
    }
}

pub trait ValueRender {
    fn render(&self) -> Cow<'_, str>;
}

// Convert serde Value to rendered string
impl ValueRender for Value {
    fn render(&self) -> Cow<'_, str> {
        match *self {
            Value::String(ref s) => Cow::Borrowed(s),
            Value::Number(ref i) => Cow::Owned(i.to_string()),
            Value::Bool(i) => Cow::Owned(i.to_string()),
            Value::Null => Cow::Owned(String::new()),
            Value::Array(ref a) => {
                let mut buf = String::new();
                buf.push('[');
                for i in a.iter() {
                    if buf.len() > 1 {
                        buf.push_str(", ");
                    }
                    buf.push_str(i.render().as_ref());
                }
                buf.push(']');
                Cow::Owned(buf)
            }
            Value::Object(_) => match as_safe_string(self) {
                Some(s) => Cow::Borrowed(s),
                None => Cow::Owned("[object]".to_owned()),
            },
        }
    }
}

pub trait ValueNumber {
    fn to_number(&self) -> Result<f64, ()>;
}
// Needed for all the maths: convert everything to f64
impl ValueNumber for Value {
    fn to_number(&self) -> Result<f64, ()> {
        match *self {
            Value::Number(ref i) => Ok(i.as_f64().unwrap()),
            _ => Err(()),
        }
    }
}

pub trait ValueTruthy {
    fn is_truthy(&self) -> bool;
}

impl ValueTruthy for Value {
    fn is_truthy(&self) -> bool {
        match *self {
            Value::Number(ref i) => {
                if i.is_i64() {
                    return i.as_i64().unwrap() != 0;
                }
                if i.is_u64() {
                    return i.as_u64().unwrap() != 0;
                }
                let f = i.as_f64().unwrap();
                f != 0.0 && !f.is_nan()
            }
            Value::Bool(i) => i,
            Value::Null => false,
            Value::String(ref i) => !i.is_empty(),
            Value::Array(ref i) => !i.is_empty(),
            Value::Object(ref i) => !i.is_empty(),
        }
    }
}

/// Converts a dotted path to a json pointer one
#[inline]
pub fn get_json_pointer(key: &str) -> String {
    ["/", &key.replace('.', "/")].join("")
}

/// Looks up a dotted path (`a.b.0.c`) in a value. Subscript lookup comes
/// first for objects; array steps must parse as indexes.
pub fn dotted_pointer<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for part in path.split('.') {
        match current {
            Value::Object(obj) => current = obj.get(part)?,
            Value::Array(arr) => {
                let idx: usize = part.parse().ok()?;
                current = arr.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extend() {
        let mut target = Context::new();
        target.insert("a", &1);
        target.insert("b", &2);
        let mut source = Context::new();
        source.insert("b", &3);
        source.insert("c", &4);
        target.extend(source);
        assert_eq!(*target.get("a").unwrap(), to_value(1).unwrap());
        assert_eq!(*target.get("b").unwrap(), to_value(3).unwrap());
        assert_eq!(*target.get("c").unwrap(), to_value(4).unwrap());
    }

    #[test]
    fn test_dotted_pointer() {
        let value = json!({"page": {"title": "Home", "tags": ["a", "b"]}});
        assert_eq!(dotted_pointer(&value, "page.title"), Some(&json!("Home")));
        assert_eq!(dotted_pointer(&value, "page.tags.1"), Some(&json!("b")));
        assert_eq!(dotted_pointer(&value, "page.missing"), None);
        assert_eq!(dotted_pointer(&value, ""), Some(&value));
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(Context::from_value(json!([1, 2])).is_err());
        assert!(Context::from_value(json!({"a": 1})).is_ok());
    }
}
