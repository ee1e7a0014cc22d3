//! One scope frame of a render.

use std::borrow::Cow;
use std::collections::HashMap;

use serde_json::Value;

use crate::context::dotted_pointer;
use crate::errors::Result;
use crate::renderer::for_loop::ForLoop;

pub type Val<'a> = Cow<'a, Value>;
pub type FrameContext<'a> = HashMap<String, Val<'a>>;

/// Gets a value within a value by dotted pointer, keeping lifetime
#[inline]
pub fn value_by_pointer<'a>(pointer: &str, val: &Val<'a>) -> Option<Val<'a>> {
    match *val {
        Cow::Borrowed(r) => dotted_pointer(r, pointer).map(Cow::Borrowed),
        Cow::Owned(ref r) => dotted_pointer(r, pointer).map(|found| Cow::Owned(found.clone())),
    }
}

/// Enumerates the types of stack frames
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
    /// Original frame
    Origin,
    /// New frame for macro call
    Macro,
    /// New frame for for loop
    ForLoop,
    /// Include template
    Include,
    /// `{% with %}` bindings
    With,
}

/// Entry in the call stack
#[derive(Debug)]
pub struct StackFrame<'a> {
    /// Type of stack frame
    pub kind: FrameType,
    /// Frame name for context/debugging
    pub name: String,
    /// Assigned values (via `{% set %}`, `{% let %}`, loop bindings,
    /// macro arguments)
    context: FrameContext<'a>,
    /// `ForLoop` if frame is for a for loop
    pub for_loop: Option<ForLoop<'a>>,
}

impl<'a> StackFrame<'a> {
    pub fn new(kind: FrameType, name: impl Into<String>) -> Self {
        StackFrame { kind, name: name.into(), context: FrameContext::new(), for_loop: None }
    }

    pub fn new_for_loop(name: impl Into<String>, for_loop: ForLoop<'a>) -> Self {
        StackFrame {
            kind: FrameType::ForLoop,
            name: name.into(),
            context: FrameContext::new(),
            for_loop: Some(for_loop),
        }
    }

    pub fn new_macro(name: impl Into<String>, context: FrameContext<'a>) -> Self {
        StackFrame { kind: FrameType::Macro, name: name.into(), context, for_loop: None }
    }

    /// Finds a value in the stack frame: `context` first, then the
    /// loop bindings.
    pub fn find_value(&self, key: &str) -> Result<Option<Val<'a>>> {
        if let Some(found) = self.find_value_in_frame(key) {
            return Ok(Some(found));
        }
        self.find_value_in_for_loop(key)
    }

    /// Finds a value in `context`.
    pub fn find_value_in_frame(&self, key: &str) -> Option<Val<'a>> {
        if let Some(dot) = key.find('.') {
            if let Some(found_value) =
                self.context.get(&key[..dot]).map(|v| value_by_pointer(&key[dot + 1..], v))
            {
                return found_value;
            }
        } else if let Some(found) = self.context.get(key) {
            return Some(found.clone());
        }

        None
    }

    /// Finds a value in the `for_loop` if there is one
    pub fn find_value_in_for_loop(&self, key: &str) -> Result<Option<Val<'a>>> {
        let Some(ref for_loop) = self.for_loop else {
            return Ok(None);
        };

        let (real_key, tail) = match key.find('.') {
            Some(pos) => (&key[..pos], &key[pos + 1..]),
            None => (key, ""),
        };

        // the `loop` object, only exposed when the compiler saw a use
        if real_key == "loop" && for_loop.exposes_loop && !tail.is_empty() {
            // only the first attribute level belongs to the loop
            let (attr, rest) = match tail.find('.') {
                Some(pos) => (&tail[..pos], &tail[pos + 1..]),
                None => (tail, ""),
            };
            return match for_loop.attribute(attr)? {
                Some(value) if rest.is_empty() => Ok(Some(value)),
                Some(value) => Ok(value_by_pointer(rest, &value)),
                None => Ok(None),
            };
        }

        // the key of a key-value loop
        if let Some(ref key_name) = for_loop.key_name {
            if real_key == key_name && tail.is_empty() {
                return Ok(for_loop.current_key().map(|k| Cow::Owned(Value::String(k))));
            }
        }

        if real_key == for_loop.value_name && !for_loop.value_name.is_empty() {
            let current = for_loop.current_value();
            return match current {
                Some(value) if tail.is_empty() => Ok(Some(value)),
                Some(value) => Ok(value_by_pointer(tail, &value)),
                None => Ok(None),
            };
        }

        Ok(None)
    }

    /// Insert a value in the context
    pub fn insert(&mut self, key: impl Into<String>, value: Val<'a>) {
        self.context.insert(key.into(), value);
    }

    /// Loop frames drop their `{% let %}` bindings on each iteration
    pub fn clear_context(&mut self) {
        if self.for_loop.is_some() {
            self.context.clear();
        }
    }

    pub fn context_owned(&self) -> HashMap<String, Value> {
        let mut context = HashMap::new();

        for (key, val) in &self.context {
            context.insert(key.clone(), val.clone().into_owned());
        }

        context
    }
}
