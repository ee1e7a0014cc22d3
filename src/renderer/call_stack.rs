//! The stack of scope frames of one render.

use std::borrow::Cow;

use serde_json::Value;

use crate::context::dotted_pointer;
use crate::errors::{Error, Result};
use crate::renderer::for_loop::{ForLoop, ForLoopState};
use crate::renderer::stack_frame::{FrameContext, FrameType, StackFrame, Val};

/// Contains the stack of frames with the user context at the bottom.
#[derive(Debug)]
pub struct CallStack<'a> {
    /// The stack of frames
    stack: Vec<StackFrame<'a>>,
    /// User supplied context for the render; always a JSON object
    context: &'a Value,
}

impl<'a> CallStack<'a> {
    pub fn new(context: &'a Value, template_name: impl Into<String>) -> Self {
        CallStack {
            stack: vec![StackFrame::new(FrameType::Origin, template_name)],
            context,
        }
    }

    pub fn push_frame(&mut self, frame: StackFrame<'a>) {
        self.stack.push(frame);
    }

    pub fn push_for_loop_frame(&mut self, name: impl Into<String>, for_loop: ForLoop<'a>) {
        self.stack.push(StackFrame::new_for_loop(name, for_loop));
    }

    pub fn push_macro_frame(&mut self, name: impl Into<String>, context: FrameContext<'a>) {
        self.stack.push(StackFrame::new_macro(name, context));
    }

    pub fn pop(&mut self) -> StackFrame<'a> {
        self.stack.pop().expect("the origin frame is never popped")
    }

    fn current_frame(&mut self) -> &mut StackFrame<'a> {
        self.stack.last_mut().expect("call stack is never empty")
    }

    /// Looks up a dotted path frame by frame, then in the user context.
    /// Macro frames isolate: lookups from inside a macro don't see the
    /// caller's locals.
    pub fn lookup(&self, key: &str) -> Result<Option<Val<'a>>> {
        for frame in self.stack.iter().rev() {
            if let Some(found) = frame.find_value(key)? {
                return Ok(Some(found));
            }
            if frame.kind == FrameType::Macro {
                break;
            }
        }

        Ok(dotted_pointer(self.context, key).map(Cow::Borrowed))
    }

    /// `{% let %}`: binds in the current frame only.
    pub fn insert_local(&mut self, key: impl Into<String>, value: Val<'a>) {
        self.current_frame().insert(key, value);
    }

    /// `{% set %}`: binds in the nearest function-like frame so the value
    /// survives the end of loops and blocks, without crossing macro or
    /// include boundaries.
    pub fn insert_leaking(&mut self, key: impl Into<String>, value: Val<'a>) {
        for frame in self.stack.iter_mut().rev() {
            match frame.kind {
                FrameType::Origin | FrameType::Macro | FrameType::Include => {
                    frame.insert(key, value);
                    return;
                }
                _ => (),
            }
        }
        unreachable!("there is always an origin frame");
    }

    /// The innermost loop frame, if any
    fn innermost_loop(&mut self) -> Option<&mut ForLoop<'a>> {
        for frame in self.stack.iter_mut().rev() {
            if let Some(ref mut for_loop) = frame.for_loop {
                return Some(for_loop);
            }
            if frame.kind == FrameType::Macro {
                break;
            }
        }
        None
    }

    pub fn break_loop(&mut self) -> Result<()> {
        match self.innermost_loop() {
            Some(for_loop) => {
                for_loop.break_loop();
                Ok(())
            }
            None => Err(Error::runtime("`{% break %}` was used outside of a loop")),
        }
    }

    pub fn continue_loop(&mut self) -> Result<()> {
        match self.innermost_loop() {
            Some(for_loop) => {
                for_loop.continue_loop();
                Ok(())
            }
            None => Err(Error::runtime("`{% continue %}` was used outside of a loop")),
        }
    }

    pub fn increment_for_loop(&mut self) -> Result<()> {
        let frame = self.current_frame();
        frame.clear_context();
        match frame.for_loop {
            Some(ref mut for_loop) => {
                for_loop.increment();
                Ok(())
            }
            None => Err(Error::msg("Tried to increment a loop without a loop frame")),
        }
    }

    /// Whether rendering of the current body should stop early because of
    /// a break or continue.
    pub fn should_break_body(&self) -> bool {
        for frame in self.stack.iter().rev() {
            if let Some(ref for_loop) = frame.for_loop {
                return for_loop.state != ForLoopState::Normal;
            }
            if frame.kind == FrameType::Macro {
                break;
            }
        }
        false
    }

    /// Whether the innermost loop should stop iterating.
    pub fn should_break_for_loop(&self) -> bool {
        for frame in self.stack.iter().rev() {
            if let Some(ref for_loop) = frame.for_loop {
                return for_loop.state == ForLoopState::Break;
            }
            if frame.kind == FrameType::Macro {
                break;
            }
        }
        false
    }

    /// The current state of the loop recursion depth, for `recursive`
    /// loops calling `loop(...)`.
    pub fn current_loop_depth(&self) -> usize {
        for frame in self.stack.iter().rev() {
            if let Some(ref for_loop) = frame.for_loop {
                return for_loop.depth;
            }
        }
        0
    }

    /// The recursive loop AST of the innermost loop, for `loop(...)`.
    pub fn current_recursive_node(
        &self,
    ) -> Option<std::sync::Arc<crate::parser::ast::Forloop>> {
        for frame in self.stack.iter().rev() {
            if let Some(ref for_loop) = frame.for_loop {
                return for_loop.recursive_node.clone();
            }
            if frame.kind == FrameType::Macro {
                break;
            }
        }
        None
    }

    /// All bindings visible at this point, owned; used to hand the
    /// current scope to includes and embeds.
    pub fn collect_bindings(&self) -> std::collections::HashMap<String, Value> {
        let mut bindings = std::collections::HashMap::new();
        // bottom-up so inner frames win
        let start = self
            .stack
            .iter()
            .rposition(|f| f.kind == FrameType::Macro)
            .unwrap_or(0);
        for frame in &self.stack[start..] {
            bindings.extend(frame.context_owned());
        }
        bindings
    }

    pub fn user_context(&self) -> &'a Value {
        self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_goes_through_frames_to_context() {
        let context = json!({"name": "kida", "page": {"title": "Home"}});
        let mut stack = CallStack::new(&context, "test");

        assert_eq!(stack.lookup("name").unwrap().unwrap().as_ref(), &json!("kida"));
        assert_eq!(stack.lookup("page.title").unwrap().unwrap().as_ref(), &json!("Home"));
        assert!(stack.lookup("missing").unwrap().is_none());

        stack.insert_local("name", Cow::Owned(json!("shadowed")));
        assert_eq!(stack.lookup("name").unwrap().unwrap().as_ref(), &json!("shadowed"));
    }

    #[test]
    fn test_macro_frames_isolate() {
        let context = json!({"outer": 1});
        let mut stack = CallStack::new(&context, "test");
        stack.insert_local("local_var", Cow::Owned(json!(2)));
        stack.push_macro_frame("my_macro", FrameContext::new());

        // locals don't cross the macro boundary but the user context does
        assert!(stack.lookup("local_var").unwrap().is_none());
        assert_eq!(stack.lookup("outer").unwrap().unwrap().as_ref(), &json!(1));
    }

    #[test]
    fn test_set_leaks_out_of_loop_frames() {
        let context = json!({});
        let mut stack = CallStack::new(&context, "test");
        let items = json!([1, 2]);
        stack.push_for_loop_frame("x", ForLoop::from_array("x", Cow::Borrowed(&items)));

        stack.insert_leaking("total", Cow::Owned(json!(42)));
        stack.pop();
        assert_eq!(stack.lookup("total").unwrap().unwrap().as_ref(), &json!(42));
    }

    #[test]
    fn test_break_without_loop_errors() {
        let context = json!({});
        let mut stack = CallStack::new(&context, "test");
        assert!(stack.break_loop().is_err());
    }
}
