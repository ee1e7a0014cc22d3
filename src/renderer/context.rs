//! Per-render bookkeeping, kept out of the user-visible context map.
//!
//! Synchronous renders scope a `RenderContext` into a thread-local stack;
//! the async renderer owns its context directly, which gives the same
//! per-task isolation across awaits.

use std::cell::RefCell;

use crate::errors::{Error, Result};

/// Counters filled in by `{% cache %}` lookups.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderCacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Per-render state: never shared across renders, torn down when the
/// render returns.
#[derive(Clone, Debug)]
pub struct RenderContext {
    pub template_name: Option<String>,
    pub filename: Option<String>,
    /// Source line currently being rendered, for error reporting
    pub line: usize,
    pub include_depth: usize,
    pub max_include_depth: usize,
    pub cache_stats: RenderCacheStats,
}

impl RenderContext {
    pub fn new(
        template_name: Option<String>,
        filename: Option<String>,
        max_include_depth: usize,
    ) -> Self {
        RenderContext {
            template_name,
            filename,
            line: 0,
            include_depth: 0,
            max_include_depth,
            cache_stats: RenderCacheStats::default(),
        }
    }

    /// Bumps the include depth, guarding against runaway recursion.
    pub fn enter_include(&mut self) -> Result<()> {
        if self.include_depth >= self.max_include_depth {
            return Err(Error::runtime(format!(
                "Maximum include depth ({}) exceeded while rendering `{}`: check for circular includes",
                self.max_include_depth,
                self.template_name.as_deref().unwrap_or("<string>")
            )));
        }
        self.include_depth += 1;
        Ok(())
    }

    pub fn leave_include(&mut self) {
        self.include_depth = self.include_depth.saturating_sub(1);
    }
}

thread_local! {
    static RENDER_CONTEXTS: RefCell<Vec<RenderContext>> = const { RefCell::new(Vec::new()) };
}

/// Scopes a render context for the duration of `f`. Nested calls stack:
/// each render sees only its own state.
pub fn scoped<R>(ctx: RenderContext, f: impl FnOnce() -> R) -> R {
    RENDER_CONTEXTS.with(|stack| stack.borrow_mut().push(ctx));
    struct PopOnDrop;
    impl Drop for PopOnDrop {
        fn drop(&mut self) {
            RENDER_CONTEXTS.with(|stack| {
                stack.borrow_mut().pop();
            });
        }
    }
    let _guard = PopOnDrop;
    f()
}

/// Runs `f` with the innermost active render context, if a render is in
/// progress on this thread.
pub fn with_current<R>(f: impl FnOnce(&mut RenderContext) -> R) -> Option<R> {
    RENDER_CONTEXTS.with(|stack| stack.borrow_mut().last_mut().map(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_stacks() {
        let outer = RenderContext::new(Some("outer.html".to_string()), None, 50);
        scoped(outer, || {
            with_current(|ctx| ctx.line = 3);
            let inner = RenderContext::new(Some("inner.html".to_string()), None, 50);
            scoped(inner, || {
                assert_eq!(
                    with_current(|ctx| ctx.template_name.clone()).unwrap(),
                    Some("inner.html".to_string())
                );
            });
            assert_eq!(with_current(|ctx| ctx.line).unwrap(), 3);
        });
        assert!(with_current(|_| ()).is_none());
    }

    #[test]
    fn test_include_depth_guard() {
        let mut ctx = RenderContext::new(None, None, 2);
        assert!(ctx.enter_include().is_ok());
        assert!(ctx.enter_include().is_ok());
        let err = ctx.enter_include().unwrap_err();
        assert!(err.to_string().contains("include depth"));
        assert!(err.to_string().contains("circular includes"));
    }
}
