mod async_support;
pub(crate) mod call_stack;
pub(crate) mod context;
pub(crate) mod for_loop;
pub(crate) mod ops;
pub(crate) mod processor;
pub(crate) mod stack_frame;
mod stream;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use serde_json::Value;

use crate::compiler::CompiledTemplate;
use crate::environment::Environment;
use crate::errors::Result;

pub use context::{RenderCacheStats, RenderContext};
pub use stream::{AsyncRenderStream, RenderStream};

use processor::Processor;

/// Given a compiled template and a context, drives one of the three
/// render variants.
pub struct Renderer<'a> {
    template: Arc<CompiledTemplate>,
    env: &'a Environment,
    context: &'a Value,
    should_escape: bool,
}

impl<'a> Renderer<'a> {
    pub fn new(
        template: Arc<CompiledTemplate>,
        env: &'a Environment,
        context: &'a Value,
        should_escape: bool,
    ) -> Self {
        Renderer { template, env, context, should_escape }
    }

    fn processor(&self) -> Processor<'a> {
        Processor::new(self.env, self.template.clone(), self.context, self.should_escape)
    }

    /// Combines the template with the context into one string.
    pub fn render(&self) -> Result<String> {
        let render_ctx = RenderContext::new(
            self.template.name.clone(),
            self.template.filename.clone(),
            self.env.config().max_include_depth,
        );
        let mut processor = self.processor();
        context::scoped(render_ctx, || processor.render())
    }

    /// Lazy sync chunks, one per top-level statement.
    pub fn render_stream(&self) -> Result<RenderStream<'a>> {
        RenderStream::new(self.processor())
    }

    /// Async chunk stream; the only way to render async-tainted
    /// templates, and a valid way to render sync ones.
    pub fn render_stream_async(&self) -> AsyncRenderStream<'a> {
        AsyncRenderStream::new(self.processor())
    }

    /// Async full render.
    pub async fn render_async(&self) -> Result<String> {
        let mut processor = self.processor();
        processor.render_async().await
    }
}
