//! The chunked render variants: a lazy iterator for sync templates and a
//! channel-fed `Stream` for async ones.
//!
//! Chunk boundaries are top-level statement boundaries. The async stream
//! additionally flushes a chunk per iteration of a top-level
//! `{% async for %}` and suspends at every `await` the template resolves.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures::future::BoxFuture;
use futures::stream::Stream;
use tokio::sync::mpsc;

use crate::compiler::CompiledTemplate;
use crate::errors::Result;
use crate::parser::ast::Node;
use crate::renderer::processor::Processor;

/// Lazy sync chunks: one per top-level statement of the resolved root
/// template. Bindings made by one chunk stay visible to the next because
/// the same processor runs them all.
pub struct RenderStream<'e> {
    processor: Processor<'e>,
    root: Arc<CompiledTemplate>,
    index: usize,
    done: bool,
}

impl<'e> RenderStream<'e> {
    pub(crate) fn new(mut processor: Processor<'e>) -> Result<Self> {
        processor.resolve_chain().map_err(|e| {
            let name = processor.template_name();
            e.enhance(&name, 0)
        })?;
        let root = processor.root_template();
        Ok(RenderStream { processor, root, index: 0, done: false })
    }

    /// Collects the remaining chunks into one string.
    pub fn into_string(self) -> Result<String> {
        let mut out = String::new();
        for chunk in self {
            out.push_str(&chunk?);
        }
        Ok(out)
    }
}

impl Iterator for RenderStream<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        // empty chunks (comments, sets, whitespace-trimmed tags) are
        // skipped rather than yielded
        loop {
            let Some(node) = self.root.ast.get(self.index) else {
                self.done = true;
                return None;
            };
            self.index += 1;

            match self.processor.render_top_node(node) {
                Ok(chunk) if chunk.is_empty() => continue,
                Ok(chunk) => return Some(Ok(chunk)),
                Err(error) => {
                    self.done = true;
                    return Some(Err(error));
                }
            }
        }
    }
}

/// Async chunks, fed by the render future through a bounded channel. The
/// future only advances while the stream is polled, so rendering proceeds
/// in step with consumption and cancellation is just dropping the stream.
pub struct AsyncRenderStream<'e> {
    future: Option<BoxFuture<'e, ()>>,
    receiver: mpsc::Receiver<Result<String>>,
}

impl<'e> AsyncRenderStream<'e> {
    pub(crate) fn new(processor: Processor<'e>) -> Self {
        let (sender, receiver) = mpsc::channel(1);
        let future: BoxFuture<'e, ()> = Box::pin(drive(processor, sender));
        AsyncRenderStream { future: Some(future), receiver }
    }

    /// Collects the whole stream into one string.
    pub async fn into_string(mut self) -> Result<String> {
        use futures::StreamExt;

        let mut out = String::new();
        while let Some(chunk) = self.next().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }
}

async fn drive(mut processor: Processor<'_>, sender: mpsc::Sender<Result<String>>) {
    if let Err(error) = processor.resolve_chain() {
        let name = processor.template_name();
        let _ = sender.send(Err(error.enhance(&name, 0))).await;
        return;
    }

    let root = processor.root_template();
    for node in &root.ast {
        // a top-level async for flushes one chunk per iteration
        if let Node::Forloop(_, forloop, _) = node {
            if forloop.is_async {
                if let Err(error) = stream_async_for(&mut processor, forloop, &sender).await {
                    let _ = sender.send(Err(error)).await;
                    return;
                }
                continue;
            }
        }

        match processor.render_top_node_async(node).await {
            Ok(chunk) => {
                if !chunk.is_empty() && sender.send(Ok(chunk)).await.is_err() {
                    // consumer dropped the stream: cancel the render
                    return;
                }
            }
            Err(error) => {
                let _ = sender.send(Err(error)).await;
                return;
            }
        }
    }
}

async fn stream_async_for(
    processor: &mut Processor<'_>,
    forloop: &crate::parser::ast::Forloop,
    sender: &mpsc::Sender<Result<String>>,
) -> Result<()> {
    let container = processor
        .eval_expression_async(&forloop.container)
        .await?
        .into_value()?;
    let mut for_loop = processor.build_for_loop(forloop, container)?;
    for_loop.exposes_loop = forloop.uses_loop;
    for_loop.len_known = false;

    if for_loop.is_empty() {
        if let Some(ref empty_body) = forloop.empty_body {
            let chunk = processor.render_body_to_string_async(empty_body).await?;
            if !chunk.is_empty() {
                let _ = sender.send(Ok(chunk)).await;
            }
        }
        return Ok(());
    }

    let mut scratch = String::new();
    processor
        .run_for_loop_async(for_loop, &forloop.body, &mut scratch, Some(sender))
        .await
}

impl Stream for AsyncRenderStream<'_> {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.receiver.poll_recv(cx) {
                Poll::Ready(Some(item)) => return Poll::Ready(Some(item)),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => match this.future.as_mut() {
                    Some(future) => match future.as_mut().poll(cx) {
                        // dropping the finished future drops the sender,
                        // which closes the channel once it's drained
                        Poll::Ready(()) => {
                            this.future = None;
                        }
                        Poll::Pending => return Poll::Pending,
                    },
                    None => return Poll::Ready(None),
                },
            }
        }
    }
}
