//! The async render path: the same tree walk as the sync processor, but
//! able to suspend at `await` expressions and `{% async for %}` bodies.
//!
//! Nodes without any async construct in them go straight through the sync
//! walker; only the spine above an async construct pays the boxed-future
//! cost.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc::Sender;

use crate::compiler::body_is_async;
use crate::errors::{Error, ErrorKind, Result};
use crate::parser::ast::*;
use crate::renderer::for_loop::ForLoop;
use crate::renderer::processor::{CallTarget, Evaluated, Processor};
use crate::renderer::stack_frame::{FrameType, StackFrame, Val};
use crate::utils;

/// Whether a node needs the async walker. Includes and embeds always go
/// through it so the templates they pull in may themselves be async.
fn node_is_async(node: &Node) -> bool {
    matches!(node, Node::Include(..) | Node::Embed(..))
        || body_is_async(std::slice::from_ref(node))
}

impl<'a> Processor<'a> {
    /// Full render, async variant. Works for sync templates too, which is
    /// what makes `render_stream_async` available on every template.
    pub async fn render_async(&mut self) -> Result<String> {
        self.resolve_chain().map_err(|e| self.enhance(e))?;
        let root = self.root_template();
        let mut output = String::with_capacity(utils::buffer_capacity(root.ast.len()));
        match self.render_body_async(&root.ast, &mut output).await {
            Ok(()) => Ok(output),
            Err(e) => Err(self.enhance(e)),
        }
    }

    /// Renders one top-level statement asynchronously, for the stream
    /// driver.
    pub(crate) async fn render_top_node_async(&mut self, node: &Node) -> Result<String> {
        let mut chunk = String::new();
        match self.render_node_async(node, &mut chunk).await {
            Ok(()) => Ok(chunk),
            Err(e) => Err(self.enhance(e)),
        }
    }

    pub(crate) fn render_body_async<'f>(
        &'f mut self,
        body: &'f [Node],
        output: &'f mut String,
    ) -> BoxFuture<'f, Result<()>> {
        Box::pin(async move {
            for node in body {
                self.render_node_async(node, output).await?;
                if self.call_stack.should_break_body() {
                    break;
                }
            }
            Ok(())
        })
    }

    pub(crate) async fn render_body_to_string_async(&mut self, body: &[Node]) -> Result<String> {
        let mut buffer = String::with_capacity(utils::buffer_capacity(body.len()));
        self.render_body_async(body, &mut buffer).await?;
        Ok(buffer)
    }

    async fn render_node_async(&mut self, node: &Node, output: &mut String) -> Result<()> {
        if !node_is_async(node) {
            return self.render_node(node, output);
        }

        match node {
            Node::Output(_, expr) => {
                let value = self.eval_expression_async(expr).await?.into_value()?;
                self.write_value(&value, output);
            }
            Node::Emit(_, parts) => {
                for part in parts {
                    match part {
                        EmitPart::Text(text) => output.push_str(text),
                        EmitPart::Expr(expr) => {
                            let value = self.eval_expression_async(expr).await?.into_value()?;
                            self.write_value(&value, output);
                        }
                    }
                }
            }
            Node::Set(_, set) => {
                let value = self.eval_expression_async(&set.value).await?.into_value()?;
                match set.scope {
                    SetScope::Local => self.call_stack.insert_local(set.key.clone(), value),
                    SetScope::Leak => self.call_stack.insert_leaking(set.key.clone(), value),
                    SetScope::Export => {
                        self.record_export(set.key.clone(), value.clone().into_owned());
                        self.call_stack.insert_local(set.key.clone(), value);
                    }
                }
            }
            Node::Do(_, expr) => {
                let _ = self.eval_expression_async(expr).await?;
            }
            Node::If(if_node, _) => {
                for (_, expr, body) in &if_node.conditions {
                    if self.eval_as_bool_async(expr).await? {
                        return self.render_body_async(body, output).await;
                    }
                }
                if let Some((_, ref body)) = if_node.otherwise {
                    return self.render_body_async(body, output).await;
                }
            }
            Node::Forloop(_, forloop, _) => {
                self.render_for_loop_async(forloop, output).await?;
            }
            Node::While(_, while_loop, _) => {
                self.call_stack.push_for_loop_frame("while", ForLoop::for_while());
                loop {
                    let keep_going = match self.eval_as_bool_async(&while_loop.condition).await {
                        Ok(b) => b,
                        Err(e) => {
                            self.call_stack.pop();
                            return Err(e);
                        }
                    };
                    if !keep_going {
                        break;
                    }
                    let result = self.render_body_async(&while_loop.body, output).await;
                    if result.is_err() {
                        self.call_stack.pop();
                        return result;
                    }
                    if self.call_stack.should_break_for_loop() {
                        break;
                    }
                    self.call_stack.increment_for_loop()?;
                }
                self.call_stack.pop();
            }
            Node::Match(_, match_block, _) => {
                let subject = self.eval_expression_async(&match_block.subject).await?.into_value()?;
                for case in &match_block.cases {
                    let matched = match &case.pattern {
                        CasePattern::Wildcard => true,
                        CasePattern::Literal(expr) => {
                            let literal = expr
                                .as_literal()
                                .expect("case patterns are literals by construction");
                            crate::renderer::ops::values_equal(subject.as_ref(), &literal)
                        }
                    };
                    if !matched {
                        continue;
                    }
                    if let Some(ref guard) = case.guard {
                        if !self.eval_as_bool_async(guard).await? {
                            continue;
                        }
                    }
                    return self.render_body_async(&case.body, output).await;
                }
            }
            Node::With(_, with, _) => {
                let mut frame = StackFrame::new(FrameType::With, "with");
                for (name, expr) in &with.assignments {
                    let value = self.eval_expression_async(expr).await?.into_value()?;
                    frame.insert(name.clone(), value);
                }
                self.call_stack.push_frame(frame);
                let result = self.render_body_async(&with.body, output).await;
                self.call_stack.pop();
                result?;
            }
            Node::Block(_, block, _) => {
                self.render_block_by_name_async(&block.name, output).await?;
            }
            Node::Super => self.render_super_async(output).await?,
            Node::CallBlock(_, call_block, _) => {
                let caller = self.render_body_to_string_async(&call_block.body).await?;
                let rendered =
                    self.eval_function_call_async(&call_block.call, Some(caller)).await?;
                let value = rendered.into_value()?;
                self.write_value(&value, output);
            }
            Node::Capture(_, capture, _) => {
                let rendered = self.render_body_to_string_async(&capture.body).await?;
                self.call_stack
                    .insert_local(capture.name.clone(), Cow::Owned(Value::String(rendered)));
            }
            Node::Cache(_, cache, _) => self.render_cache_block_async(cache, output).await?,
            Node::FilterSection(_, section, _) => {
                let body = self.render_body_to_string_async(&section.body).await?;
                let mut value = Evaluated::Val(Cow::Owned(Value::String(body)));
                value = self.apply_filters(value, &section.filters)?;
                output.push_str(
                    crate::context::ValueRender::render(value.into_value()?.as_ref()).as_ref(),
                );
            }
            Node::Slot(_, slot, _) => {
                let override_block = self
                    .embed_blocks
                    .as_ref()
                    .and_then(|blocks| blocks.get(&slot.name))
                    .cloned();
                match override_block {
                    Some(block) => {
                        self.blocks.push((slot.name.clone(), None));
                        let result = self.render_body_async(&block.body, output).await;
                        self.blocks.pop();
                        result?;
                    }
                    None => self.render_body_async(&slot.default_body, output).await?,
                }
            }
            Node::Include(_, include) => self.render_include_async(include, output).await?,
            Node::Embed(_, embed, _) => self.render_embed_async(embed, output).await?,
            Node::Spaceless(_, body, _) => {
                let rendered = self.render_body_to_string_async(body).await?;
                output.push_str(&utils::spaceless(&rendered));
            }
            other => return self.render_node(other, output),
        }

        Ok(())
    }

    async fn render_for_loop_async(&mut self, forloop: &Forloop, output: &mut String) -> Result<()> {
        let container = self.eval_expression_async(&forloop.container).await?.into_value()?;
        let mut for_loop = self.build_for_loop(forloop, container)?;
        for_loop.exposes_loop = forloop.uses_loop;
        if forloop.is_async {
            // no buffer-dependent loop attributes inside async for
            for_loop.len_known = false;
        }
        if forloop.recursive {
            for_loop.recursive_node = Some(Arc::new(forloop.clone()));
        }

        if for_loop.is_empty() {
            if let Some(ref empty_body) = forloop.empty_body {
                return self.render_body_async(empty_body, output).await;
            }
            return Ok(());
        }

        self.run_for_loop_async(for_loop, &forloop.body, output, None).await
    }

    /// Runs a loop with async body rendering. When `sender` is set, each
    /// iteration's output is flushed as its own chunk.
    pub(crate) async fn run_for_loop_async(
        &mut self,
        for_loop: ForLoop<'a>,
        body: &[Node],
        output: &mut String,
        sender: Option<&Sender<Result<String>>>,
    ) -> Result<()> {
        let len = for_loop.len();
        let value_name = for_loop.value_name.clone();
        self.call_stack.push_for_loop_frame(value_name, for_loop);

        for _ in 0..len {
            let result = self.render_body_async(body, output).await;
            if result.is_err() {
                self.call_stack.pop();
                return result;
            }

            if let Some(sender) = sender {
                if !output.is_empty() {
                    let chunk = std::mem::take(output);
                    if sender.send(Ok(chunk)).await.is_err() {
                        // the consumer went away; stop rendering
                        break;
                    }
                }
            }

            if self.call_stack.should_break_for_loop() {
                break;
            }
            self.call_stack.increment_for_loop()?;
        }

        self.call_stack.pop();
        Ok(())
    }

    async fn render_block_by_name_async(&mut self, name: &str, output: &mut String) -> Result<()> {
        if let Some(block) = self.embed_blocks.as_ref().and_then(|blocks| blocks.get(name)) {
            let block = block.clone();
            self.blocks.push((name.to_string(), None));
            let result = self.render_body_async(&block.body, output).await;
            self.blocks.pop();
            return result;
        }

        for (level, template) in self.chain.clone().iter().enumerate() {
            if let Some(block) = template.blocks.get(name) {
                if block.required {
                    return Err(Error::runtime(format!(
                        "Block `{}` is required but no child template overrides it",
                        name
                    )));
                }
                let block = block.clone();
                self.blocks.push((name.to_string(), Some(level)));
                let result = self.render_body_async(&block.body, output).await;
                self.blocks.pop();
                return result;
            }
        }

        Ok(())
    }

    async fn render_super_async(&mut self, output: &mut String) -> Result<()> {
        let Some((name, level)) = self.blocks.last().cloned() else {
            return Err(Error::runtime("`super()` can only be used inside a block"));
        };
        let search_from = match level {
            Some(level) => level + 1,
            None => 0,
        };

        for (level, template) in self.chain.clone().iter().enumerate().skip(search_from) {
            if let Some(block) = template.blocks.get(&name) {
                let block = block.clone();
                self.blocks.push((name.clone(), Some(level)));
                let result = self.render_body_async(&block.body, output).await;
                self.blocks.pop();
                return result;
            }
        }

        Err(Error::runtime(format!(
            "Tried to use `super()` in block `{}` but there is no parent block",
            name
        )))
    }

    async fn render_include_async(&mut self, include: &Include, output: &mut String) -> Result<()> {
        let name = self.eval_template_name(&include.template)?;
        let template = match self.env.get_template(&name) {
            Ok(template) => template,
            Err(error) => {
                if include.ignore_missing && matches!(error.kind, ErrorKind::TemplateNotFound(_)) {
                    return Ok(());
                }
                return Err(error);
            }
        };

        self.render_ctx.enter_include()?;
        let rendered = if include.with_context {
            let bindings = self.call_stack_bindings();
            let merged = self.merged_context(bindings);
            let mut sub = Processor::with_depth(
                self.env,
                template,
                &merged,
                self.should_escape,
                self.render_ctx.include_depth,
            );
            sub.render_async().await
        } else {
            let empty = Value::Object(serde_json::Map::new());
            let mut sub = Processor::with_depth(
                self.env,
                template,
                &empty,
                self.should_escape,
                self.render_ctx.include_depth,
            );
            sub.render_async().await
        };
        self.render_ctx.leave_include();

        output.push_str(&rendered?);
        Ok(())
    }

    async fn render_embed_async(&mut self, embed: &Embed, output: &mut String) -> Result<()> {
        let name = self.eval_template_name(&embed.template)?;
        let template = self.env.get_template(&name)?;

        let mut overrides = HashMap::new();
        for node in &embed.body {
            if let Node::Block(_, block, _) = node {
                overrides.insert(block.name.clone(), block.clone());
            }
        }

        self.render_ctx.enter_include()?;
        let bindings = self.call_stack_bindings();
        let merged = self.merged_context(bindings);
        let mut sub = Processor::with_depth(
            self.env,
            template,
            &merged,
            self.should_escape,
            self.render_ctx.include_depth,
        );
        sub.set_embed_blocks(overrides);
        let rendered = sub.render_async().await;
        self.render_ctx.leave_include();

        output.push_str(&rendered?);
        Ok(())
    }

    async fn render_cache_block_async(
        &mut self,
        cache: &CacheBlock,
        output: &mut String,
    ) -> Result<()> {
        let Some(fragment_cache) = self.env.fragment_cache() else {
            return self.render_body_async(&cache.body, output).await;
        };

        let key_value = self.eval_expression_async(&cache.key).await?.into_value()?;
        let region = self
            .blocks
            .last()
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| cache.index.to_string());
        let full_key = format!(
            "{}:{}:{}",
            self.template_name(),
            region,
            crate::context::ValueRender::render(key_value.as_ref())
        );

        if let Some(hit) = fragment_cache.get(&full_key) {
            self.render_ctx.cache_stats.hits += 1;
            output.push_str(&hit);
            return Ok(());
        }
        self.render_ctx.cache_stats.misses += 1;

        let ttl = match &cache.ttl {
            Some(expr) => {
                let value = self.eval_expression_async(expr).await?.into_value()?;
                let seconds = value.as_f64().ok_or_else(|| {
                    Error::runtime("`{% cache %}` ttl must be a number of seconds")
                })?;
                Some(Duration::from_secs_f64(seconds))
            }
            None => None,
        };

        let rendered = self.render_body_to_string_async(&cache.body).await?;
        fragment_cache.store(&full_key, rendered.clone(), ttl);
        output.push_str(&rendered);
        Ok(())
    }

    // ---- async expression evaluation ----

    pub(crate) async fn eval_as_bool_async(&mut self, expr: &Expr) -> Result<bool> {
        Ok(self.eval_expression_async(expr).await?.is_truthy())
    }

    async fn eval_value_async(&mut self, expr: &Expr) -> Result<Value> {
        Ok(self.eval_expression_async(expr).await?.into_value()?.into_owned())
    }

    pub(crate) fn eval_expression_async<'f>(
        &'f mut self,
        expr: &'f Expr,
    ) -> BoxFuture<'f, Result<Evaluated<'a>>> {
        Box::pin(async move {
            if !expr.contains_await() {
                return self.eval_expression(expr);
            }

            let base: Evaluated<'a> = match &expr.val {
                ExprVal::Await(inner) => self.eval_await(inner).await?,
                ExprVal::Math(math) => {
                    let lhs = self.eval_value_async(&math.lhs).await?;
                    let rhs = self.eval_value_async(&math.rhs).await?;
                    Evaluated::Val(Cow::Owned(crate::renderer::ops::apply_math(
                        math.operator,
                        &lhs,
                        &rhs,
                    )?))
                }
                ExprVal::Logic(logic) => {
                    let result = match logic.operator {
                        LogicOperator::And => {
                            self.eval_as_bool_async(&logic.lhs).await?
                                && self.eval_as_bool_async(&logic.rhs).await?
                        }
                        LogicOperator::Or => {
                            self.eval_as_bool_async(&logic.lhs).await?
                                || self.eval_as_bool_async(&logic.rhs).await?
                        }
                    };
                    Evaluated::Val(Cow::Owned(Value::Bool(result)))
                }
                ExprVal::Compare(compare) => {
                    let mut prev = self.eval_value_async(&compare.lhs).await?;
                    let mut result = true;
                    for (op, rhs) in &compare.comparisons {
                        let next = self.eval_value_async(rhs).await?;
                        result =
                            result && crate::renderer::ops::apply_compare(*op, &prev, &next)?;
                        if !result {
                            break;
                        }
                        prev = next;
                    }
                    Evaluated::Val(Cow::Owned(Value::Bool(result)))
                }
                ExprVal::Not(inner) => {
                    Evaluated::Val(Cow::Owned(Value::Bool(!self.eval_as_bool_async(inner).await?)))
                }
                ExprVal::Concat { left, right } => {
                    let lhs = self.eval_value_async(left).await?;
                    let rhs = self.eval_value_async(right).await?;
                    Evaluated::Val(Cow::Owned(crate::renderer::ops::concat_values(&lhs, &rhs)?))
                }
                ExprVal::NullCoalesce { left, right } => {
                    let lhs = self.eval_expression_async(left).await?;
                    if lhs.is_nullish() {
                        self.eval_expression_async(right).await?
                    } else {
                        lhs
                    }
                }
                ExprVal::Conditional { test, if_true, if_false } => {
                    if self.eval_as_bool_async(test).await? {
                        self.eval_expression_async(if_true).await?
                    } else {
                        match if_false {
                            Some(e) => self.eval_expression_async(e).await?,
                            None => Evaluated::Undefined { path: "<conditional>".to_string() },
                        }
                    }
                }
                ExprVal::List(items) | ExprVal::Tuple(items) | ExprVal::SetLiteral(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval_value_async(item).await?);
                    }
                    Evaluated::Val(Cow::Owned(Value::Array(values)))
                }
                ExprVal::FunctionCall(call) => {
                    self.eval_function_call_async(call, None).await?
                }
                // remaining shapes hold their await behind a nested
                // expression the sync evaluator will reject with a clear
                // message
                _ => {
                    return Err(Error::runtime(
                        "`await` is not supported in this position: bind it with `{% set %}` first",
                    ));
                }
            };

            self.apply_filters_async(base, &expr.filters).await
        })
    }

    async fn eval_await(&mut self, inner: &Expr) -> Result<Evaluated<'a>> {
        let ExprVal::FunctionCall(ref call) = inner.val else {
            return Err(Error::runtime("Only function calls can be awaited"));
        };
        if call.namespace.is_none() {
            if let Some(async_fn) = self.registries.async_function(&call.name) {
                if !call.args.is_empty() {
                    return Err(Error::runtime(format!(
                        "Function `{}` takes keyword arguments only",
                        call.name
                    )));
                }
                let mut kwargs = HashMap::with_capacity(call.kwargs.len());
                for (key, arg) in &call.kwargs {
                    kwargs.insert(key.clone(), self.eval_value_async(arg).await?);
                }
                let value = async_fn.call(&kwargs).await?;
                return Ok(Evaluated::Val(Cow::Owned(value)));
            }
        }
        // awaiting a plain macro or function call resolves to its value
        self.eval_function_call_async(call, None).await
    }

    pub(crate) async fn eval_function_call_async(
        &mut self,
        call: &FunctionCall,
        caller: Option<String>,
    ) -> Result<Evaluated<'a>> {
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            args.push(self.eval_value_async(arg).await?);
        }
        let mut kwargs = HashMap::with_capacity(call.kwargs.len());
        for (key, arg) in &call.kwargs {
            kwargs.insert(key.clone(), self.eval_value_async(arg).await?);
        }

        match self.resolve_call_target(call)? {
            CallTarget::Macro(template, macro_name) => {
                let def =
                    self.bind_macro_frame(&template, &macro_name, args, kwargs, caller)?;
                self.push_macro_template(template);
                let result = self.render_body_to_string_async(&def.body).await;
                self.pop_macro_template();
                self.call_stack.pop();
                Ok(Evaluated::Val(Cow::Owned(utils::mark_safe(result?))))
            }
            _ => self.dispatch_call(call, expr_pos(call), args, kwargs, caller, false),
        }
    }

    async fn apply_filters_async(
        &mut self,
        value: Evaluated<'a>,
        filters: &[FilterCall],
    ) -> Result<Evaluated<'a>> {
        if filters.is_empty() {
            return Ok(value);
        }
        // filters whose arguments don't await go through the sync path
        let any_async_args = filters.iter().any(|f| {
            f.args.iter().any(Expr::contains_await)
                || f.kwargs.values().any(Expr::contains_await)
        });
        if !any_async_args {
            return self.apply_filters(value, filters);
        }

        let mut remaining = filters;
        let mut current: Val<'a> = match value {
            Evaluated::Val(v) => v,
            Evaluated::Undefined { path } => match filters.first() {
                Some(f) if f.name == "default" || f.name == "d" => {
                    let fallback = f
                        .args
                        .first()
                        .or_else(|| f.kwargs.get("value"))
                        .ok_or_else(|| {
                            Error::msg("Filter `default` expected an arg called `value`")
                        })?;
                    let fallback = self.eval_expression_async(fallback).await?.into_value()?;
                    remaining = &filters[1..];
                    fallback
                }
                _ => return Err(Error::undefined(path)),
            },
        };

        for filter_call in remaining {
            let mut args = Vec::with_capacity(filter_call.args.len());
            for arg in &filter_call.args {
                args.push(self.eval_value_async(arg).await?);
            }
            let mut kwargs = HashMap::with_capacity(filter_call.kwargs.len());
            for (key, arg) in &filter_call.kwargs {
                kwargs.insert(key.clone(), self.eval_value_async(arg).await?);
            }
            let filter = self.registries.filter(&filter_call.name)?;
            current = Cow::Owned(filter.filter(current.as_ref(), &args, &kwargs)?);
        }

        Ok(Evaluated::Val(current))
    }
}

/// The position reported for deferred dispatch; calls carry no span of
/// their own, the surrounding expression's one is reported instead.
fn expr_pos(_call: &FunctionCall) -> crate::errors::SourcePos {
    crate::errors::SourcePos::default()
}
