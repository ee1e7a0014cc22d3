//! Walks a compiled template and produces output.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use serde_json::{to_string_pretty, Map, Value};

use crate::compiler::CompiledTemplate;
use crate::context::{ValueRender, ValueTruthy};
use crate::environment::Environment;
use crate::errors::{Error, ErrorKind, Result, SourcePos};
use crate::parser::ast::*;
use crate::renderer::call_stack::CallStack;
use crate::renderer::context::RenderContext;
use crate::renderer::for_loop::ForLoop;
use crate::renderer::ops;
use crate::renderer::stack_frame::{FrameContext, FrameType, StackFrame, Val};
use crate::utils;

/// Special variable name resolving to a pretty dump of the whole context
static MAGICAL_DUMP_VAR: &str = "__kida_context";

lazy_static! {
    static ref EMPTY_CONTEXT: Value = Value::Object(Map::new());
}

/// An evaluated expression: either a value or the undefined sentinel with
/// the path that failed to resolve.
#[derive(Debug)]
pub enum Evaluated<'a> {
    Val(Val<'a>),
    Undefined { path: String },
}

impl<'a> Evaluated<'a> {
    pub fn is_truthy(&self) -> bool {
        match self {
            Evaluated::Val(v) => v.is_truthy(),
            Evaluated::Undefined { .. } => false,
        }
    }

    pub fn is_nullish(&self) -> bool {
        match self {
            Evaluated::Val(v) => v.is_null(),
            Evaluated::Undefined { .. } => true,
        }
    }

    pub fn into_value(self) -> Result<Val<'a>> {
        match self {
            Evaluated::Val(v) => Ok(v),
            Evaluated::Undefined { path } => Err(Error::undefined(path)),
        }
    }
}

/// The dotted form of a plain `a.b.c` lookup chain, `None` for anything
/// else. Outer filters don't matter (they apply afterwards), but a
/// filtered link inside the chain disqualifies it.
fn pure_dotted_path(val: &ExprVal) -> Option<String> {
    match val {
        ExprVal::Ident(name) => Some(name.clone()),
        ExprVal::Getattr { value, attr } => {
            if !value.filters.is_empty() {
                return None;
            }
            Some(format!("{}.{}", pure_dotted_path(&value.val)?, attr))
        }
        _ => None,
    }
}

/// A dotted rendering of an expression for undefined-path messages.
pub(crate) fn expr_path(expr: &Expr) -> String {
    match &expr.val {
        ExprVal::Ident(name) => name.clone(),
        ExprVal::Getattr { value, attr } | ExprVal::OptionalChain { value, attr } => {
            format!("{}.{}", expr_path(value), attr)
        }
        ExprVal::Getitem { value, key } => match &key.val {
            ExprVal::Str(s) => format!("{}.{}", expr_path(value), s),
            ExprVal::Int(i) => format!("{}.{}", expr_path(value), i),
            _ => format!("{}[..]", expr_path(value)),
        },
        _ => "<expression>".to_string(),
    }
}

fn node_pos(node: &Node) -> Option<SourcePos> {
    match node {
        Node::Data(pos, _) | Node::Raw(_, pos, _, _) | Node::Emit(pos, _) => Some(*pos),
        Node::Output(_, expr) | Node::Do(_, expr) => Some(expr.pos),
        Node::Set(_, set) => Some(set.value.pos),
        Node::If(if_node, _) => if_node.conditions.first().map(|(_, cond, _)| cond.pos),
        Node::Forloop(_, forloop, _) => Some(forloop.container.pos),
        Node::While(_, while_loop, _) => Some(while_loop.condition.pos),
        Node::Match(_, match_block, _) => Some(match_block.subject.pos),
        Node::Block(_, block, _) => Some(block.pos),
        Node::Extends(_, pos, _) => Some(*pos),
        Node::Include(_, include) => Some(include.template.pos),
        Node::Import(_, import) => Some(import.template.pos),
        Node::FromImport(_, from) => Some(from.template.pos),
        Node::MacroDefinition(_, def, _) => Some(def.pos),
        Node::CallBlock(_, call_block, _) => Some(call_block.pos),
        Node::Cache(_, cache, _) => Some(cache.key.pos),
        Node::Break(_, pos) | Node::Continue(_, pos) => Some(*pos),
        _ => None,
    }
}

/// Processes the ast and renders the output
pub struct Processor<'a> {
    pub(crate) env: &'a Environment,
    /// The template the user asked to render
    pub(crate) entry: Arc<CompiledTemplate>,
    /// Inheritance chain, most-derived first; always contains `entry`
    pub(crate) chain: Vec<Arc<CompiledTemplate>>,
    pub(crate) call_stack: CallStack<'a>,
    /// Active block renders: name + chain level (`None` = embed override)
    pub(crate) blocks: Vec<(String, Option<usize>)>,
    /// `{% import "..." as ns %}` targets
    macro_namespaces: HashMap<String, Arc<CompiledTemplate>>,
    /// Macros callable without a namespace: own ones and `from`-imports
    local_macros: HashMap<String, (Arc<CompiledTemplate>, String)>,
    /// Template of the macro currently being rendered, for sibling calls
    macro_templates: Vec<Arc<CompiledTemplate>>,
    /// `{% export %}`ed values, collected for importers
    exports: Map<String, Value>,
    /// Block overrides coming from an `{% embed %}` body
    pub(crate) embed_blocks: Option<HashMap<String, Block>>,
    /// Filter/test/function/global registries, snapshotted at render
    /// start so later mutations of the environment never show mid-render
    pub(crate) registries: crate::environment::RegistrySnapshot,
    pub(crate) should_escape: bool,
    pub(crate) render_ctx: RenderContext,
}

impl<'a> Processor<'a> {
    pub fn new(
        env: &'a Environment,
        template: Arc<CompiledTemplate>,
        context: &'a Value,
        should_escape: bool,
    ) -> Self {
        Self::with_depth(env, template, context, should_escape, 0)
    }

    pub(crate) fn with_depth(
        env: &'a Environment,
        template: Arc<CompiledTemplate>,
        context: &'a Value,
        should_escape: bool,
        include_depth: usize,
    ) -> Self {
        let name = template.name.clone().unwrap_or_else(|| "<string>".to_string());
        let mut render_ctx = RenderContext::new(
            template.name.clone(),
            template.filename.clone(),
            env.config().max_include_depth,
        );
        render_ctx.include_depth = include_depth;

        let mut local_macros = HashMap::new();
        for macro_name in template.macros.keys() {
            local_macros.insert(macro_name.clone(), (template.clone(), macro_name.clone()));
        }

        Processor {
            env,
            entry: template.clone(),
            chain: vec![template],
            call_stack: CallStack::new(context, name),
            blocks: Vec::new(),
            macro_namespaces: HashMap::new(),
            local_macros,
            macro_templates: Vec::new(),
            exports: Map::new(),
            embed_blocks: None,
            registries: env.registry_snapshot(),
            should_escape,
            render_ctx,
        }
    }

    pub(crate) fn set_embed_blocks(&mut self, blocks: HashMap<String, Block>) {
        self.embed_blocks = Some(blocks);
    }

    pub(crate) fn template_name(&self) -> String {
        self.entry.name.clone().unwrap_or_else(|| "<string>".to_string())
    }

    pub(crate) fn enhance(&self, error: Error) -> Error {
        error.enhance(&self.template_name(), self.render_ctx.line)
    }

    /// Follows `{% extends %}` tags until the root template, guarded by
    /// the include depth.
    pub(crate) fn resolve_chain(&mut self) -> Result<()> {
        loop {
            let current = self.chain.last().expect("chain is never empty").clone();
            let Some(ref extends) = current.extends else { break };

            self.render_ctx.enter_include()?;
            let parent_name = self.safe_eval_expression(extends)?;
            let parent_name = match parent_name.as_ref() {
                Value::String(s) => s.clone(),
                other => {
                    return Err(Error::runtime(format!(
                        "`{{% extends %}}` expects a template name string, got `{}`",
                        other.render()
                    )));
                }
            };
            let parent = self.env.get_template(&parent_name)?;

            // macros of ancestors are callable too; the child wins ties
            for macro_name in parent.macros.keys() {
                self.local_macros
                    .entry(macro_name.clone())
                    .or_insert_with(|| (parent.clone(), macro_name.clone()));
            }
            self.chain.push(parent);
        }
        Ok(())
    }

    /// Full render of the template, inheritance resolved.
    pub fn render(&mut self) -> Result<String> {
        self.resolve_chain().map_err(|e| self.enhance(e))?;
        let root = self.chain.last().expect("chain is never empty").clone();
        let mut output = String::with_capacity(utils::buffer_capacity(root.ast.len()));
        self.render_body(&root.ast, &mut output).map_err(|e| self.enhance(e))?;
        Ok(output)
    }

    /// The top-level statements of the resolved root, for streaming.
    pub(crate) fn root_template(&self) -> Arc<CompiledTemplate> {
        self.chain.last().expect("chain is never empty").clone()
    }

    /// Renders one top-level statement, for streaming drivers.
    pub(crate) fn render_top_node(&mut self, node: &Node) -> Result<String> {
        let mut chunk = String::new();
        self.render_node(node, &mut chunk).map_err(|e| self.enhance(e))?;
        Ok(chunk)
    }

    pub(crate) fn take_exports(&mut self) -> Map<String, Value> {
        std::mem::take(&mut self.exports)
    }

    pub(crate) fn record_export(&mut self, key: String, value: Value) {
        self.exports.insert(key, value);
    }

    pub(crate) fn push_macro_template(&mut self, template: Arc<CompiledTemplate>) {
        self.macro_templates.push(template);
    }

    pub(crate) fn pop_macro_template(&mut self) {
        self.macro_templates.pop();
    }

    pub(crate) fn render_body(&mut self, body: &[Node], output: &mut String) -> Result<()> {
        for node in body {
            self.render_node(node, output)?;
            if self.call_stack.should_break_body() {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn render_body_to_string(&mut self, body: &[Node]) -> Result<String> {
        let mut buffer = String::with_capacity(utils::buffer_capacity(body.len()));
        self.render_body(body, &mut buffer)?;
        Ok(buffer)
    }

    pub(crate) fn render_node(&mut self, node: &Node, output: &mut String) -> Result<()> {
        if let Some(pos) = node_pos(node) {
            self.render_ctx.line = pos.line;
            crate::renderer::context::with_current(|ctx| ctx.line = pos.line);
        }

        match node {
            Node::Data(_, text) | Node::Raw(_, _, text, _) => output.push_str(text),
            Node::Output(_, expr) => {
                let value = self.safe_eval_expression(expr)?;
                self.write_value(&value, output);
            }
            Node::Emit(_, parts) => {
                for part in parts {
                    match part {
                        EmitPart::Text(text) => output.push_str(text),
                        EmitPart::Expr(expr) => {
                            let value = self.safe_eval_expression(expr)?;
                            self.write_value(&value, output);
                        }
                    }
                }
            }
            Node::Super => self.render_super(output)?,
            Node::If(if_node, _) => self.render_if_node(if_node, output)?,
            Node::Forloop(_, forloop, _) => {
                if forloop.is_async {
                    return Err(Error::runtime(
                        "This template uses `{% async for %}`: render it with `render_stream_async`",
                    ));
                }
                self.render_for_loop(forloop, output)?;
            }
            Node::While(_, while_loop, _) => self.render_while_loop(while_loop, output)?,
            Node::Match(_, match_block, _) => self.render_match(match_block, output)?,
            Node::Set(_, set) => self.render_set(set)?,
            Node::Block(_, block, _) => self.render_block_by_name(&block.name, output)?,
            // handled during chain resolution
            Node::Extends(..) => (),
            Node::Include(_, include) => self.render_include(include, output)?,
            Node::Import(_, import) => self.render_import(import)?,
            Node::FromImport(_, from) => self.render_from_import(from)?,
            Node::With(_, with, _) => {
                let mut frame = StackFrame::new(FrameType::With, "with");
                for (name, expr) in &with.assignments {
                    let value = self.safe_eval_expression(expr)?;
                    frame.insert(name.clone(), value);
                }
                self.call_stack.push_frame(frame);
                let result = self.render_body(&with.body, output);
                self.call_stack.pop();
                result?;
            }
            Node::Do(_, expr) => {
                // evaluate for effects; an unresolved name is fine here
                let _ = self.eval_expression(expr)?;
            }
            // collected into the macro table at compile time
            Node::MacroDefinition(..) => (),
            Node::CallBlock(_, call_block, _) => {
                let caller = self.render_body_to_string(&call_block.body)?;
                let rendered =
                    self.eval_function_call(&call_block.call, call_block.pos, Some(caller))?;
                let value = rendered.into_value()?;
                self.write_value(&value, output);
            }
            Node::Capture(_, capture, _) => {
                let rendered = self.render_body_to_string(&capture.body)?;
                self.call_stack
                    .insert_local(capture.name.clone(), Cow::Owned(Value::String(rendered)));
            }
            Node::Cache(_, cache, _) => self.render_cache_block(cache, output)?,
            Node::FilterSection(_, section, _) => {
                let body = self.render_body_to_string(&section.body)?;
                let mut value = Evaluated::Val(Cow::Owned(Value::String(body)));
                value = self.apply_filters(value, &section.filters)?;
                output.push_str(value.into_value()?.render().as_ref());
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
                        let result = self.render_body(&block.body, output);
                        self.blocks.pop();
                        result?;
                    }
                    None => self.render_body(&slot.default_body, output)?,
                }
            }
            Node::Embed(_, embed, _) => self.render_embed(embed, output)?,
            Node::Spaceless(_, body, _) => {
                let rendered = self.render_body_to_string(body)?;
                output.push_str(&utils::spaceless(&rendered));
            }
            Node::Break(..) => self.call_stack.break_loop()?,
            Node::Continue(..) => self.call_stack.continue_loop()?,
            Node::Comment(..) => (),
        }

        Ok(())
    }

    /// Appends a value to the output, escaping unless the value is exempt.
    pub(crate) fn write_value(&self, value: &Val, output: &mut String) {
        if let Some(safe) = utils::as_safe_string(value) {
            output.push_str(safe);
            return;
        }
        // numbers and bools cannot contain HTML special characters
        if !self.should_escape || ops::escape_exempt(value) {
            output.push_str(value.render().as_ref());
            return;
        }
        output.push_str(&(self.env.escape_fn())(value.render().as_ref()));
    }

    fn render_if_node(&mut self, if_node: &If, output: &mut String) -> Result<()> {
        for (_, expr, body) in &if_node.conditions {
            if self.eval_as_bool(expr)? {
                return self.render_body(body, output);
            }
        }

        if let Some((_, ref body)) = if_node.otherwise {
            return self.render_body(body, output);
        }

        Ok(())
    }

    fn render_for_loop(&mut self, forloop: &Forloop, output: &mut String) -> Result<()> {
        let container = self.safe_eval_expression(&forloop.container)?;
        let mut for_loop = self.build_for_loop(forloop, container)?;
        for_loop.exposes_loop = forloop.uses_loop;
        if forloop.recursive {
            for_loop.recursive_node = Some(Arc::new(forloop.clone()));
        }

        if for_loop.is_empty() {
            if let Some(ref empty_body) = forloop.empty_body {
                return self.render_body(empty_body, output);
            }
            return Ok(());
        }

        self.run_for_loop(for_loop, &forloop.body, output)
    }

    /// Materializes the loop values, applying the inline `if` filter.
    pub(crate) fn build_for_loop(
        &mut self,
        forloop: &Forloop,
        container: Val<'a>,
    ) -> Result<ForLoop<'a>> {
        let container_name = expr_path(&forloop.container);

        let mut for_loop = match container.as_ref() {
            Value::Array(_) => {
                if forloop.key.is_some() {
                    return Err(Error::runtime(format!(
                        "Tried to iterate using key value on variable `{}`, but it isn't an object",
                        container_name,
                    )));
                }
                ForLoop::from_array(&forloop.value, container)
            }
            Value::Object(_) => {
                let Some(ref key) = forloop.key else {
                    return Err(Error::runtime(format!(
                        "Tried to iterate on variable `{}` which is an object: use `{{% for key, value in {} %}}`",
                        container_name, container_name,
                    )));
                };
                ForLoop::from_object(key, &forloop.value, container)
            }
            _ => {
                return Err(Error::runtime(format!(
                    "Tried to iterate on a container (`{}`) that has an unsupported type",
                    container_name,
                )));
            }
        };

        if let Some(ref condition) = forloop.condition {
            for_loop = self.filter_loop_values(for_loop, forloop, condition)?;
        }
        Ok(for_loop)
    }

    /// Applies the `{% for x in xs if cond %}` filter before iteration.
    fn filter_loop_values(
        &mut self,
        for_loop: ForLoop<'a>,
        forloop: &Forloop,
        condition: &Expr,
    ) -> Result<ForLoop<'a>> {
        use crate::renderer::for_loop::ForLoopValues;

        let ForLoop { key_name, value_name, values, .. } = for_loop;
        let filtered = match values {
            ForLoopValues::Array(items) => {
                let mut kept = Vec::with_capacity(items.len());
                for item in items {
                    if self.loop_condition_holds(forloop, None, &item, condition)? {
                        kept.push(item);
                    }
                }
                ForLoopValues::Array(kept)
            }
            ForLoopValues::KeyValue(items) => {
                let mut kept = Vec::with_capacity(items.len());
                for (key, item) in items {
                    if self.loop_condition_holds(forloop, Some(&key), &item, condition)? {
                        kept.push((key, item));
                    }
                }
                ForLoopValues::KeyValue(kept)
            }
            ForLoopValues::None => ForLoopValues::None,
        };

        let mut rebuilt = ForLoop {
            key_name,
            value_name,
            current: 0,
            values: filtered,
            state: crate::renderer::for_loop::ForLoopState::Normal,
            depth: 0,
            len_known: true,
            exposes_loop: true,
            recursive_node: None,
        };
        rebuilt.exposes_loop = forloop.uses_loop;
        Ok(rebuilt)
    }

    fn loop_condition_holds(
        &mut self,
        forloop: &Forloop,
        key: Option<&str>,
        item: &Val<'a>,
        condition: &Expr,
    ) -> Result<bool> {
        let mut frame = StackFrame::new(FrameType::With, "loop-filter");
        frame.insert(forloop.value.clone(), item.clone());
        if let (Some(key_name), Some(key)) = (&forloop.key, key) {
            frame.insert(key_name.clone(), Cow::Owned(Value::String(key.to_string())));
        }
        self.call_stack.push_frame(frame);
        let result = self.eval_as_bool(condition);
        self.call_stack.pop();
        result
    }

    fn run_for_loop(
        &mut self,
        for_loop: ForLoop<'a>,
        body: &[Node],
        output: &mut String,
    ) -> Result<()> {
        let len = for_loop.len();
        let value_name = for_loop.value_name.clone();
        self.call_stack.push_for_loop_frame(value_name, for_loop);

        for _ in 0..len {
            let result = self.render_body(body, output);
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
        Ok(())
    }

    fn render_while_loop(&mut self, while_loop: &WhileLoop, output: &mut String) -> Result<()> {
        self.call_stack.push_for_loop_frame("while", ForLoop::for_while());

        loop {
            let keep_going = match self.eval_as_bool(&while_loop.condition) {
                Ok(b) => b,
                Err(e) => {
                    self.call_stack.pop();
                    return Err(e);
                }
            };
            if !keep_going {
                break;
            }

            let result = self.render_body(&while_loop.body, output);
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
        Ok(())
    }

    fn render_match(&mut self, match_block: &Match, output: &mut String) -> Result<()> {
        let subject = self.safe_eval_expression(&match_block.subject)?;

        for case in &match_block.cases {
            let matched = match &case.pattern {
                CasePattern::Wildcard => true,
                CasePattern::Literal(expr) => {
                    let literal = expr
                        .as_literal()
                        .expect("case patterns are literals by construction");
                    ops::values_equal(subject.as_ref(), &literal)
                }
            };
            if !matched {
                continue;
            }
            if let Some(ref guard) = case.guard {
                if !self.eval_as_bool(guard)? {
                    continue;
                }
            }
            return self.render_body(&case.body, output);
        }

        Ok(())
    }

    pub(crate) fn render_set(&mut self, set: &Set) -> Result<()> {
        let value = self.safe_eval_expression(&set.value)?;
        match set.scope {
            SetScope::Local => self.call_stack.insert_local(set.key.clone(), value),
            SetScope::Leak => self.call_stack.insert_leaking(set.key.clone(), value),
            SetScope::Export => {
                self.exports.insert(set.key.clone(), value.clone().into_owned());
                self.call_stack.insert_local(set.key.clone(), value);
            }
        }
        Ok(())
    }

    /// Renders the definition of `name` closest to the most-derived
    /// template, honoring embed overrides.
    fn render_block_by_name(&mut self, name: &str, output: &mut String) -> Result<()> {
        if let Some(block) = self.embed_blocks.as_ref().and_then(|blocks| blocks.get(name)) {
            let block = block.clone();
            self.blocks.push((name.to_string(), None));
            let result = self.render_body(&block.body, output);
            self.blocks.pop();
            return result;
        }

        for (level, template) in self.chain.clone().iter().enumerate() {
            if let Some(block) = template.blocks.get(name) {
                // finding the `required` definition itself means nothing
                // more derived overrode it
                if block.required {
                    return Err(Error::runtime(format!(
                        "Block `{}` is required but no child template overrides it",
                        name
                    )));
                }
                let block = block.clone();
                self.blocks.push((name.to_string(), Some(level)));
                let result = self.render_body(&block.body, output);
                self.blocks.pop();
                return result;
            }
        }

        // a block that exists nowhere renders nothing
        Ok(())
    }

    /// `{{ super() }}`: renders the next definition up the chain of the
    /// block currently being rendered.
    fn render_super(&mut self, output: &mut String) -> Result<()> {
        let Some((name, level)) = self.blocks.last().cloned() else {
            return Err(Error::runtime("`super()` can only be used inside a block"));
        };

        let search_from = match level {
            Some(level) => level + 1,
            // an embed override's super is the embedded template's own
            None => 0,
        };

        for (level, template) in self.chain.clone().iter().enumerate().skip(search_from) {
            if let Some(block) = template.blocks.get(&name) {
                let block = block.clone();
                self.blocks.push((name.clone(), Some(level)));
                let result = self.render_body(&block.body, output);
                self.blocks.pop();
                return result;
            }
        }

        Err(Error::runtime(format!(
            "Tried to use `super()` in block `{}` but there is no parent block",
            name
        )))
    }

    fn render_include(&mut self, include: &Include, output: &mut String) -> Result<()> {
        let name = self.eval_template_name(&include.template)?;

        let template = match self.env.get_template(&name) {
            Ok(template) => template,
            Err(error) => {
                if include.ignore_missing
                    && matches!(error.kind, ErrorKind::TemplateNotFound(_))
                {
                    return Ok(());
                }
                return Err(error);
            }
        };

        self.render_ctx.enter_include()?;
        let rendered = if include.with_context {
            let bindings = self.call_stack_bindings();
            if bindings.is_empty() {
                let mut sub = Processor::with_depth(
                    self.env,
                    template,
                    self.call_stack.user_context(),
                    self.should_escape,
                    self.render_ctx.include_depth,
                );
                sub.render()
            } else {
                let merged = self.merged_context(bindings);
                let mut sub = Processor::with_depth(
                    self.env,
                    template,
                    &merged,
                    self.should_escape,
                    self.render_ctx.include_depth,
                );
                sub.render()
            }
        } else {
            let mut sub = Processor::with_depth(
                self.env,
                template,
                &EMPTY_CONTEXT,
                self.should_escape,
                self.render_ctx.include_depth,
            );
            sub.render()
        };
        self.render_ctx.leave_include();

        output.push_str(&rendered?);
        Ok(())
    }

    /// Current frame bindings visible at this point, owned.
    pub(crate) fn call_stack_bindings(&self) -> HashMap<String, Value> {
        self.call_stack.collect_bindings()
    }

    pub(crate) fn merged_context(&self, bindings: HashMap<String, Value>) -> Value {
        let mut merged = match self.call_stack.user_context() {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        for (key, value) in bindings {
            merged.insert(key, value);
        }
        Value::Object(merged)
    }

    pub(crate) fn eval_template_name(&mut self, expr: &Expr) -> Result<String> {
        let value = self.safe_eval_expression(expr)?;
        match value.as_ref() {
            Value::String(s) => Ok(s.clone()),
            other => Err(Error::runtime(format!(
                "Expected a template name string, got `{}`",
                other.render()
            ))),
        }
    }

    fn render_import(&mut self, import: &Import) -> Result<()> {
        let name = self.eval_template_name(&import.template)?;
        let template = self.env.get_template(&name)?;

        self.render_ctx.enter_include()?;
        // imports execute the module body for its exports, output is
        // discarded
        let mut sub = Processor::with_depth(
            self.env,
            template.clone(),
            &EMPTY_CONTEXT,
            self.should_escape,
            self.render_ctx.include_depth,
        );
        let rendered = sub.render();
        self.render_ctx.leave_include();
        rendered?;

        let exports = sub.take_exports();
        self.macro_namespaces.insert(import.target.clone(), template);
        self.call_stack
            .insert_local(import.target.clone(), Cow::Owned(Value::Object(exports)));
        Ok(())
    }

    fn render_from_import(&mut self, from: &FromImport) -> Result<()> {
        let name = self.eval_template_name(&from.template)?;
        let template = self.env.get_template(&name)?;

        self.render_ctx.enter_include()?;
        let mut sub = Processor::with_depth(
            self.env,
            template.clone(),
            &EMPTY_CONTEXT,
            self.should_escape,
            self.render_ctx.include_depth,
        );
        let rendered = sub.render();
        self.render_ctx.leave_include();
        rendered?;
        let exports = sub.take_exports();

        for (imported, alias) in &from.names {
            let local = alias.clone().unwrap_or_else(|| imported.clone());
            if template.macros.contains_key(imported) {
                self.local_macros.insert(local, (template.clone(), imported.clone()));
            } else if let Some(value) = exports.get(imported) {
                self.call_stack.insert_local(local, Cow::Owned(value.clone()));
            } else {
                return Err(Error::runtime(format!(
                    "Template `{}` has no macro or export named `{}`",
                    name, imported
                )));
            }
        }
        Ok(())
    }

    fn render_embed(&mut self, embed: &Embed, output: &mut String) -> Result<()> {
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
        let rendered = sub.render();
        self.render_ctx.leave_include();

        output.push_str(&rendered?);
        Ok(())
    }

    fn render_cache_block(&mut self, cache: &CacheBlock, output: &mut String) -> Result<()> {
        let Some(fragment_cache) = self.env.fragment_cache() else {
            return self.render_body(&cache.body, output);
        };

        let key_value = self.safe_eval_expression(&cache.key)?;
        let region = self
            .blocks
            .last()
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| cache.index.to_string());
        let full_key =
            format!("{}:{}:{}", self.template_name(), region, key_value.render());

        if let Some(hit) = fragment_cache.get(&full_key) {
            self.render_ctx.cache_stats.hits += 1;
            crate::renderer::context::with_current(|ctx| ctx.cache_stats.hits += 1);
            output.push_str(&hit);
            return Ok(());
        }
        self.render_ctx.cache_stats.misses += 1;
        crate::renderer::context::with_current(|ctx| ctx.cache_stats.misses += 1);

        let ttl = match &cache.ttl {
            Some(expr) => {
                let value = self.safe_eval_expression(expr)?;
                let seconds = value.as_f64().ok_or_else(|| {
                    Error::runtime(format!(
                        "`{{% cache %}}` ttl must be a number of seconds, got `{}`",
                        value.render()
                    ))
                })?;
                Some(Duration::from_secs_f64(seconds))
            }
            None => None,
        };

        let rendered = self.render_body_to_string(&cache.body)?;
        fragment_cache.store(&full_key, rendered.clone(), ttl);
        output.push_str(&rendered);
        Ok(())
    }

    // ---- expression evaluation ----

    pub(crate) fn safe_eval_expression(&mut self, expr: &Expr) -> Result<Val<'a>> {
        match self.eval_expression(expr)? {
            Evaluated::Val(v) => Ok(v),
            Evaluated::Undefined { path } => Err(Error::undefined(path)),
        }
    }

    pub(crate) fn eval_as_bool(&mut self, expr: &Expr) -> Result<bool> {
        Ok(self.eval_expression(expr)?.is_truthy())
    }

    pub(crate) fn eval_expression(&mut self, expr: &Expr) -> Result<Evaluated<'a>> {
        let base = self.eval_expr_val(expr)?;
        self.apply_filters(base, &expr.filters)
    }

    fn eval_expr_val(&mut self, expr: &Expr) -> Result<Evaluated<'a>> {
        let evaluated = match &expr.val {
            ExprVal::Str(s) => Evaluated::Val(Cow::Owned(Value::String(s.clone()))),
            ExprVal::Int(i) => Evaluated::Val(Cow::Owned(Value::from(*i))),
            ExprVal::Float(f) => Evaluated::Val(Cow::Owned(
                serde_json::Number::from_f64(*f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            ExprVal::Bool(b) => Evaluated::Val(Cow::Owned(Value::Bool(*b))),
            ExprVal::Null => Evaluated::Val(Cow::Owned(Value::Null)),
            ExprVal::Ident(name) => self.lookup_ident(name)?,
            ExprVal::List(items) | ExprVal::Tuple(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.safe_eval_expression(item)?.into_owned());
                }
                Evaluated::Val(Cow::Owned(Value::Array(values)))
            }
            ExprVal::SetLiteral(items) => {
                let mut values: Vec<Value> = Vec::with_capacity(items.len());
                for item in items {
                    let value = self.safe_eval_expression(item)?.into_owned();
                    if !values.iter().any(|seen| ops::values_equal(seen, &value)) {
                        values.push(value);
                    }
                }
                Evaluated::Val(Cow::Owned(Value::Array(values)))
            }
            ExprVal::Dict(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (key, value) in entries {
                    let key = self.safe_eval_expression(key)?;
                    let key = match key.as_ref() {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        other => {
                            return Err(Error::runtime(format!(
                                "Dict keys must be strings or numbers, got `{}`",
                                other.render()
                            )));
                        }
                    };
                    map.insert(key, self.safe_eval_expression(value)?.into_owned());
                }
                Evaluated::Val(Cow::Owned(Value::Object(map)))
            }
            ExprVal::Getattr { value, attr } => {
                // dotted frame lookups come first: `loop.index` and loop
                // variables have no standalone object to subscript into
                if let Some(path) = pure_dotted_path(&expr.val) {
                    if let Some(found) = self.call_stack.lookup(&path)? {
                        return Ok(Evaluated::Val(found));
                    }
                }
                match self.eval_expression(value)? {
                    Evaluated::Val(base) => self.subscript(base, attr, expr),
                    Evaluated::Undefined { path } => {
                        Evaluated::Undefined { path: format!("{}.{}", path, attr) }
                    }
                }
            }
            ExprVal::Getitem { value, key } => {
                let key_value = self.safe_eval_expression(key)?;
                match self.eval_expression(value)? {
                    Evaluated::Val(base) => match key_value.as_ref() {
                        Value::String(s) => self.subscript(base, s, expr),
                        Value::Number(n) => match n.as_i64() {
                            Some(index) => self.index(base, index, expr),
                            None => {
                                return Err(Error::runtime(
                                    "Subscript indexes must be integers",
                                ));
                            }
                        },
                        other => {
                            return Err(Error::runtime(format!(
                                "Subscript keys must be strings or integers, got `{}`",
                                other.render()
                            )));
                        }
                    },
                    undefined => undefined,
                }
            }
            ExprVal::Slice { value, lower, upper, step } => {
                let base = self.safe_eval_expression(value)?;
                let lower = self.eval_optional(lower)?;
                let upper = self.eval_optional(upper)?;
                let step = self.eval_optional(step)?;
                Evaluated::Val(Cow::Owned(ops::apply_slice(
                    base.as_ref(),
                    lower.as_ref(),
                    upper.as_ref(),
                    step.as_ref(),
                )?))
            }
            ExprVal::OptionalChain { value, attr } => {
                let base = self.eval_expression(value)?;
                if base.is_nullish() {
                    Evaluated::Undefined { path: expr_path(expr) }
                } else {
                    let base = base.into_value()?;
                    self.subscript(base, attr, expr)
                }
            }
            ExprVal::Math(math) => {
                let lhs = self.safe_eval_expression(&math.lhs)?;
                let rhs = self.safe_eval_expression(&math.rhs)?;
                Evaluated::Val(Cow::Owned(ops::apply_math(
                    math.operator,
                    lhs.as_ref(),
                    rhs.as_ref(),
                )?))
            }
            ExprVal::Logic(logic) => {
                let result = match logic.operator {
                    LogicOperator::And => {
                        self.eval_as_bool(&logic.lhs)? && self.eval_as_bool(&logic.rhs)?
                    }
                    LogicOperator::Or => {
                        self.eval_as_bool(&logic.lhs)? || self.eval_as_bool(&logic.rhs)?
                    }
                };
                Evaluated::Val(Cow::Owned(Value::Bool(result)))
            }
            ExprVal::Compare(compare) => {
                let mut prev = self.safe_eval_expression(&compare.lhs)?;
                let mut result = true;
                for (op, rhs) in &compare.comparisons {
                    let next = self.safe_eval_expression(rhs)?;
                    result = result && ops::apply_compare(*op, prev.as_ref(), next.as_ref())?;
                    if !result {
                        break;
                    }
                    prev = next;
                }
                Evaluated::Val(Cow::Owned(Value::Bool(result)))
            }
            ExprVal::Not(inner) => {
                Evaluated::Val(Cow::Owned(Value::Bool(!self.eval_as_bool(inner)?)))
            }
            ExprVal::Concat { left, right } => {
                let lhs = self.safe_eval_expression(left)?;
                let rhs = self.safe_eval_expression(right)?;
                Evaluated::Val(Cow::Owned(ops::concat_values(lhs.as_ref(), rhs.as_ref())?))
            }
            ExprVal::Range { start, end } => {
                let start = self.safe_eval_expression(start)?;
                let end = self.safe_eval_expression(end)?;
                Evaluated::Val(Cow::Owned(ops::expand_range(start.as_ref(), end.as_ref())?))
            }
            ExprVal::NullCoalesce { left, right } => {
                let lhs = self.eval_expression(left)?;
                if lhs.is_nullish() {
                    self.eval_expression(right)?
                } else {
                    lhs
                }
            }
            ExprVal::Conditional { test, if_true, if_false } => {
                if self.eval_as_bool(test)? {
                    self.eval_expression(if_true)?
                } else {
                    match if_false {
                        Some(e) => self.eval_expression(e)?,
                        None => Evaluated::Undefined { path: "<conditional>".to_string() },
                    }
                }
            }
            ExprVal::Test(test) => {
                let value = match self.eval_expression(&test.expr)? {
                    Evaluated::Val(v) => Some(v.into_owned()),
                    Evaluated::Undefined { .. } => None,
                };
                let mut args = Vec::with_capacity(test.args.len());
                for arg in &test.args {
                    args.push(self.safe_eval_expression(arg)?.into_owned());
                }
                let tester = self.registries.test(&test.name)?;
                let mut result = tester.test(value.as_ref(), &args)?;
                if test.negated {
                    result = !result;
                }
                Evaluated::Val(Cow::Owned(Value::Bool(result)))
            }
            ExprVal::FunctionCall(call) => {
                self.eval_function_call(call, expr.pos, None)?
            }
            ExprVal::Await(_) => {
                return Err(Error::runtime(
                    "`await` is only available in async renders: use `render_stream_async`",
                ));
            }
        };
        Ok(evaluated)
    }

    fn eval_optional(&mut self, expr: &Option<Box<Expr>>) -> Result<Option<Value>> {
        match expr {
            Some(e) => Ok(Some(self.safe_eval_expression(e)?.into_owned())),
            None => Ok(None),
        }
    }

    fn lookup_ident(&mut self, name: &str) -> Result<Evaluated<'a>> {
        if name == MAGICAL_DUMP_VAR {
            return Ok(Evaluated::Val(Cow::Owned(Value::String(
                to_string_pretty(self.call_stack.user_context()).map_err(Error::json)?,
            ))));
        }

        if let Some(found) = self.call_stack.lookup(name)? {
            return Ok(Evaluated::Val(found));
        }
        if let Some(global) = self.registries.global(name) {
            return Ok(Evaluated::Val(Cow::Owned(global)));
        }
        Ok(Evaluated::Undefined { path: name.to_string() })
    }

    /// `a.b` semantics: subscript lookup first, index fallback for
    /// arrays, undefined when both miss.
    fn subscript(&self, base: Val<'a>, key: &str, expr: &Expr) -> Evaluated<'a> {
        let found = match base {
            Cow::Borrowed(Value::Object(map)) => map.get(key).map(Cow::Borrowed),
            Cow::Owned(Value::Object(ref map)) => map.get(key).cloned().map(Cow::Owned),
            Cow::Borrowed(Value::Array(items)) => {
                key.parse::<usize>().ok().and_then(|i| items.get(i)).map(Cow::Borrowed)
            }
            Cow::Owned(Value::Array(ref items)) => {
                key.parse::<usize>().ok().and_then(|i| items.get(i).cloned()).map(Cow::Owned)
            }
            _ => None,
        };
        match found {
            Some(value) => Evaluated::Val(value),
            None => Evaluated::Undefined { path: expr_path(expr) },
        }
    }

    fn index(&self, base: Val<'a>, index: i64, expr: &Expr) -> Evaluated<'a> {
        fn resolve(len: usize, index: i64) -> Option<usize> {
            if index < 0 {
                let from_end = len as i64 + index;
                usize::try_from(from_end).ok()
            } else {
                Some(index as usize)
            }
        }

        let found = match base {
            Cow::Borrowed(Value::Array(items)) => {
                resolve(items.len(), index).and_then(|i| items.get(i)).map(Cow::Borrowed)
            }
            Cow::Owned(Value::Array(ref items)) => resolve(items.len(), index)
                .and_then(|i| items.get(i).cloned())
                .map(Cow::Owned),
            Cow::Borrowed(Value::Object(map)) => {
                map.get(&index.to_string()).map(Cow::Borrowed)
            }
            Cow::Owned(Value::Object(ref map)) => {
                map.get(&index.to_string()).cloned().map(Cow::Owned)
            }
            _ => None,
        };
        match found {
            Some(value) => Evaluated::Val(value),
            None => Evaluated::Undefined { path: expr_path(expr) },
        }
    }

    pub(crate) fn apply_filters(
        &mut self,
        value: Evaluated<'a>,
        filters: &[FilterCall],
    ) -> Result<Evaluated<'a>> {
        if filters.is_empty() {
            return Ok(value);
        }

        let mut remaining = filters;
        let mut current: Val<'a> = match value {
            Evaluated::Val(v) => v,
            Evaluated::Undefined { path } => {
                // only `default` rescues an undefined value
                match filters.first() {
                    Some(f) if f.name == "default" || f.name == "d" => {
                        let fallback = f
                            .args
                            .first()
                            .or_else(|| f.kwargs.get("value"))
                            .ok_or_else(|| {
                                Error::msg("Filter `default` expected an arg called `value`")
                            })?;
                        let fallback = self.safe_eval_expression(fallback)?;
                        remaining = &filters[1..];
                        fallback
                    }
                    _ => return Err(Error::undefined(path)),
                }
            }
        };

        for filter_call in remaining {
            let mut args = Vec::with_capacity(filter_call.args.len());
            for arg in &filter_call.args {
                args.push(self.safe_eval_expression(arg)?.into_owned());
            }
            let mut kwargs = HashMap::with_capacity(filter_call.kwargs.len());
            for (key, arg) in &filter_call.kwargs {
                kwargs.insert(key.clone(), self.safe_eval_expression(arg)?.into_owned());
            }

            let filter = self.registries.filter(&filter_call.name)?;
            current = Cow::Owned(filter.filter(current.as_ref(), &args, &kwargs)?);
        }

        Ok(Evaluated::Val(current))
    }

    pub(crate) fn eval_function_call(
        &mut self,
        call: &FunctionCall,
        pos: SourcePos,
        caller: Option<String>,
    ) -> Result<Evaluated<'a>> {
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            args.push(self.safe_eval_expression(arg)?.into_owned());
        }
        let mut kwargs = HashMap::with_capacity(call.kwargs.len());
        for (key, arg) in &call.kwargs {
            kwargs.insert(key.clone(), self.safe_eval_expression(arg)?.into_owned());
        }
        self.dispatch_call(call, pos, args, kwargs, caller, false)
    }

    /// Dispatches a call whose arguments are already evaluated. Macro
    /// targets come back as `CallTarget::Macro` when `defer_macros` is
    /// set, so the async renderer can render their bodies itself.
    pub(crate) fn dispatch_call(
        &mut self,
        call: &FunctionCall,
        pos: SourcePos,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        caller: Option<String>,
        defer_macros: bool,
    ) -> Result<Evaluated<'a>> {
        let _ = pos;
        match self.resolve_call_target(call)? {
            CallTarget::LoopCycle => self.eval_loop_cycle(args),
            CallTarget::LoopRecursion => self.eval_loop_recursion(args),
            CallTarget::Caller => {
                if let Some(found) = self.call_stack.lookup("caller")? {
                    return Ok(Evaluated::Val(found));
                }
                Err(Error::runtime(
                    "`caller()` can only be used inside a macro invoked by `{% call %}`",
                ))
            }
            CallTarget::Macro(template, macro_name) => {
                debug_assert!(!defer_macros, "deferred macro calls are dispatched by the caller");
                let rendered = self.call_macro(template, &macro_name, args, kwargs, caller)?;
                Ok(Evaluated::Val(Cow::Owned(utils::mark_safe(rendered))))
            }
            CallTarget::Function(function) => {
                if !args.is_empty() {
                    return Err(Error::runtime(format!(
                        "Function `{}` takes keyword arguments only",
                        call.name
                    )));
                }
                let is_safe = function.is_safe();
                let result = function.call(&kwargs)?;
                Ok(Evaluated::Val(Cow::Owned(if is_safe {
                    match result {
                        Value::String(s) => utils::mark_safe(s),
                        other => other,
                    }
                } else {
                    result
                })))
            }
        }
    }

    /// Resolves what a call refers to, without evaluating anything.
    pub(crate) fn resolve_call_target(&self, call: &FunctionCall) -> Result<CallTarget> {
        if call.namespace.as_deref() == Some("loop") && call.name == "cycle" {
            return Ok(CallTarget::LoopCycle);
        }
        if call.namespace.is_none() && call.name == "loop" {
            return Ok(CallTarget::LoopRecursion);
        }
        if call.namespace.is_none() && call.name == "caller" {
            return Ok(CallTarget::Caller);
        }

        if let Some(ref namespace) = call.namespace {
            let template = self
                .macro_namespaces
                .get(namespace)
                .cloned()
                .ok_or_else(|| {
                    Error::macro_not_found(format!("{}.{}", namespace, call.name))
                })?;
            return Ok(CallTarget::Macro(template, call.name.clone()));
        }

        // a macro defined in the template of the macro being rendered
        if let Some(current) = self.macro_templates.last() {
            if current.macros.contains_key(&call.name) {
                return Ok(CallTarget::Macro(current.clone(), call.name.clone()));
            }
        }

        if let Some((template, macro_name)) = self.local_macros.get(&call.name).cloned() {
            return Ok(CallTarget::Macro(template, macro_name));
        }

        if let Ok(function) = self.registries.function(&call.name) {
            return Ok(CallTarget::Function(function));
        }

        if self.registries.has_async_function(&call.name) {
            return Err(Error::runtime(format!(
                "Function `{}` is async: `await` it in an async render",
                call.name
            )));
        }

        Err(Error::function_not_found(&call.name))
    }

    fn eval_loop_cycle(&mut self, args: Vec<Value>) -> Result<Evaluated<'a>> {
        if args.is_empty() {
            return Err(Error::runtime("`loop.cycle` needs at least one argument"));
        }

        let current = self.current_loop_index()?;
        Ok(Evaluated::Val(Cow::Owned(args[current % args.len()].clone())))
    }

    fn current_loop_index(&mut self) -> Result<usize> {
        // reuse the frame lookup so macro isolation applies
        match self.call_stack.lookup("loop.index0")? {
            Some(v) => Ok(v.as_u64().unwrap_or(0) as usize),
            None => Err(Error::runtime("`loop.cycle` can only be used inside a loop")),
        }
    }

    fn eval_loop_recursion(&mut self, args: Vec<Value>) -> Result<Evaluated<'a>> {
        let recursive_node = self.call_stack.current_recursive_node().ok_or_else(|| {
            Error::runtime("`loop(...)` recursion needs a `{% for ... recursive %}` loop")
        })?;
        let container: Val<'a> = Cow::Owned(
            args.into_iter()
                .next()
                .ok_or_else(|| Error::runtime("`loop(...)` needs the iterable to recurse on"))?,
        );
        let depth = self.call_stack.current_loop_depth() + 1;

        let mut for_loop = self.build_for_loop(recursive_node.as_ref(), container)?;
        for_loop.exposes_loop = true;
        for_loop.depth = depth;
        for_loop.recursive_node = Some(recursive_node.clone());

        let mut output = String::new();
        if !for_loop.is_empty() {
            self.run_for_loop(for_loop, &recursive_node.body, &mut output)?;
        }
        Ok(Evaluated::Val(Cow::Owned(utils::mark_safe(output))))
    }

    pub(crate) fn call_macro(
        &mut self,
        template: Arc<CompiledTemplate>,
        macro_name: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        caller: Option<String>,
    ) -> Result<String> {
        let def = self.bind_macro_frame(&template, macro_name, args, kwargs, caller)?;
        self.macro_templates.push(template);
        let result = self.render_body_to_string(&def.body);
        self.macro_templates.pop();
        self.call_stack.pop();

        result
    }

    /// Binds macro parameters into a fresh macro frame, pushing it. The
    /// caller pops the frame after rendering the body.
    pub(crate) fn bind_macro_frame(
        &mut self,
        template: &Arc<CompiledTemplate>,
        macro_name: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        caller: Option<String>,
    ) -> Result<MacroDefinition> {
        let def = template
            .macros
            .get(macro_name)
            .cloned()
            .ok_or_else(|| Error::macro_not_found(macro_name))?;

        let mut frame_context = FrameContext::new();
        let mut extra_positional: Vec<Value> = Vec::new();

        let mut args = args.into_iter();
        for (index, value) in args.by_ref().enumerate() {
            match def.params.get(index) {
                Some(param) => {
                    frame_context.insert(param.name.clone(), Cow::Owned(value));
                }
                None => extra_positional.push(value),
            }
        }

        for (key, value) in kwargs {
            if let Some(param) = def.params.iter().find(|p| p.name == *key) {
                if frame_context.contains_key(&param.name) {
                    return Err(Error::runtime(format!(
                        "Macro `{}` got multiple values for parameter `{}`",
                        macro_name, key
                    )));
                }
                frame_context.insert(param.name.clone(), Cow::Owned(value));
            } else if def.kwarg.is_none() {
                return Err(Error::runtime(format!(
                    "Macro `{}` got an unexpected keyword argument `{}`",
                    macro_name, key
                )));
            } else {
                let kwarg_name = def.kwarg.clone().unwrap();
                frame_context
                    .entry(kwarg_name.clone())
                    .or_insert_with(|| Cow::Owned(Value::Object(Map::new())));
                if let Some(Cow::Owned(Value::Object(map))) = frame_context.get_mut(&kwarg_name)
                {
                    map.insert(key, value);
                }
            }
        }

        if !extra_positional.is_empty() && def.vararg.is_none() {
            return Err(Error::runtime(format!(
                "Macro `{}` was called with too many positional arguments",
                macro_name
            )));
        }
        if let Some(ref vararg) = def.vararg {
            frame_context
                .insert(vararg.clone(), Cow::Owned(Value::Array(extra_positional)));
        }
        if let Some(ref kwarg) = def.kwarg {
            frame_context
                .entry(kwarg.clone())
                .or_insert_with(|| Cow::Owned(Value::Object(Map::new())));
        }

        // defaults are evaluated at call time, in the caller's scope
        for param in &def.params {
            if frame_context.contains_key(&param.name) {
                continue;
            }
            match &param.default {
                Some(default) => {
                    let value = self.safe_eval_expression(default)?.into_owned();
                    frame_context.insert(param.name.clone(), Cow::Owned(value));
                }
                None => {
                    return Err(Error::runtime(format!(
                        "Macro `{}` is missing the required parameter `{}`",
                        macro_name, param.name
                    )));
                }
            }
        }

        if let Some(caller) = caller {
            frame_context.insert("caller".to_string(), Cow::Owned(utils::mark_safe(caller)));
        }

        self.call_stack.push_macro_frame(macro_name.to_string(), frame_context);
        Ok(def)
    }
}

/// What a call expression resolves to.
pub(crate) enum CallTarget {
    LoopCycle,
    LoopRecursion,
    Caller,
    Macro(Arc<CompiledTemplate>, String),
    Function(Arc<dyn crate::builtins::functions::Function>),
}
