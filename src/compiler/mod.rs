//! Lowers a parsed template into a `CompiledTemplate`: the optimized AST
//! as the executable program, the block and macro tables, the async-taint
//! flag, and the static per-loop facts the renderer relies on.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analysis::{AnalysisConfig, TemplateMetadata};
use crate::cache::hash_source;
use crate::errors::{Error, Result, SourcePos, SyntaxDetails};
use crate::lexer::CompiledSyntax;
use crate::optimizer::{optimize, OptimizeOptions};
use crate::parser::ast::*;
use crate::parser::parse_with_syntax;

/// Everything `compile` needs besides the source.
pub struct CompileOptions<'a> {
    pub syntax: &'a CompiledSyntax,
    pub optimize: OptimizeOptions<'a>,
    /// Keep the optimized AST available to the analysis subsystem
    pub preserve_ast: bool,
}

/// A compiled, immutable, render-ready template. Owned by the environment
/// template cache; rendering never mutates it.
#[derive(Debug)]
pub struct CompiledTemplate {
    pub name: Option<String>,
    pub filename: Option<String>,
    /// The optimized program the renderer walks
    pub ast: Template,
    /// Parent template expression when the template extends another
    pub extends: Option<Expr>,
    /// All blocks defined in the template, at any depth
    pub blocks: HashMap<String, Block>,
    /// All macros defined in the template
    pub macros: HashMap<String, MacroDefinition>,
    pub is_async: bool,
    pub source_hash: u64,
    /// Source kept for error snippets and re-hashing
    pub source: String,
    /// Whether analysis may run on this template
    preserve_ast: bool,
    metadata: OnceLock<TemplateMetadata>,
}

impl CompiledTemplate {
    /// Lazily computed analysis metadata for this template.
    pub fn metadata(&self, config: &AnalysisConfig) -> Result<&TemplateMetadata> {
        if !self.preserve_ast {
            return Err(Error::msg(
                "Template analysis needs `preserve_ast` enabled on the environment",
            ));
        }
        Ok(self
            .metadata
            .get_or_init(|| crate::analysis::analyze_template(self, config)))
    }
}

/// The on-disk image of a compiled template, the payload of a bytecode
/// cache entry.
#[derive(Serialize, Deserialize)]
struct ProgramImage {
    name: Option<String>,
    filename: Option<String>,
    ast: Template,
    is_async: bool,
    source_hash: u64,
    source: String,
}

/// Compiles template source into a render-ready program.
pub fn compile(
    name: Option<&str>,
    filename: Option<&str>,
    source: &str,
    options: &CompileOptions,
) -> Result<Arc<CompiledTemplate>> {
    let ast = parse_with_syntax(source, options.syntax)?;
    check_invariants(&ast, source)?;

    let ast = annotate_loops(ast);
    let ast = optimize(ast, &options.optimize);

    let is_async = body_is_async(&ast);
    let extends = find_extends(&ast);
    let mut blocks = HashMap::new();
    let mut macros = HashMap::new();
    collect_definitions(&ast, source, &mut blocks, &mut macros)?;

    debug!(name = name.unwrap_or("<string>"), is_async, blocks = blocks.len(), "compiled template");

    Ok(Arc::new(CompiledTemplate {
        name: name.map(str::to_string),
        filename: filename.map(str::to_string),
        ast,
        extends,
        blocks,
        macros,
        is_async,
        source_hash: hash_source(source),
        source: source.to_string(),
        preserve_ast: options.preserve_ast,
        metadata: OnceLock::new(),
    }))
}

/// Serializes a compiled template into a bytecode cache payload.
pub fn to_image(template: &CompiledTemplate) -> Result<Vec<u8>> {
    let image = ProgramImage {
        name: template.name.clone(),
        filename: template.filename.clone(),
        ast: template.ast.clone(),
        is_async: template.is_async,
        source_hash: template.source_hash,
        source: template.source.clone(),
    };
    serde_json::to_vec(&image).map_err(Error::json)
}

/// Rebuilds a compiled template from a bytecode cache payload. The block
/// and macro tables are recollected rather than stored.
pub fn from_image(payload: &[u8], preserve_ast: bool) -> Result<Arc<CompiledTemplate>> {
    let image: ProgramImage = serde_json::from_slice(payload).map_err(Error::json)?;
    let extends = find_extends(&image.ast);
    let mut blocks = HashMap::new();
    let mut macros = HashMap::new();
    collect_definitions(&image.ast, &image.source, &mut blocks, &mut macros)?;

    Ok(Arc::new(CompiledTemplate {
        name: image.name,
        filename: image.filename,
        ast: image.ast,
        extends,
        blocks,
        macros,
        is_async: image.is_async,
        source_hash: image.source_hash,
        source: image.source,
        preserve_ast,
        metadata: OnceLock::new(),
    }))
}

fn compile_error(source: &str, pos: SourcePos, message: impl ToString) -> Error {
    Error::compile(message, SyntaxDetails::from_source(source, pos, None))
}

/// The semantic checks on a well-formed AST: extends placement,
/// break/continue placement, and that a `{% case %}`-less match or
/// duplicate blocks don't slip through.
fn check_invariants(ast: &Template, source: &str) -> Result<()> {
    // extends must be the first non-data, non-comment statement, and
    // appear at most once
    let mut seen_real_node = false;
    for node in ast {
        match node {
            Node::Data(_, text) if text.trim().is_empty() => (),
            Node::Comment(..) => (),
            Node::Extends(_, pos, _) => {
                if seen_real_node {
                    return Err(compile_error(
                        source,
                        *pos,
                        "`{% extends %}` must be the first tag of the template",
                    ));
                }
                seen_real_node = true;
            }
            _ => seen_real_node = true,
        }
    }
    let extends_count = ast.iter().filter(|n| matches!(n, Node::Extends(..))).count();
    if extends_count > 1 {
        let pos = ast
            .iter()
            .filter_map(|n| match n {
                Node::Extends(_, pos, _) => Some(*pos),
                _ => None,
            })
            .nth(1)
            .unwrap_or_default();
        return Err(compile_error(source, pos, "A template can only extend one other template"));
    }

    check_loop_controls(ast, source, 0)?;
    Ok(())
}

/// `break`/`continue` may only appear inside a `for`/`while` body.
fn check_loop_controls(nodes: &[Node], source: &str, loop_depth: usize) -> Result<()> {
    for node in nodes {
        match node {
            Node::Break(_, pos) | Node::Continue(_, pos) => {
                if loop_depth == 0 {
                    let tag = if matches!(node, Node::Break(..)) { "break" } else { "continue" };
                    return Err(compile_error(
                        source,
                        *pos,
                        format!("`{{% {} %}}` can only be used inside a loop", tag),
                    ));
                }
            }
            Node::Forloop(_, forloop, _) => {
                check_loop_controls(&forloop.body, source, loop_depth + 1)?;
                if let Some(ref empty) = forloop.empty_body {
                    // the else body runs outside the iteration
                    check_loop_controls(empty, source, loop_depth)?;
                }
            }
            Node::While(_, while_loop, _) => {
                check_loop_controls(&while_loop.body, source, loop_depth + 1)?;
            }
            Node::If(if_node, _) => {
                for (_, _, body) in &if_node.conditions {
                    check_loop_controls(body, source, loop_depth)?;
                }
                if let Some((_, body)) = &if_node.otherwise {
                    check_loop_controls(body, source, loop_depth)?;
                }
            }
            Node::Match(_, match_block, _) => {
                for case in &match_block.cases {
                    check_loop_controls(&case.body, source, loop_depth)?;
                }
            }
            Node::With(_, with, _) => check_loop_controls(&with.body, source, loop_depth)?,
            Node::Spaceless(_, body, _) => check_loop_controls(body, source, loop_depth)?,
            Node::FilterSection(_, section, _) => {
                check_loop_controls(&section.body, source, loop_depth)?;
            }
            Node::Cache(_, cache, _) => check_loop_controls(&cache.body, source, loop_depth)?,
            Node::Capture(_, capture, _) => {
                check_loop_controls(&capture.body, source, loop_depth)?;
            }
            Node::Block(_, block, _) => check_loop_controls(&block.body, source, loop_depth)?,
            // a macro body is a new function: loops outside don't reach in
            Node::MacroDefinition(_, def, _) => check_loop_controls(&def.body, source, 0)?,
            Node::CallBlock(_, call, _) => check_loop_controls(&call.body, source, 0)?,
            Node::Slot(_, slot, _) => check_loop_controls(&slot.default_body, source, loop_depth)?,
            Node::Embed(_, embed, _) => check_loop_controls(&embed.body, source, 0)?,
            _ => (),
        }
    }
    Ok(())
}

/// Collects block and macro tables, rejecting duplicate block names and
/// duplicate macro names.
fn collect_definitions(
    nodes: &[Node],
    source: &str,
    blocks: &mut HashMap<String, Block>,
    macros: &mut HashMap<String, MacroDefinition>,
) -> Result<()> {
    for node in nodes {
        match node {
            Node::Block(_, block, _) => {
                if blocks.insert(block.name.clone(), block.clone()).is_some() {
                    return Err(compile_error(
                        source,
                        block.pos,
                        format!("Block `{}` is defined twice in the same template", block.name),
                    ));
                }
                collect_definitions(&block.body, source, blocks, macros)?;
            }
            Node::MacroDefinition(_, def, _) => {
                if macros.insert(def.name.clone(), def.clone()).is_some() {
                    return Err(compile_error(
                        source,
                        def.pos,
                        format!("Macro `{}` is defined twice in the same template", def.name),
                    ));
                }
            }
            Node::If(if_node, _) => {
                for (_, _, body) in &if_node.conditions {
                    collect_definitions(body, source, blocks, macros)?;
                }
                if let Some((_, body)) = &if_node.otherwise {
                    collect_definitions(body, source, blocks, macros)?;
                }
            }
            Node::Forloop(_, forloop, _) => {
                collect_definitions(&forloop.body, source, blocks, macros)?;
                if let Some(ref empty) = forloop.empty_body {
                    collect_definitions(empty, source, blocks, macros)?;
                }
            }
            Node::While(_, while_loop, _) => {
                collect_definitions(&while_loop.body, source, blocks, macros)?;
            }
            Node::Match(_, match_block, _) => {
                for case in &match_block.cases {
                    collect_definitions(&case.body, source, blocks, macros)?;
                }
            }
            Node::With(_, with, _) => collect_definitions(&with.body, source, blocks, macros)?,
            Node::Spaceless(_, body, _) => collect_definitions(body, source, blocks, macros)?,
            Node::FilterSection(_, section, _) => {
                collect_definitions(&section.body, source, blocks, macros)?;
            }
            _ => (),
        }
    }
    Ok(())
}

fn find_extends(ast: &Template) -> Option<Expr> {
    ast.iter().find_map(|node| match node {
        Node::Extends(_, _, expr) => Some(expr.clone()),
        _ => None,
    })
}

/// Whether any node makes the template require the async renderer.
pub fn body_is_async(nodes: &[Node]) -> bool {
    fn expr_is_async(expr: &Expr) -> bool {
        expr.contains_await()
    }

    nodes.iter().any(|node| match node {
        Node::Output(_, expr) | Node::Do(_, expr) => expr_is_async(expr),
        Node::Emit(_, parts) => parts.iter().any(|p| match p {
            EmitPart::Expr(expr) => expr_is_async(expr),
            EmitPart::Text(_) => false,
        }),
        Node::Set(_, set) => expr_is_async(&set.value),
        Node::Forloop(_, forloop, _) => {
            forloop.is_async
                || expr_is_async(&forloop.container)
                || forloop.condition.as_deref().is_some_and(expr_is_async)
                || body_is_async(&forloop.body)
                || forloop.empty_body.as_deref().is_some_and(body_is_async)
        }
        Node::While(_, while_loop, _) => {
            expr_is_async(&while_loop.condition) || body_is_async(&while_loop.body)
        }
        Node::If(if_node, _) => {
            if_node
                .conditions
                .iter()
                .any(|(_, cond, body)| expr_is_async(cond) || body_is_async(body))
                || if_node.otherwise.as_ref().is_some_and(|(_, body)| body_is_async(body))
        }
        Node::Match(_, match_block, _) => {
            expr_is_async(&match_block.subject)
                || match_block.cases.iter().any(|case| {
                    case.guard.as_ref().is_some_and(expr_is_async) || body_is_async(&case.body)
                })
        }
        Node::Block(_, block, _) => body_is_async(&block.body),
        Node::With(_, with, _) => {
            with.assignments.iter().any(|(_, e)| expr_is_async(e)) || body_is_async(&with.body)
        }
        Node::MacroDefinition(_, def, _) => body_is_async(&def.body),
        Node::CallBlock(_, call_block, _) => {
            call_block.call.args.iter().any(expr_is_async)
                || call_block.call.kwargs.values().any(expr_is_async)
                || body_is_async(&call_block.body)
        }
        Node::Capture(_, capture, _) => body_is_async(&capture.body),
        Node::Cache(_, cache, _) => {
            expr_is_async(&cache.key)
                || cache.ttl.as_ref().is_some_and(expr_is_async)
                || body_is_async(&cache.body)
        }
        Node::FilterSection(_, section, _) => body_is_async(&section.body),
        Node::Slot(_, slot, _) => body_is_async(&slot.default_body),
        Node::Embed(_, embed, _) => body_is_async(&embed.body),
        Node::Spaceless(_, body, _) => body_is_async(body),
        _ => false,
    })
}

/// Rewrites every for loop with the results of the static `loop.*` scan:
/// whether the body reads `loop` at all, and whether it needs the length
/// up front.
fn annotate_loops(nodes: Vec<Node>) -> Vec<Node> {
    nodes.into_iter().map(annotate_node).collect()
}

fn annotate_node(node: Node) -> Node {
    match node {
        Node::Forloop(start_ws, mut forloop, end_ws) => {
            let mut uses_loop = forloop.recursive;
            let mut needs_len = false;
            scan_loop_usage(&forloop.body, &mut uses_loop, &mut needs_len);
            forloop.uses_loop = uses_loop;
            forloop.needs_len = needs_len;
            forloop.body = annotate_loops(forloop.body);
            forloop.empty_body = forloop.empty_body.map(annotate_loops);
            Node::Forloop(start_ws, forloop, end_ws)
        }
        Node::While(start_ws, mut while_loop, end_ws) => {
            while_loop.body = annotate_loops(while_loop.body);
            Node::While(start_ws, while_loop, end_ws)
        }
        Node::If(if_node, end_ws) => Node::If(
            If {
                conditions: if_node
                    .conditions
                    .into_iter()
                    .map(|(ws, cond, body)| (ws, cond, annotate_loops(body)))
                    .collect(),
                otherwise: if_node.otherwise.map(|(ws, body)| (ws, annotate_loops(body))),
            },
            end_ws,
        ),
        Node::Match(start_ws, mut match_block, end_ws) => {
            match_block.cases = match_block
                .cases
                .into_iter()
                .map(|mut case| {
                    case.body = annotate_loops(case.body);
                    case
                })
                .collect();
            Node::Match(start_ws, match_block, end_ws)
        }
        Node::Block(start_ws, mut block, end_ws) => {
            block.body = annotate_loops(block.body);
            Node::Block(start_ws, block, end_ws)
        }
        Node::With(start_ws, mut with, end_ws) => {
            with.body = annotate_loops(with.body);
            Node::With(start_ws, with, end_ws)
        }
        Node::MacroDefinition(start_ws, mut def, end_ws) => {
            def.body = annotate_loops(def.body);
            Node::MacroDefinition(start_ws, def, end_ws)
        }
        Node::CallBlock(start_ws, mut call_block, end_ws) => {
            call_block.body = annotate_loops(call_block.body);
            Node::CallBlock(start_ws, call_block, end_ws)
        }
        Node::Capture(start_ws, mut capture, end_ws) => {
            capture.body = annotate_loops(capture.body);
            Node::Capture(start_ws, capture, end_ws)
        }
        Node::Cache(start_ws, mut cache, end_ws) => {
            cache.body = annotate_loops(cache.body);
            Node::Cache(start_ws, cache, end_ws)
        }
        Node::FilterSection(start_ws, mut section, end_ws) => {
            section.body = annotate_loops(section.body);
            Node::FilterSection(start_ws, section, end_ws)
        }
        Node::Slot(start_ws, mut slot, end_ws) => {
            slot.default_body = annotate_loops(slot.default_body);
            Node::Slot(start_ws, slot, end_ws)
        }
        Node::Embed(start_ws, mut embed, end_ws) => {
            embed.body = annotate_loops(embed.body);
            Node::Embed(start_ws, embed, end_ws)
        }
        Node::Spaceless(start_ws, body, end_ws) => {
            Node::Spaceless(start_ws, annotate_loops(body), end_ws)
        }
        other => other,
    }
}

/// Scans a loop body for `loop.*` references. Nested for loops shadow the
/// binding, so their bodies are skipped; everything else is walked.
fn scan_loop_usage(nodes: &[Node], uses_loop: &mut bool, needs_len: &mut bool) {
    fn scan_expr(expr: &Expr, uses_loop: &mut bool, needs_len: &mut bool) {
        match &expr.val {
            ExprVal::Ident(name) if name == "loop" => {
                // a bare `loop` reference may flow anywhere
                *uses_loop = true;
                *needs_len = true;
            }
            ExprVal::Getattr { value, attr } => {
                if matches!(&value.val, ExprVal::Ident(name) if name == "loop") {
                    *uses_loop = true;
                    if matches!(
                        attr.as_str(),
                        "length" | "last" | "revindex" | "revindex0" | "nextitem"
                    ) {
                        *needs_len = true;
                    }
                } else {
                    scan_expr(value, uses_loop, needs_len);
                }
            }
            ExprVal::OptionalChain { value, .. } => scan_expr(value, uses_loop, needs_len),
            ExprVal::Getitem { value, key } => {
                scan_expr(value, uses_loop, needs_len);
                scan_expr(key, uses_loop, needs_len);
            }
            ExprVal::Slice { value, lower, upper, step } => {
                scan_expr(value, uses_loop, needs_len);
                for part in [lower, upper, step].into_iter().flatten() {
                    scan_expr(part, uses_loop, needs_len);
                }
            }
            ExprVal::Math(m) => {
                scan_expr(&m.lhs, uses_loop, needs_len);
                scan_expr(&m.rhs, uses_loop, needs_len);
            }
            ExprVal::Logic(l) => {
                scan_expr(&l.lhs, uses_loop, needs_len);
                scan_expr(&l.rhs, uses_loop, needs_len);
            }
            ExprVal::Compare(c) => {
                scan_expr(&c.lhs, uses_loop, needs_len);
                for (_, e) in &c.comparisons {
                    scan_expr(e, uses_loop, needs_len);
                }
            }
            ExprVal::Not(e) | ExprVal::Await(e) => scan_expr(e, uses_loop, needs_len),
            ExprVal::Concat { left, right }
            | ExprVal::NullCoalesce { left, right }
            | ExprVal::Range { start: left, end: right } => {
                scan_expr(left, uses_loop, needs_len);
                scan_expr(right, uses_loop, needs_len);
            }
            ExprVal::Conditional { test, if_true, if_false } => {
                scan_expr(test, uses_loop, needs_len);
                scan_expr(if_true, uses_loop, needs_len);
                if let Some(e) = if_false {
                    scan_expr(e, uses_loop, needs_len);
                }
            }
            ExprVal::Test(t) => {
                scan_expr(&t.expr, uses_loop, needs_len);
                for e in &t.args {
                    scan_expr(e, uses_loop, needs_len);
                }
            }
            ExprVal::FunctionCall(call) => {
                // `loop(...)` and `loop.cycle(...)` recursion/cycling
                if call.name == "loop" || call.namespace.as_deref() == Some("loop") {
                    *uses_loop = true;
                }
                for e in &call.args {
                    scan_expr(e, uses_loop, needs_len);
                }
                for e in call.kwargs.values() {
                    scan_expr(e, uses_loop, needs_len);
                }
            }
            ExprVal::List(items) | ExprVal::Tuple(items) | ExprVal::SetLiteral(items) => {
                for e in items {
                    scan_expr(e, uses_loop, needs_len);
                }
            }
            ExprVal::Dict(entries) => {
                for (k, v) in entries {
                    scan_expr(k, uses_loop, needs_len);
                    scan_expr(v, uses_loop, needs_len);
                }
            }
            _ => (),
        }
        for filter in &expr.filters {
            for e in &filter.args {
                scan_expr(e, uses_loop, needs_len);
            }
            for e in filter.kwargs.values() {
                scan_expr(e, uses_loop, needs_len);
            }
        }
    }

    for node in nodes {
        match node {
            Node::Output(_, expr) | Node::Do(_, expr) => scan_expr(expr, uses_loop, needs_len),
            Node::Emit(_, parts) => {
                for part in parts {
                    if let EmitPart::Expr(expr) = part {
                        scan_expr(expr, uses_loop, needs_len);
                    }
                }
            }
            Node::Set(_, set) => scan_expr(&set.value, uses_loop, needs_len),
            Node::If(if_node, _) => {
                for (_, cond, body) in &if_node.conditions {
                    scan_expr(cond, uses_loop, needs_len);
                    scan_loop_usage(body, uses_loop, needs_len);
                }
                if let Some((_, body)) = &if_node.otherwise {
                    scan_loop_usage(body, uses_loop, needs_len);
                }
            }
            // nested loops rebind `loop`; only their container/condition
            // still see the outer binding
            Node::Forloop(_, forloop, _) => {
                scan_expr(&forloop.container, uses_loop, needs_len);
                if let Some(ref cond) = forloop.condition {
                    scan_expr(cond, uses_loop, needs_len);
                }
            }
            Node::While(_, while_loop, _) => {
                scan_expr(&while_loop.condition, uses_loop, needs_len);
                scan_loop_usage(&while_loop.body, uses_loop, needs_len);
            }
            Node::Match(_, match_block, _) => {
                scan_expr(&match_block.subject, uses_loop, needs_len);
                for case in &match_block.cases {
                    if let Some(ref guard) = case.guard {
                        scan_expr(guard, uses_loop, needs_len);
                    }
                    scan_loop_usage(&case.body, uses_loop, needs_len);
                }
            }
            Node::With(_, with, _) => {
                for (_, e) in &with.assignments {
                    scan_expr(e, uses_loop, needs_len);
                }
                scan_loop_usage(&with.body, uses_loop, needs_len);
            }
            Node::Capture(_, capture, _) => scan_loop_usage(&capture.body, uses_loop, needs_len),
            Node::Cache(_, cache, _) => {
                scan_expr(&cache.key, uses_loop, needs_len);
                if let Some(ref ttl) = cache.ttl {
                    scan_expr(ttl, uses_loop, needs_len);
                }
                scan_loop_usage(&cache.body, uses_loop, needs_len);
            }
            Node::FilterSection(_, section, _) => {
                scan_loop_usage(&section.body, uses_loop, needs_len);
            }
            Node::CallBlock(_, call_block, _) => {
                for e in &call_block.call.args {
                    scan_expr(e, uses_loop, needs_len);
                }
                for e in call_block.call.kwargs.values() {
                    scan_expr(e, uses_loop, needs_len);
                }
                scan_loop_usage(&call_block.body, uses_loop, needs_len);
            }
            Node::Spaceless(_, body, _) => scan_loop_usage(body, uses_loop, needs_len),
            // blocks render in the surrounding scope, so their bodies see
            // the loop too
            Node::Block(_, block, _) => scan_loop_usage(&block.body, uses_loop, needs_len),
            _ => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::default_syntax;

    fn compile_str(source: &str) -> Result<Arc<CompiledTemplate>> {
        let syntax = default_syntax();
        let options = CompileOptions {
            syntax: &syntax,
            optimize: OptimizeOptions { coalesce: true, ..Default::default() },
            preserve_ast: true,
        };
        compile(Some("test.html"), None, source, &options)
    }

    #[test]
    fn test_extends_must_be_first() {
        assert!(compile_str("{# ok #}  {% extends \"base.html\" %}").is_ok());
        let err = compile_str("hello {% extends \"base.html\" %}").unwrap_err();
        assert!(err.to_string().contains("must be the first tag"));
    }

    #[test]
    fn test_single_extends() {
        let err =
            compile_str("{% extends \"a.html\" %}{% extends \"b.html\" %}").unwrap_err();
        assert!(err.to_string().contains("only extend one"));
    }

    #[test]
    fn test_break_outside_loop() {
        let err = compile_str("{% break %}").unwrap_err();
        assert!(err.to_string().contains("inside a loop"));
        assert!(compile_str("{% for i in x %}{% break %}{% end %}").is_ok());
        // the for-else body is not part of the iteration
        assert!(compile_str("{% for i in x %}{% else %}{% continue %}{% end %}").is_err());
    }

    #[test]
    fn test_duplicate_blocks_rejected() {
        let err = compile_str("{% block a %}{% end %}{% block a %}{% end %}").unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn test_async_taint() {
        let tpl = compile_str("{{ await fetch_data() }}").unwrap();
        assert!(tpl.is_async);
        let tpl = compile_str("{% async for x in items() %}{{ x }}{% end %}").unwrap();
        assert!(tpl.is_async);
        let tpl = compile_str("{{ x }}").unwrap();
        assert!(!tpl.is_async);
    }

    #[test]
    fn test_loop_annotation() {
        let tpl = compile_str("{% for i in items %}{{ loop.index }}{% end %}").unwrap();
        let Some(Node::Forloop(_, forloop, _)) =
            tpl.ast.iter().find(|n| matches!(n, Node::Forloop(..)))
        else {
            panic!("no for loop in ast");
        };
        assert!(forloop.uses_loop);
        assert!(!forloop.needs_len);

        let tpl = compile_str("{% for i in items %}{{ loop.last }}{% end %}").unwrap();
        let Some(Node::Forloop(_, forloop, _)) =
            tpl.ast.iter().find(|n| matches!(n, Node::Forloop(..)))
        else {
            panic!("no for loop in ast");
        };
        assert!(forloop.needs_len);

        let tpl = compile_str("{% for i in items %}{{ i }}{% end %}").unwrap();
        let Some(Node::Forloop(_, forloop, _)) =
            tpl.ast.iter().find(|n| matches!(n, Node::Forloop(..)))
        else {
            panic!("no for loop in ast");
        };
        assert!(!forloop.uses_loop);
    }

    #[test]
    fn test_image_round_trip() {
        let tpl = compile_str("{% block b %}hi{% end %}").unwrap();
        let payload = to_image(&tpl).unwrap();
        let restored = from_image(&payload, true).unwrap();
        assert_eq!(restored.ast, tpl.ast);
        assert_eq!(restored.source_hash, tpl.source_hash);
        assert!(restored.blocks.contains_key("b"));
    }
}
