//! Static inspection of compiled templates: what context they depend on,
//! whether their blocks are deterministic, how broadly a block's output
//! can be reused, and whether macro call sites line up with definitions.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use lazy_static::lazy_static;
use serde_json::Value;

use crate::builtins::filters::PURE_FILTERS;
use crate::compiler::CompiledTemplate;
use crate::context::Context;
use crate::errors::SourcePos;
use crate::parser::ast::*;

lazy_static! {
    /// Functions whose output changes between calls
    static ref IMPURE_FUNCTIONS: HashSet<&'static str> =
        ["now", "get_random", "random", "shuffle", "uuid"].into_iter().collect();

    /// Functions the analyzer can classify without configuration
    static ref KNOWN_FUNCTIONS: HashSet<&'static str> =
        ["range", "now", "throw", "cycle", "get_random", "loop", "super", "caller"]
            .into_iter()
            .collect();
}

/// Deterministic-output classification of a block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Purity {
    Pure,
    Impure,
    Unknown,
}

/// The broadest reuse that is safe for a block's output
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheScope {
    /// Stable across every page of a site
    Site,
    /// Stable for a given page
    Page,
    /// Not safely reusable
    None,
    Unknown,
}

/// Tunables for the classifiers.
#[derive(Clone, Debug)]
pub struct AnalysisConfig {
    /// Top-level names whose values are the same on every page
    pub site_prefixes: Vec<String>,
    /// Top-level names that vary per page
    pub page_prefixes: Vec<String>,
    /// Function names to treat as pure on top of the builtin knowledge
    pub extra_pure_functions: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            site_prefixes: vec!["site".to_string(), "config".to_string()],
            page_prefixes: vec!["page".to_string(), "post".to_string()],
            extra_pure_functions: Vec::new(),
        }
    }
}

/// What analysis knows about one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMetadata {
    pub name: String,
    /// Dotted context paths the block reads, e.g. `page.title`
    pub depends_on: BTreeSet<String>,
    pub is_pure: Purity,
    pub cache_scope: CacheScope,
    pub emits_html: bool,
    /// HTML5 landmark elements opened in the block's literal text
    pub emits_landmarks: BTreeSet<String>,
    pub inferred_role: String,
}

/// One problem found at a macro call site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallValidation {
    pub def_name: String,
    pub lineno: usize,
    pub col_offset: usize,
    pub unknown_params: Vec<String>,
    pub missing_required: Vec<String>,
    pub duplicate_params: Vec<String>,
}

/// What analysis knows about a whole template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateMetadata {
    pub name: Option<String>,
    /// The parent template, when `{% extends %}` names it literally
    pub extends: Option<String>,
    pub blocks: BTreeMap<String, BlockMetadata>,
    /// Paths read outside of any block
    pub top_level_depends_on: BTreeSet<String>,
    pub call_validations: Vec<CallValidation>,
}

/// Runs the whole analysis over a compiled template.
pub fn analyze_template(template: &CompiledTemplate, config: &AnalysisConfig) -> TemplateMetadata {
    let extends = template.extends.as_ref().and_then(|expr| match &expr.val {
        ExprVal::Str(s) => Some(s.clone()),
        _ => None,
    });

    let mut blocks = BTreeMap::new();
    for (name, block) in &template.blocks {
        blocks.insert(name.clone(), analyze_block(block, config));
    }

    let mut top_level = Walker::new(config);
    top_level.walk_body_shallow(&template.ast);

    TemplateMetadata {
        name: template.name.clone(),
        extends,
        blocks,
        top_level_depends_on: top_level.depends_on,
        call_validations: validate_call_sites(template),
    }
}

fn analyze_block(block: &Block, config: &AnalysisConfig) -> BlockMetadata {
    let mut walker = Walker::new(config);
    walker.walk_body(&block.body);

    let is_pure = if walker.impure {
        Purity::Impure
    } else if walker.unresolvable_call {
        Purity::Unknown
    } else {
        Purity::Pure
    };

    let cache_scope = classify_cache_scope(is_pure, &walker.depends_on, config);
    let landmarks = detect_landmarks(&block.body);
    let emits_html = block_emits_html(&block.body);
    let inferred_role = infer_role(&block.name, &landmarks);

    BlockMetadata {
        name: block.name.clone(),
        depends_on: walker.depends_on,
        is_pure,
        cache_scope,
        emits_html,
        emits_landmarks: landmarks,
        inferred_role,
    }
}

fn classify_cache_scope(
    purity: Purity,
    depends_on: &BTreeSet<String>,
    config: &AnalysisConfig,
) -> CacheScope {
    if purity == Purity::Impure {
        return CacheScope::None;
    }

    let top_level: BTreeSet<&str> = depends_on
        .iter()
        .map(|path| path.split('.').next().unwrap_or(path.as_str()))
        .collect();

    if top_level.is_empty()
        || top_level.iter().all(|name| config.site_prefixes.iter().any(|p| p == name))
    {
        return CacheScope::Site;
    }
    if top_level.iter().any(|name| config.page_prefixes.iter().any(|p| p == name)) {
        return CacheScope::Page;
    }
    CacheScope::Unknown
}

const LANDMARKS: [&str; 5] = ["nav", "main", "header", "footer", "aside"];

fn detect_landmarks(body: &[Node]) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    for_each_data(body, &mut |text| {
        let lowered = text.to_ascii_lowercase();
        for landmark in LANDMARKS {
            let open = format!("<{}", landmark);
            // the tag name must end right after: `<nav>` or `<nav class=`
            let mut from = 0;
            while let Some(at) = lowered[from..].find(&open) {
                let end = from + at + open.len();
                match lowered.as_bytes().get(end) {
                    Some(b'>') | Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'/') => {
                        found.insert(landmark.to_string());
                        break;
                    }
                    _ => from = end,
                }
            }
        }
    });
    found
}

fn block_emits_html(body: &[Node]) -> bool {
    let mut emits = false;
    for_each_data(body, &mut |text| {
        if text.contains('<') {
            emits = true;
        }
    });
    emits
}

fn infer_role(block_name: &str, landmarks: &BTreeSet<String>) -> String {
    if landmarks.contains("nav") || block_name.contains("nav") {
        return "navigation".to_string();
    }
    if landmarks.contains("main") || block_name == "content" || block_name == "body" {
        return "main content".to_string();
    }
    if landmarks.contains("header") || block_name.contains("head") {
        return "header".to_string();
    }
    if landmarks.contains("footer") || block_name.contains("foot") {
        return "footer".to_string();
    }
    if landmarks.contains("aside") || block_name.contains("side") {
        return "sidebar".to_string();
    }
    "content".to_string()
}

/// Walks literal data nodes of a body, recursively.
fn for_each_data(body: &[Node], f: &mut impl FnMut(&str)) {
    for node in body {
        match node {
            Node::Data(_, text) | Node::Raw(_, _, text, _) => f(text),
            Node::Emit(_, parts) => {
                for part in parts {
                    if let EmitPart::Text(text) = part {
                        f(text);
                    }
                }
            }
            Node::If(if_node, _) => {
                for (_, _, body) in &if_node.conditions {
                    for_each_data(body, f);
                }
                if let Some((_, body)) = &if_node.otherwise {
                    for_each_data(body, f);
                }
            }
            Node::Forloop(_, forloop, _) => {
                for_each_data(&forloop.body, f);
                if let Some(ref empty) = forloop.empty_body {
                    for_each_data(empty, f);
                }
            }
            Node::While(_, while_loop, _) => for_each_data(&while_loop.body, f),
            Node::Match(_, match_block, _) => {
                for case in &match_block.cases {
                    for_each_data(&case.body, f);
                }
            }
            Node::With(_, with, _) => for_each_data(&with.body, f),
            Node::Spaceless(_, body, _) => for_each_data(body, f),
            Node::FilterSection(_, section, _) => for_each_data(&section.body, f),
            Node::Cache(_, cache, _) => for_each_data(&cache.body, f),
            Node::Capture(_, capture, _) => for_each_data(&capture.body, f),
            Node::CallBlock(_, call_block, _) => for_each_data(&call_block.body, f),
            Node::Slot(_, slot, _) => for_each_data(&slot.default_body, f),
            Node::Embed(_, embed, _) => for_each_data(&embed.body, f),
            Node::Block(_, block, _) => for_each_data(&block.body, f),
            _ => (),
        }
    }
}

/// The dependency/purity walker. Over-approximates: both branches of
/// conditionals and both loop bodies are visited, so it never
/// under-reports a dependency.
struct Walker<'c> {
    config: &'c AnalysisConfig,
    depends_on: BTreeSet<String>,
    /// Names bound locally (loop vars, sets); these aren't dependencies
    bound: HashSet<String>,
    impure: bool,
    unresolvable_call: bool,
}

impl<'c> Walker<'c> {
    fn new(config: &'c AnalysisConfig) -> Self {
        let mut bound = HashSet::new();
        bound.insert("loop".to_string());
        Walker { config, depends_on: BTreeSet::new(), bound, impure: false, unresolvable_call: false }
    }

    /// Walks a whole body, including nested blocks.
    fn walk_body(&mut self, body: &[Node]) {
        self.walk(body, true);
    }

    /// Walks a template's top level only: nested blocks get their own
    /// metadata and are skipped here.
    fn walk_body_shallow(&mut self, body: &[Node]) {
        self.walk(body, false);
    }

    fn walk(&mut self, body: &[Node], into_blocks: bool) {
        for node in body {
            match node {
                Node::Output(_, expr) | Node::Do(_, expr) => self.walk_expr(expr),
                Node::Emit(_, parts) => {
                    for part in parts {
                        if let EmitPart::Expr(expr) = part {
                            self.walk_expr(expr);
                        }
                    }
                }
                Node::Set(_, set) => {
                    self.walk_expr(&set.value);
                    self.bound.insert(set.key.clone());
                }
                Node::If(if_node, _) => {
                    for (_, cond, body) in &if_node.conditions {
                        self.walk_expr(cond);
                        self.walk(body, into_blocks);
                    }
                    if let Some((_, body)) = &if_node.otherwise {
                        self.walk(body, into_blocks);
                    }
                }
                Node::Forloop(_, forloop, _) => {
                    self.walk_expr(&forloop.container);
                    if let Some(ref cond) = forloop.condition {
                        self.walk_expr(cond);
                    }
                    let shadowed = self.shadow(
                        forloop.key.iter().chain(std::iter::once(&forloop.value)),
                    );
                    self.walk(&forloop.body, into_blocks);
                    if let Some(ref empty) = forloop.empty_body {
                        self.walk(empty, into_blocks);
                    }
                    self.unshadow(shadowed);
                }
                Node::While(_, while_loop, _) => {
                    self.walk_expr(&while_loop.condition);
                    self.walk(&while_loop.body, into_blocks);
                }
                Node::Match(_, match_block, _) => {
                    self.walk_expr(&match_block.subject);
                    for case in &match_block.cases {
                        if let Some(ref guard) = case.guard {
                            self.walk_expr(guard);
                        }
                        self.walk(&case.body, into_blocks);
                    }
                }
                Node::With(_, with, _) => {
                    for (_, expr) in &with.assignments {
                        self.walk_expr(expr);
                    }
                    let shadowed =
                        self.shadow(with.assignments.iter().map(|(name, _)| name));
                    self.walk(&with.body, into_blocks);
                    self.unshadow(shadowed);
                }
                Node::Capture(_, capture, _) => {
                    self.walk(&capture.body, into_blocks);
                    self.bound.insert(capture.name.clone());
                }
                Node::Cache(_, cache, _) => {
                    self.walk_expr(&cache.key);
                    if let Some(ref ttl) = cache.ttl {
                        self.walk_expr(ttl);
                    }
                    self.walk(&cache.body, into_blocks);
                }
                Node::FilterSection(_, section, _) => {
                    for filter in &section.filters {
                        self.walk_filter(filter);
                    }
                    self.walk(&section.body, into_blocks);
                }
                Node::CallBlock(_, call_block, _) => {
                    self.walk_call(&call_block.call);
                    self.walk(&call_block.body, into_blocks);
                }
                Node::Include(_, include) => self.walk_expr(&include.template),
                Node::Import(_, import) => {
                    self.walk_expr(&import.template);
                    self.bound.insert(import.target.clone());
                }
                Node::FromImport(_, from) => {
                    self.walk_expr(&from.template);
                    for (name, alias) in &from.names {
                        self.bound.insert(alias.clone().unwrap_or_else(|| name.clone()));
                    }
                }
                Node::MacroDefinition(_, def, _) => {
                    let shadowed = self.shadow(
                        def.params
                            .iter()
                            .map(|p| &p.name)
                            .chain(def.vararg.iter())
                            .chain(def.kwarg.iter()),
                    );
                    self.walk(&def.body, into_blocks);
                    self.unshadow(shadowed);
                }
                Node::Slot(_, slot, _) => self.walk(&slot.default_body, into_blocks),
                Node::Embed(_, embed, _) => {
                    self.walk_expr(&embed.template);
                    self.walk(&embed.body, into_blocks);
                }
                Node::Spaceless(_, body, _) => self.walk(body, into_blocks),
                Node::Block(_, block, _) => {
                    if into_blocks {
                        self.walk(&block.body, into_blocks);
                    }
                }
                Node::Extends(_, _, expr) => self.walk_expr(expr),
                _ => (),
            }
        }
    }

    /// Marks names bound, returning the ones that were newly inserted.
    fn shadow<'n>(&mut self, names: impl Iterator<Item = &'n String>) -> Vec<String> {
        let mut added = Vec::new();
        for name in names {
            if self.bound.insert(name.clone()) {
                added.push(name.clone());
            }
        }
        added
    }

    fn unshadow(&mut self, names: Vec<String>) {
        for name in names {
            self.bound.remove(&name);
        }
    }

    fn walk_expr(&mut self, expr: &Expr) {
        if let Some(path) = dotted_path(expr) {
            let top = path.split('.').next().unwrap_or(&path).to_string();
            if !self.bound.contains(&top) {
                self.depends_on.insert(path);
            }
        } else {
            self.walk_expr_children(&expr.val);
        }

        for filter in &expr.filters {
            self.walk_filter(filter);
        }
    }

    fn walk_filter(&mut self, filter: &FilterCall) {
        if !PURE_FILTERS.contains(filter.name.as_str())
            && !self.config.extra_pure_functions.iter().any(|f| f == &filter.name)
        {
            self.impure = true;
        }
        for arg in &filter.args {
            self.walk_expr(arg);
        }
        for arg in filter.kwargs.values() {
            self.walk_expr(arg);
        }
    }

    fn walk_call(&mut self, call: &FunctionCall) {
        if IMPURE_FUNCTIONS.contains(call.name.as_str()) {
            self.impure = true;
        } else if !KNOWN_FUNCTIONS.contains(call.name.as_str())
            && !self.config.extra_pure_functions.iter().any(|f| f == &call.name)
            && call.namespace.is_none()
        {
            self.unresolvable_call = true;
        }
        for arg in &call.args {
            self.walk_expr(arg);
        }
        for arg in call.kwargs.values() {
            self.walk_expr(arg);
        }
    }

    fn walk_expr_children(&mut self, val: &ExprVal) {
        match val {
            ExprVal::Getitem { value, key } => {
                self.walk_expr(value);
                self.walk_expr(key);
            }
            ExprVal::Slice { value, lower, upper, step } => {
                self.walk_expr(value);
                for part in [lower, upper, step].into_iter().flatten() {
                    self.walk_expr(part);
                }
            }
            ExprVal::Math(m) => {
                self.walk_expr(&m.lhs);
                self.walk_expr(&m.rhs);
            }
            ExprVal::Logic(l) => {
                self.walk_expr(&l.lhs);
                self.walk_expr(&l.rhs);
            }
            ExprVal::Compare(c) => {
                self.walk_expr(&c.lhs);
                for (_, e) in &c.comparisons {
                    self.walk_expr(e);
                }
            }
            ExprVal::Not(e) | ExprVal::Await(e) => self.walk_expr(e),
            ExprVal::Concat { left, right }
            | ExprVal::NullCoalesce { left, right }
            | ExprVal::Range { start: left, end: right } => {
                self.walk_expr(left);
                self.walk_expr(right);
            }
            ExprVal::Conditional { test, if_true, if_false } => {
                self.walk_expr(test);
                self.walk_expr(if_true);
                if let Some(e) = if_false {
                    self.walk_expr(e);
                }
            }
            ExprVal::Test(t) => {
                self.walk_expr(&t.expr);
                for e in &t.args {
                    self.walk_expr(e);
                }
            }
            ExprVal::FunctionCall(call) => self.walk_call(call),
            ExprVal::List(items) | ExprVal::Tuple(items) | ExprVal::SetLiteral(items) => {
                for e in items {
                    self.walk_expr(e);
                }
            }
            ExprVal::Dict(entries) => {
                for (k, v) in entries {
                    self.walk_expr(k);
                    self.walk_expr(v);
                }
            }
            _ => (),
        }
    }
}

/// The dotted path of a pure lookup chain, `None` for anything else.
fn dotted_path(expr: &Expr) -> Option<String> {
    match &expr.val {
        ExprVal::Ident(name) => Some(name.clone()),
        ExprVal::Getattr { value, attr } | ExprVal::OptionalChain { value, attr } => {
            Some(format!("{}.{}", dotted_path(value)?, attr))
        }
        ExprVal::Getitem { value, key } => match &key.val {
            ExprVal::Str(s) => Some(format!("{}.{}", dotted_path(value)?, s)),
            ExprVal::Int(i) => Some(format!("{}.{}", dotted_path(value)?, i)),
            _ => None,
        },
        _ => None,
    }
}

/// Checks every statically-resolvable macro call against its definition.
pub fn validate_call_sites(template: &CompiledTemplate) -> Vec<CallValidation> {
    let mut validations = Vec::new();
    collect_calls(&template.ast, &mut |call, pos| {
        if call.namespace.is_some() {
            return;
        }
        let Some(def) = template.macros.get(&call.name) else { return };
        if let Some(validation) = validate_one_call(def, call, pos) {
            validations.push(validation);
        }
    });
    validations
}

fn validate_one_call(
    def: &MacroDefinition,
    call: &FunctionCall,
    pos: SourcePos,
) -> Option<CallValidation> {
    let param_names: Vec<&str> = def.params.iter().map(|p| p.name.as_str()).collect();

    // a signature with catch-alls accepts anything extra
    let mut unknown_params: Vec<String> = Vec::new();
    if def.kwarg.is_none() {
        unknown_params = call
            .kwargs
            .keys()
            .filter(|k| !param_names.contains(&k.as_str()))
            .cloned()
            .collect();
        unknown_params.sort();
    }

    let mut duplicate_params: Vec<String> = def
        .params
        .iter()
        .take(call.args.len())
        .filter(|p| call.kwargs.contains_key(&p.name))
        .map(|p| p.name.clone())
        .collect();
    duplicate_params.sort();

    let mut missing_required: Vec<String> = def
        .params
        .iter()
        .enumerate()
        .filter(|(i, p)| {
            p.default.is_none() && *i >= call.args.len() && !call.kwargs.contains_key(&p.name)
        })
        .map(|(_, p)| p.name.clone())
        .collect();
    missing_required.sort();

    if def.vararg.is_some() {
        // extra positional args are legitimate
    } else if call.args.len() > def.params.len() {
        unknown_params.push(format!("<{} extra positional>", call.args.len() - def.params.len()));
    }

    if unknown_params.is_empty() && missing_required.is_empty() && duplicate_params.is_empty() {
        return None;
    }

    Some(CallValidation {
        def_name: def.name.clone(),
        lineno: pos.line,
        col_offset: pos.col,
        unknown_params,
        missing_required,
        duplicate_params,
    })
}

/// Finds every macro-call site, both call blocks and expressions.
fn collect_calls(body: &[Node], f: &mut impl FnMut(&FunctionCall, SourcePos)) {
    fn walk_expr(expr: &Expr, f: &mut impl FnMut(&FunctionCall, SourcePos)) {
        if let ExprVal::FunctionCall(ref call) = expr.val {
            f(call, expr.pos);
            for arg in &call.args {
                walk_expr(arg, f);
            }
            for arg in call.kwargs.values() {
                walk_expr(arg, f);
            }
        }
    }

    for node in body {
        match node {
            Node::Output(_, expr) | Node::Do(_, expr) => walk_expr(expr, f),
            Node::Set(_, set) => walk_expr(&set.value, f),
            Node::CallBlock(_, call_block, _) => {
                f(&call_block.call, call_block.pos);
                collect_calls(&call_block.body, f);
            }
            Node::If(if_node, _) => {
                for (_, cond, body) in &if_node.conditions {
                    walk_expr(cond, f);
                    collect_calls(body, f);
                }
                if let Some((_, body)) = &if_node.otherwise {
                    collect_calls(body, f);
                }
            }
            Node::Forloop(_, forloop, _) => {
                walk_expr(&forloop.container, f);
                collect_calls(&forloop.body, f);
                if let Some(ref empty) = forloop.empty_body {
                    collect_calls(empty, f);
                }
            }
            Node::While(_, while_loop, _) => {
                walk_expr(&while_loop.condition, f);
                collect_calls(&while_loop.body, f);
            }
            Node::Match(_, match_block, _) => {
                for case in &match_block.cases {
                    collect_calls(&case.body, f);
                }
            }
            Node::Block(_, block, _) => collect_calls(&block.body, f),
            Node::With(_, with, _) => collect_calls(&with.body, f),
            Node::MacroDefinition(_, def, _) => collect_calls(&def.body, f),
            Node::Capture(_, capture, _) => collect_calls(&capture.body, f),
            Node::Cache(_, cache, _) => collect_calls(&cache.body, f),
            Node::FilterSection(_, section, _) => collect_calls(&section.body, f),
            Node::Slot(_, slot, _) => collect_calls(&slot.default_body, f),
            Node::Embed(_, embed, _) => collect_calls(&embed.body, f),
            Node::Spaceless(_, body, _) => collect_calls(body, f),
            _ => (),
        }
    }
}

/// Sorted top-level names the template needs that neither the context nor
/// the globals provide.
pub fn missing_context_names(
    metadata: &TemplateMetadata,
    context: &Context,
    global_names: &[String],
) -> Vec<String> {
    let mut required: BTreeSet<String> = BTreeSet::new();
    for path in metadata
        .top_level_depends_on
        .iter()
        .chain(metadata.blocks.values().flat_map(|b| b.depends_on.iter()))
    {
        if let Some(top) = path.split('.').next() {
            required.insert(top.to_string());
        }
    }

    let context_keys: BTreeSet<&str> = match context.as_value() {
        Value::Object(map) => map.keys().map(String::as_str).collect(),
        _ => BTreeSet::new(),
    };

    required
        .into_iter()
        .filter(|name| {
            !context_keys.contains(name.as_str()) && !global_names.iter().any(|g| g == name)
        })
        .collect()
}

#[cfg(test)]
mod tests;
