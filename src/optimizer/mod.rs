//! Compile-time AST rewrites: constant folding, dead-branch elimination,
//! partial evaluation against a static context, and output coalescing.
//!
//! Every pass is total: anything it cannot prove safe to rewrite is left
//! untouched, so `render(compile(t)) == render(compile(optimize(t)))`
//! holds for every template and context.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::builtins::filters::{eval_const_filter, PURE_FILTERS};
use crate::parser::ast::*;
use crate::renderer::ops;

/// What the optimizer is allowed to do for one compilation.
#[derive(Default)]
pub struct OptimizeOptions<'a> {
    /// Known-at-compile-time context values for partial evaluation
    pub static_context: Option<&'a Map<String, Value>>,
    /// Filter names beyond the builtin pure registry that may be treated
    /// as deterministic for coalescing
    pub extra_pure_filters: HashSet<String>,
    /// Whether to merge adjacent data/simple-output runs
    pub coalesce: bool,
}

impl OptimizeOptions<'_> {
    fn is_pure_filter(&self, name: &str) -> bool {
        PURE_FILTERS.contains(name) || self.extra_pure_filters.contains(name)
    }
}

/// Runs all passes over a template body.
pub fn optimize(template: Template, options: &OptimizeOptions) -> Template {
    let bound = collect_bound_names(&template);
    let folder = Folder { options, bound };
    let template = folder.fold_body(template);
    let template = eliminate_dead_branches(template);
    if options.coalesce {
        coalesce_body(template, options)
    } else {
        template
    }
}

/// Every name that is assigned anywhere in the template. Partial
/// evaluation never substitutes these, so shadowing keeps its meaning.
fn collect_bound_names(nodes: &[Node]) -> HashSet<String> {
    let mut bound = HashSet::new();
    // `loop` is implicitly bound inside for bodies
    bound.insert("loop".to_string());

    fn walk(nodes: &[Node], bound: &mut HashSet<String>) {
        for node in nodes {
            match node {
                Node::Set(_, set) => {
                    bound.insert(set.key.clone());
                }
                Node::Capture(_, capture, _) => {
                    bound.insert(capture.name.clone());
                    walk(&capture.body, bound);
                }
                Node::Forloop(_, forloop, _) => {
                    if let Some(ref key) = forloop.key {
                        bound.insert(key.clone());
                    }
                    bound.insert(forloop.value.clone());
                    walk(&forloop.body, bound);
                    if let Some(ref empty) = forloop.empty_body {
                        walk(empty, bound);
                    }
                }
                Node::While(_, while_loop, _) => walk(&while_loop.body, bound),
                Node::With(_, with, _) => {
                    for (name, _) in &with.assignments {
                        bound.insert(name.clone());
                    }
                    walk(&with.body, bound);
                }
                Node::MacroDefinition(_, def, _) => {
                    for param in &def.params {
                        bound.insert(param.name.clone());
                    }
                    if let Some(ref name) = def.vararg {
                        bound.insert(name.clone());
                    }
                    if let Some(ref name) = def.kwarg {
                        bound.insert(name.clone());
                    }
                    walk(&def.body, bound);
                }
                Node::Import(_, import) => {
                    bound.insert(import.target.clone());
                }
                Node::FromImport(_, from) => {
                    for (name, alias) in &from.names {
                        bound.insert(alias.clone().unwrap_or_else(|| name.clone()));
                    }
                }
                Node::If(if_node, _) => {
                    for (_, _, body) in &if_node.conditions {
                        walk(body, bound);
                    }
                    if let Some((_, body)) = &if_node.otherwise {
                        walk(body, bound);
                    }
                }
                Node::Match(_, match_block, _) => {
                    for case in &match_block.cases {
                        walk(&case.body, bound);
                    }
                }
                Node::Block(_, block, _) => walk(&block.body, bound),
                Node::CallBlock(_, call, _) => walk(&call.body, bound),
                Node::Cache(_, cache, _) => walk(&cache.body, bound),
                Node::FilterSection(_, section, _) => walk(&section.body, bound),
                Node::Slot(_, slot, _) => walk(&slot.default_body, bound),
                Node::Embed(_, embed, _) => walk(&embed.body, bound),
                Node::Spaceless(_, body, _) => walk(body, bound),
                _ => (),
            }
        }
    }

    walk(nodes, &mut bound);
    bound
}

/// The folding pass: rewrites expressions bottom-up.
struct Folder<'a, 'o> {
    options: &'o OptimizeOptions<'a>,
    bound: HashSet<String>,
}

impl Folder<'_, '_> {
    fn fold_body(&self, nodes: Vec<Node>) -> Vec<Node> {
        nodes.into_iter().map(|n| self.fold_node(n)).collect()
    }

    fn fold_node(&self, node: Node) -> Node {
        match node {
            Node::Output(ws, expr) => Node::Output(ws, self.fold_expr(expr)),
            Node::Do(ws, expr) => Node::Do(ws, self.fold_expr(expr)),
            Node::If(if_node, end_ws) => {
                let conditions = if_node
                    .conditions
                    .into_iter()
                    .map(|(ws, cond, body)| (ws, self.fold_expr(cond), self.fold_body(body)))
                    .collect();
                let otherwise =
                    if_node.otherwise.map(|(ws, body)| (ws, self.fold_body(body)));
                Node::If(If { conditions, otherwise }, end_ws)
            }
            Node::Forloop(start_ws, mut forloop, end_ws) => {
                forloop.container = self.fold_expr(forloop.container);
                forloop.condition = forloop.condition.map(|c| Box::new(self.fold_expr(*c)));
                forloop.body = self.fold_body(forloop.body);
                forloop.empty_body = forloop.empty_body.map(|b| self.fold_body(b));
                Node::Forloop(start_ws, forloop, end_ws)
            }
            Node::While(start_ws, mut while_loop, end_ws) => {
                while_loop.condition = self.fold_expr(while_loop.condition);
                while_loop.body = self.fold_body(while_loop.body);
                Node::While(start_ws, while_loop, end_ws)
            }
            Node::Match(start_ws, mut match_block, end_ws) => {
                match_block.subject = self.fold_expr(match_block.subject);
                match_block.cases = match_block
                    .cases
                    .into_iter()
                    .map(|mut case| {
                        case.guard = case.guard.map(|g| self.fold_expr(g));
                        case.body = self.fold_body(case.body);
                        case
                    })
                    .collect();
                Node::Match(start_ws, match_block, end_ws)
            }
            Node::Set(ws, mut set) => {
                set.value = self.fold_expr(set.value);
                Node::Set(ws, set)
            }
            Node::Block(start_ws, mut block, end_ws) => {
                block.body = self.fold_body(block.body);
                Node::Block(start_ws, block, end_ws)
            }
            Node::With(start_ws, mut with, end_ws) => {
                with.assignments = with
                    .assignments
                    .into_iter()
                    .map(|(name, value)| (name, self.fold_expr(value)))
                    .collect();
                with.body = self.fold_body(with.body);
                Node::With(start_ws, with, end_ws)
            }
            Node::MacroDefinition(start_ws, mut def, end_ws) => {
                def.body = self.fold_body(def.body);
                Node::MacroDefinition(start_ws, def, end_ws)
            }
            Node::CallBlock(start_ws, mut call_block, end_ws) => {
                call_block.body = self.fold_body(call_block.body);
                Node::CallBlock(start_ws, call_block, end_ws)
            }
            Node::Capture(start_ws, mut capture, end_ws) => {
                capture.body = self.fold_body(capture.body);
                Node::Capture(start_ws, capture, end_ws)
            }
            Node::Cache(start_ws, mut cache, end_ws) => {
                cache.key = self.fold_expr(cache.key);
                cache.ttl = cache.ttl.map(|t| self.fold_expr(t));
                cache.body = self.fold_body(cache.body);
                Node::Cache(start_ws, cache, end_ws)
            }
            Node::FilterSection(start_ws, mut section, end_ws) => {
                section.body = self.fold_body(section.body);
                Node::FilterSection(start_ws, section, end_ws)
            }
            Node::Slot(start_ws, mut slot, end_ws) => {
                slot.default_body = self.fold_body(slot.default_body);
                Node::Slot(start_ws, slot, end_ws)
            }
            Node::Embed(start_ws, mut embed, end_ws) => {
                embed.body = self.fold_body(embed.body);
                Node::Embed(start_ws, embed, end_ws)
            }
            Node::Spaceless(start_ws, body, end_ws) => {
                Node::Spaceless(start_ws, self.fold_body(body), end_ws)
            }
            other => other,
        }
    }

    fn fold_expr(&self, expr: Expr) -> Expr {
        let Expr { val, pos, filters } = expr;

        let val = match val {
            ExprVal::Math(math) => {
                let lhs = self.fold_expr(*math.lhs);
                let rhs = self.fold_expr(*math.rhs);
                match (lhs.as_literal(), rhs.as_literal()) {
                    (Some(l), Some(r)) => match ops::apply_math(math.operator, &l, &r) {
                        Ok(value) => value_to_expr_val(value),
                        // operations that would raise stay in the tree
                        Err(_) => ExprVal::Math(MathExpr {
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                            operator: math.operator,
                        }),
                    },
                    _ => ExprVal::Math(MathExpr {
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                        operator: math.operator,
                    }),
                }
            }
            ExprVal::Logic(logic) => {
                let lhs = self.fold_expr(*logic.lhs);
                let rhs = self.fold_expr(*logic.rhs);
                match (lhs.as_literal(), rhs.as_literal()) {
                    (Some(l), Some(r)) => {
                        let result = match logic.operator {
                            LogicOperator::And => {
                                ops::is_truthy(&l) && ops::is_truthy(&r)
                            }
                            LogicOperator::Or => ops::is_truthy(&l) || ops::is_truthy(&r),
                        };
                        ExprVal::Bool(result)
                    }
                    _ => ExprVal::Logic(LogicExpr {
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                        operator: logic.operator,
                    }),
                }
            }
            ExprVal::Compare(compare) => {
                let lhs = self.fold_expr(*compare.lhs);
                let comparisons: Vec<(CompareOperator, Expr)> = compare
                    .comparisons
                    .into_iter()
                    .map(|(op, e)| (op, self.fold_expr(e)))
                    .collect();

                let all_literal = lhs.as_literal().is_some()
                    && comparisons.iter().all(|(_, e)| e.as_literal().is_some());
                if all_literal {
                    let mut ok = true;
                    let mut prev = lhs.as_literal().unwrap();
                    let mut failed = false;
                    for (op, e) in &comparisons {
                        let next = e.as_literal().unwrap();
                        match ops::apply_compare(*op, &prev, &next) {
                            Ok(result) => {
                                ok = ok && result;
                                prev = next;
                            }
                            Err(_) => {
                                failed = true;
                                break;
                            }
                        }
                    }
                    if !failed {
                        ExprVal::Bool(ok)
                    } else {
                        ExprVal::Compare(CompareExpr { lhs: Box::new(lhs), comparisons })
                    }
                } else {
                    ExprVal::Compare(CompareExpr { lhs: Box::new(lhs), comparisons })
                }
            }
            ExprVal::Not(inner) => {
                let inner = self.fold_expr(*inner);
                match inner.as_literal() {
                    Some(v) => ExprVal::Bool(!ops::is_truthy(&v)),
                    None => ExprVal::Not(Box::new(inner)),
                }
            }
            ExprVal::Concat { left, right } => {
                let left = self.fold_expr(*left);
                let right = self.fold_expr(*right);
                match (left.as_literal(), right.as_literal()) {
                    (Some(l), Some(r)) => match ops::concat_values(&l, &r) {
                        Ok(value) => value_to_expr_val(value),
                        Err(_) => {
                            ExprVal::Concat { left: Box::new(left), right: Box::new(right) }
                        }
                    },
                    _ => ExprVal::Concat { left: Box::new(left), right: Box::new(right) },
                }
            }
            ExprVal::NullCoalesce { left, right } => {
                let left = self.fold_expr(*left);
                let right = self.fold_expr(*right);
                match left.as_literal() {
                    Some(Value::Null) => return with_pos_filters(right, pos, filters, self),
                    Some(_) => return with_pos_filters(left, pos, filters, self),
                    None => ExprVal::NullCoalesce { left: Box::new(left), right: Box::new(right) },
                }
            }
            ExprVal::Conditional { test, if_true, if_false } => {
                let test = self.fold_expr(*test);
                let if_true = self.fold_expr(*if_true);
                let if_false = if_false.map(|e| Box::new(self.fold_expr(*e)));
                match test.as_literal() {
                    Some(v) if ops::is_truthy(&v) => {
                        return with_pos_filters(if_true, pos, filters, self);
                    }
                    Some(_) => match if_false {
                        Some(e) => return with_pos_filters(*e, pos, filters, self),
                        None => ExprVal::Conditional {
                            test: Box::new(test),
                            if_true: Box::new(if_true),
                            if_false: None,
                        },
                    },
                    None => ExprVal::Conditional {
                        test: Box::new(test),
                        if_true: Box::new(if_true),
                        if_false,
                    },
                }
            }
            ExprVal::Range { start, end } => {
                ExprVal::Range {
                    start: Box::new(self.fold_expr(*start)),
                    end: Box::new(self.fold_expr(*end)),
                }
            }
            ExprVal::Ident(name) => {
                match self.lookup_static(&name) {
                    Some(val) => val,
                    None => ExprVal::Ident(name),
                }
            }
            ExprVal::Getattr { value, attr } => {
                ExprVal::Getattr { value: Box::new(self.fold_expr(*value)), attr }
            }
            ExprVal::Getitem { value, key } => ExprVal::Getitem {
                value: Box::new(self.fold_expr(*value)),
                key: Box::new(self.fold_expr(*key)),
            },
            ExprVal::Slice { value, lower, upper, step } => ExprVal::Slice {
                value: Box::new(self.fold_expr(*value)),
                lower: lower.map(|e| Box::new(self.fold_expr(*e))),
                upper: upper.map(|e| Box::new(self.fold_expr(*e))),
                step: step.map(|e| Box::new(self.fold_expr(*e))),
            },
            ExprVal::OptionalChain { value, attr } => {
                ExprVal::OptionalChain { value: Box::new(self.fold_expr(*value)), attr }
            }
            ExprVal::List(items) => {
                ExprVal::List(items.into_iter().map(|e| self.fold_expr(e)).collect())
            }
            ExprVal::Tuple(items) => {
                ExprVal::Tuple(items.into_iter().map(|e| self.fold_expr(e)).collect())
            }
            ExprVal::SetLiteral(items) => {
                ExprVal::SetLiteral(items.into_iter().map(|e| self.fold_expr(e)).collect())
            }
            ExprVal::Dict(entries) => ExprVal::Dict(
                entries
                    .into_iter()
                    .map(|(k, v)| (self.fold_expr(k), self.fold_expr(v)))
                    .collect(),
            ),
            ExprVal::Test(test) => ExprVal::Test(TestExpr {
                expr: Box::new(self.fold_expr(*test.expr)),
                name: test.name,
                args: test.args.into_iter().map(|e| self.fold_expr(e)).collect(),
                negated: test.negated,
            }),
            ExprVal::FunctionCall(call) => ExprVal::FunctionCall(FunctionCall {
                namespace: call.namespace,
                name: call.name,
                args: call.args.into_iter().map(|e| self.fold_expr(e)).collect(),
                kwargs: call
                    .kwargs
                    .into_iter()
                    .map(|(k, v)| (k, self.fold_expr(v)))
                    .collect(),
            }),
            // folding never crosses an await
            ExprVal::Await(inner) => ExprVal::Await(Box::new(self.fold_expr(*inner))),
            literal => literal,
        };

        let filters =
            filters.into_iter().map(|f| self.fold_filter_call(f)).collect::<Vec<_>>();
        self.fold_filter_chain(Expr { val, pos, filters })
    }

    fn fold_filter_call(&self, filter: FilterCall) -> FilterCall {
        FilterCall {
            name: filter.name,
            args: filter.args.into_iter().map(|e| self.fold_expr(e)).collect(),
            kwargs: filter
                .kwargs
                .into_iter()
                .map(|(k, v)| (k, self.fold_expr(v)))
                .collect(),
        }
    }

    /// Evaluates a leading run of builtin pure filters over a literal base.
    fn fold_filter_chain(&self, expr: Expr) -> Expr {
        if expr.filters.is_empty() {
            return expr;
        }
        let Some(mut current) = expr.as_literal().or_else(|| {
            // base must be a literal even when filters are attached
            Expr { val: expr.val.clone(), pos: expr.pos, filters: Vec::new() }.as_literal()
        }) else {
            return expr;
        };

        let mut remaining = expr.filters.clone();
        let mut consumed = 0;
        for filter in &expr.filters {
            let args: Option<Vec<Value>> =
                filter.args.iter().map(|e| e.as_literal()).collect();
            let kwargs: Option<std::collections::HashMap<String, Value>> = filter
                .kwargs
                .iter()
                .map(|(k, v)| v.as_literal().map(|v| (k.clone(), v)))
                .collect();
            let (Some(args), Some(kwargs)) = (args, kwargs) else { break };

            match eval_const_filter(&filter.name, &current, &args, &kwargs) {
                Some(Ok(value)) => {
                    current = value;
                    consumed += 1;
                }
                // a failing filter keeps its error for run time
                _ => break,
            }
        }

        if consumed == 0 {
            return expr;
        }
        remaining.drain(..consumed);
        Expr { val: value_to_expr_val(current), pos: expr.pos, filters: remaining }
    }

    fn lookup_static(&self, name: &str) -> Option<ExprVal> {
        let ctx = self.options.static_context?;
        if self.bound.contains(name) {
            return None;
        }
        match ctx.get(name)? {
            Value::String(s) => Some(ExprVal::Str(s.clone())),
            Value::Bool(b) => Some(ExprVal::Bool(*b)),
            Value::Null => Some(ExprVal::Null),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(ExprVal::Int(i))
                } else {
                    n.as_f64().map(ExprVal::Float)
                }
            }
            // collections stay dynamic lookups
            _ => None,
        }
    }
}

/// Re-applies position and filters after substituting a subexpression for
/// the whole node (`??` and ternary short-circuits).
fn with_pos_filters(expr: Expr, pos: crate::errors::SourcePos, filters: Vec<FilterCall>, folder: &Folder) -> Expr {
    let mut merged = expr.filters;
    merged.extend(filters);
    folder.fold_filter_chain(Expr { val: expr.val, pos, filters: merged })
}

fn value_to_expr_val(value: Value) -> ExprVal {
    match value {
        Value::String(s) => ExprVal::Str(s),
        Value::Bool(b) => ExprVal::Bool(b),
        Value::Null => ExprVal::Null,
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ExprVal::Int(i)
            } else {
                ExprVal::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::Array(items) => ExprVal::List(
            items
                .into_iter()
                .map(|v| Expr::new(value_to_expr_val(v), Default::default()))
                .collect(),
        ),
        Value::Object(map) => ExprVal::Dict(
            map.into_iter()
                .map(|(k, v)| {
                    (
                        Expr::new(ExprVal::Str(k), Default::default()),
                        Expr::new(value_to_expr_val(v), Default::default()),
                    )
                })
                .collect(),
        ),
    }
}

/// Whether a body contains statements that write to a scope; inlining a
/// body with these would change what the bindings are attached to.
fn contains_scoped_statements(nodes: &[Node]) -> bool {
    nodes.iter().any(|node| match node {
        Node::Set(..) | Node::Capture(..) => true,
        Node::If(if_node, _) => {
            if_node.conditions.iter().any(|(_, _, body)| contains_scoped_statements(body))
                || if_node
                    .otherwise
                    .as_ref()
                    .is_some_and(|(_, body)| contains_scoped_statements(body))
        }
        Node::Forloop(_, forloop, _) => {
            contains_scoped_statements(&forloop.body)
                || forloop
                    .empty_body
                    .as_ref()
                    .is_some_and(|b| contains_scoped_statements(b))
        }
        Node::While(_, while_loop, _) => contains_scoped_statements(&while_loop.body),
        Node::Match(_, match_block, _) => {
            match_block.cases.iter().any(|c| contains_scoped_statements(&c.body))
        }
        Node::With(_, with, _) => contains_scoped_statements(&with.body),
        Node::Spaceless(_, body, _) => contains_scoped_statements(body),
        Node::FilterSection(_, section, _) => contains_scoped_statements(&section.body),
        _ => false,
    })
}

/// Replaces `{% if %}` nodes whose tests are literals with the branch
/// they select, when that cannot change scoping.
fn eliminate_dead_branches(nodes: Vec<Node>) -> Vec<Node> {
    let mut result = Vec::with_capacity(nodes.len());

    for node in nodes {
        match node {
            Node::If(if_node, end_ws) => {
                let mut conditions = Vec::new();
                let mut taken: Option<Vec<Node>> = None;

                for (ws, cond, body) in if_node.conditions {
                    match cond.as_literal() {
                        Some(v) if !ops::is_truthy(&v) => continue,
                        Some(_) if conditions.is_empty() => {
                            taken = Some(body);
                            break;
                        }
                        Some(_) => {
                            // a literal-true elif becomes the else of what
                            // remains
                            conditions.push((ws, cond, body));
                            break;
                        }
                        None => conditions.push((ws, cond, body)),
                    }
                }

                match taken {
                    Some(body) => {
                        let body = eliminate_dead_branches(body);
                        if contains_scoped_statements(&body) {
                            // keep a degenerate if: inlining would move
                            // the bindings up a scope
                            result.push(Node::If(
                                If {
                                    conditions: vec![(
                                        WS::default(),
                                        Expr::new(ExprVal::Bool(true), Default::default()),
                                        body,
                                    )],
                                    otherwise: None,
                                },
                                end_ws,
                            ));
                        } else {
                            result.extend(body);
                        }
                    }
                    None => {
                        let otherwise = if_node
                            .otherwise
                            .map(|(ws, body)| (ws, eliminate_dead_branches(body)));
                        if conditions.is_empty() {
                            if let Some((_, body)) = otherwise {
                                if contains_scoped_statements(&body) {
                                    result.push(Node::If(
                                        If {
                                            conditions: vec![(
                                                WS::default(),
                                                Expr::new(
                                                    ExprVal::Bool(true),
                                                    Default::default(),
                                                ),
                                                body,
                                            )],
                                            otherwise: None,
                                        },
                                        end_ws,
                                    ));
                                } else {
                                    result.extend(body);
                                }
                            }
                        } else {
                            let conditions = conditions
                                .into_iter()
                                .map(|(ws, cond, body)| {
                                    (ws, cond, eliminate_dead_branches(body))
                                })
                                .collect();
                            result.push(Node::If(If { conditions, otherwise }, end_ws));
                        }
                    }
                }
            }
            other => result.push(recurse_dead_branches(other)),
        }
    }

    result
}

fn recurse_dead_branches(node: Node) -> Node {
    match node {
        Node::Forloop(start_ws, mut forloop, end_ws) => {
            forloop.body = eliminate_dead_branches(forloop.body);
            forloop.empty_body = forloop.empty_body.map(eliminate_dead_branches);
            Node::Forloop(start_ws, forloop, end_ws)
        }
        Node::While(start_ws, mut while_loop, end_ws) => {
            while_loop.body = eliminate_dead_branches(while_loop.body);
            Node::While(start_ws, while_loop, end_ws)
        }
        Node::Match(start_ws, mut match_block, end_ws) => {
            match_block.cases = match_block
                .cases
                .into_iter()
                .map(|mut case| {
                    case.body = eliminate_dead_branches(case.body);
                    case
                })
                .collect();
            Node::Match(start_ws, match_block, end_ws)
        }
        Node::Block(start_ws, mut block, end_ws) => {
            block.body = eliminate_dead_branches(block.body);
            Node::Block(start_ws, block, end_ws)
        }
        Node::With(start_ws, mut with, end_ws) => {
            with.body = eliminate_dead_branches(with.body);
            Node::With(start_ws, with, end_ws)
        }
        Node::MacroDefinition(start_ws, mut def, end_ws) => {
            def.body = eliminate_dead_branches(def.body);
            Node::MacroDefinition(start_ws, def, end_ws)
        }
        Node::CallBlock(start_ws, mut call_block, end_ws) => {
            call_block.body = eliminate_dead_branches(call_block.body);
            Node::CallBlock(start_ws, call_block, end_ws)
        }
        Node::Capture(start_ws, mut capture, end_ws) => {
            capture.body = eliminate_dead_branches(capture.body);
            Node::Capture(start_ws, capture, end_ws)
        }
        Node::Cache(start_ws, mut cache, end_ws) => {
            cache.body = eliminate_dead_branches(cache.body);
            Node::Cache(start_ws, cache, end_ws)
        }
        Node::FilterSection(start_ws, mut section, end_ws) => {
            section.body = eliminate_dead_branches(section.body);
            Node::FilterSection(start_ws, section, end_ws)
        }
        Node::Slot(start_ws, mut slot, end_ws) => {
            slot.default_body = eliminate_dead_branches(slot.default_body);
            Node::Slot(start_ws, slot, end_ws)
        }
        Node::Embed(start_ws, mut embed, end_ws) => {
            embed.body = eliminate_dead_branches(embed.body);
            Node::Embed(start_ws, embed, end_ws)
        }
        Node::Spaceless(start_ws, body, end_ws) => {
            Node::Spaceless(start_ws, eliminate_dead_branches(body), end_ws)
        }
        other => other,
    }
}

/// Whether an expression may be part of a coalesced emit: literals, plain
/// lookups, and chains of pure filters over those.
fn is_simple_expr(expr: &Expr, options: &OptimizeOptions) -> bool {
    fn base_is_simple(val: &ExprVal, options: &OptimizeOptions) -> bool {
        match val {
            ExprVal::Str(_)
            | ExprVal::Int(_)
            | ExprVal::Float(_)
            | ExprVal::Bool(_)
            | ExprVal::Null
            | ExprVal::Ident(_) => true,
            ExprVal::Getattr { value, .. } => is_simple_expr(value, options),
            ExprVal::Getitem { value, key } => {
                is_simple_expr(value, options) && is_simple_expr(key, options)
            }
            _ => false,
        }
    }

    base_is_simple(&expr.val, options)
        && expr.filters.iter().all(|f| {
            options.is_pure_filter(&f.name)
                && f.args.iter().all(|a| is_simple_expr(a, options))
                && f.kwargs.values().all(|a| is_simple_expr(a, options))
        })
}

/// Merges runs of ≥ 2 adjacent data nodes / simple outputs into one emit.
fn coalesce_body(nodes: Vec<Node>, options: &OptimizeOptions) -> Vec<Node> {
    let mut result: Vec<Node> = Vec::with_capacity(nodes.len());
    // the run being accumulated, with the original nodes kept around in
    // case it stays too short to be worth merging
    let mut run: Vec<Node> = Vec::new();

    fn run_len(run: &[Node]) -> usize {
        run.iter().filter(|n| !matches!(n, Node::Comment(..))).count()
    }

    fn flush(run: &mut Vec<Node>, result: &mut Vec<Node>) {
        if run_len(run) >= 2 {
            let pos = run
                .iter()
                .find_map(|n| match n {
                    Node::Data(pos, _) | Node::Raw(_, pos, _, _) => Some(*pos),
                    Node::Output(_, expr) => Some(expr.pos),
                    _ => None,
                })
                .unwrap_or_default();
            let mut parts: Vec<EmitPart> = Vec::new();
            for node in run.drain(..) {
                match node {
                    Node::Data(_, text) | Node::Raw(_, _, text, _) => {
                        if let Some(EmitPart::Text(prev)) = parts.last_mut() {
                            prev.push_str(&text);
                        } else {
                            parts.push(EmitPart::Text(text));
                        }
                    }
                    Node::Output(_, expr) => match expr.as_literal() {
                        // escape-exempt literals render as plain text;
                        // strings keep their autoescape behavior
                        Some(v) if ops::escape_exempt(&v) => {
                            let text = crate::context::ValueRender::render(&v).into_owned();
                            if let Some(EmitPart::Text(prev)) = parts.last_mut() {
                                prev.push_str(&text);
                            } else {
                                parts.push(EmitPart::Text(text));
                            }
                        }
                        Some(Value::Null) => (),
                        _ => parts.push(EmitPart::Expr(expr)),
                    },
                    Node::Comment(..) => (),
                    _ => unreachable!("only coalesceable nodes enter a run"),
                }
            }
            result.push(Node::Emit(pos, parts));
        } else {
            result.append(run);
        }
    }

    for node in nodes {
        match node {
            Node::Data(..) | Node::Comment(..) => run.push(node),
            // raw blocks render as plain text so they join runs
            Node::Raw(..) => run.push(node),
            Node::Output(ws, expr) => {
                if is_simple_expr(&expr, options) {
                    run.push(Node::Output(ws, expr));
                } else {
                    flush(&mut run, &mut result);
                    result.push(Node::Output(ws, expr));
                }
            }
            other => {
                flush(&mut run, &mut result);
                result.push(recurse_coalesce(other, options));
            }
        }
    }
    flush(&mut run, &mut result);

    result
}

fn recurse_coalesce(node: Node, options: &OptimizeOptions) -> Node {
    match node {
        Node::If(if_node, end_ws) => {
            let conditions = if_node
                .conditions
                .into_iter()
                .map(|(ws, cond, body)| (ws, cond, coalesce_body(body, options)))
                .collect();
            let otherwise =
                if_node.otherwise.map(|(ws, body)| (ws, coalesce_body(body, options)));
            Node::If(If { conditions, otherwise }, end_ws)
        }
        Node::Forloop(start_ws, mut forloop, end_ws) => {
            forloop.body = coalesce_body(forloop.body, options);
            forloop.empty_body = forloop.empty_body.map(|b| coalesce_body(b, options));
            Node::Forloop(start_ws, forloop, end_ws)
        }
        Node::While(start_ws, mut while_loop, end_ws) => {
            while_loop.body = coalesce_body(while_loop.body, options);
            Node::While(start_ws, while_loop, end_ws)
        }
        Node::Match(start_ws, mut match_block, end_ws) => {
            match_block.cases = match_block
                .cases
                .into_iter()
                .map(|mut case| {
                    case.body = coalesce_body(case.body, options);
                    case
                })
                .collect();
            Node::Match(start_ws, match_block, end_ws)
        }
        Node::Block(start_ws, mut block, end_ws) => {
            block.body = coalesce_body(block.body, options);
            Node::Block(start_ws, block, end_ws)
        }
        Node::With(start_ws, mut with, end_ws) => {
            with.body = coalesce_body(with.body, options);
            Node::With(start_ws, with, end_ws)
        }
        Node::MacroDefinition(start_ws, mut def, end_ws) => {
            def.body = coalesce_body(def.body, options);
            Node::MacroDefinition(start_ws, def, end_ws)
        }
        Node::CallBlock(start_ws, mut call_block, end_ws) => {
            call_block.body = coalesce_body(call_block.body, options);
            Node::CallBlock(start_ws, call_block, end_ws)
        }
        Node::Capture(start_ws, mut capture, end_ws) => {
            capture.body = coalesce_body(capture.body, options);
            Node::Capture(start_ws, capture, end_ws)
        }
        Node::Cache(start_ws, mut cache, end_ws) => {
            cache.body = coalesce_body(cache.body, options);
            Node::Cache(start_ws, cache, end_ws)
        }
        Node::FilterSection(start_ws, mut section, end_ws) => {
            section.body = coalesce_body(section.body, options);
            Node::FilterSection(start_ws, section, end_ws)
        }
        Node::Slot(start_ws, mut slot, end_ws) => {
            slot.default_body = coalesce_body(slot.default_body, options);
            Node::Slot(start_ws, slot, end_ws)
        }
        Node::Embed(start_ws, mut embed, end_ws) => {
            embed.body = coalesce_body(embed.body, options);
            Node::Embed(start_ws, embed, end_ws)
        }
        Node::Spaceless(start_ws, body, end_ws) => {
            Node::Spaceless(start_ws, coalesce_body(body, options), end_ws)
        }
        other => other,
    }
}
