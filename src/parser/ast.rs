//! The nodes a template is parsed into. Nodes are built once by the
//! parser and never mutated afterwards; the optimizer and compiler produce
//! rewritten copies instead.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::SourcePos;

/// Whether to remove the whitespace of a `{% %}` tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WS {
    /// `true` if the tag is `{%-`
    pub left: bool,
    /// `true` if the tag is `-%}`
    pub right: bool,
}

/// All math operators
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MathOperator {
    /// +
    Add,
    /// -
    Sub,
    /// *
    Mul,
    /// /
    Div,
    /// //
    FloorDiv,
    /// %
    Mod,
    /// **
    Pow,
}

impl fmt::Display for MathOperator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                MathOperator::Add => "+",
                MathOperator::Sub => "-",
                MathOperator::Mul => "*",
                MathOperator::Div => "/",
                MathOperator::FloorDiv => "//",
                MathOperator::Mod => "%",
                MathOperator::Pow => "**",
            }
        )
    }
}

/// `and` / `or`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicOperator {
    And,
    Or,
}

impl fmt::Display for LogicOperator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", if *self == LogicOperator::And { "and" } else { "or" })
    }
}

/// The comparison operators, including membership
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOperator {
    Eq,
    NotEq,
    Lt,
    Gt,
    Lte,
    Gte,
    In,
    NotIn,
}

impl fmt::Display for CompareOperator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                CompareOperator::Eq => "==",
                CompareOperator::NotEq => "!=",
                CompareOperator::Lt => "<",
                CompareOperator::Gt => ">",
                CompareOperator::Lte => "<=",
                CompareOperator::Gte => ">=",
                CompareOperator::In => "in",
                CompareOperator::NotIn => "not in",
            }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MathExpr {
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
    pub operator: MathOperator,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogicExpr {
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
    pub operator: LogicOperator,
}

/// A possibly-chained comparison: `a < b <= c` holds `a` and
/// `[(Lt, b), (Lte, c)]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompareExpr {
    pub lhs: Box<Expr>,
    pub comparisons: Vec<(CompareOperator, Expr)>,
}

/// One application in a filter chain: `upper`, `truncate(20)`,
/// `default(value="n/a")`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterCall {
    pub name: String,
    pub args: Vec<Expr>,
    pub kwargs: HashMap<String, Expr>,
}

impl FilterCall {
    pub fn plain(name: &str) -> Self {
        FilterCall { name: name.to_string(), args: Vec::new(), kwargs: HashMap::new() }
    }
}

/// A call to a function, a macro, or a namespaced (imported) macro.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// `m` in `m.my_macro(...)`, when calling through an import target
    pub namespace: Option<String>,
    pub name: String,
    pub args: Vec<Expr>,
    pub kwargs: HashMap<String, Expr>,
}

/// A test application: `x is odd`, `y is not divisibleby(3)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestExpr {
    pub expr: Box<Expr>,
    pub name: String,
    pub args: Vec<Expr>,
    pub negated: bool,
}

/// The value part of an expression, without filters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExprVal {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    Ident(String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    /// `{1, 2, 3}`: deduplicated on evaluation
    SetLiteral(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    /// `a.b` — subscript lookup first, attribute style second
    Getattr {
        value: Box<Expr>,
        attr: String,
    },
    /// `a[key]`
    Getitem {
        value: Box<Expr>,
        key: Box<Expr>,
    },
    /// `a[1:10:2]`
    Slice {
        value: Box<Expr>,
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    /// `a?.b` — undefined when `a` is nullish instead of raising
    OptionalChain {
        value: Box<Expr>,
        attr: String,
    },
    Math(MathExpr),
    Logic(LogicExpr),
    Compare(CompareExpr),
    Not(Box<Expr>),
    /// `a ~ b` string concatenation
    Concat {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `1..10`
    Range {
        start: Box<Expr>,
        end: Box<Expr>,
    },
    /// `a ?? b`
    NullCoalesce {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `a if cond else b`; without `else` the result is undefined when the
    /// condition is false
    Conditional {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Option<Box<Expr>>,
    },
    Test(TestExpr),
    FunctionCall(FunctionCall),
    /// `await expr`; taints the template async
    Await(Box<Expr>),
}

/// An expression with its source position and the filters piped on it
/// (both `|` and `|>` chains end up here, in application order).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub val: ExprVal,
    pub pos: SourcePos,
    pub filters: Vec<FilterCall>,
}

impl Expr {
    pub fn new(val: ExprVal, pos: SourcePos) -> Self {
        Expr { val, pos, filters: Vec::new() }
    }

    pub fn with_filters(val: ExprVal, pos: SourcePos, filters: Vec<FilterCall>) -> Self {
        Expr { val, pos, filters }
    }

    /// Whether this is a literal with no filters attached
    pub fn is_literal(&self) -> bool {
        self.filters.is_empty()
            && matches!(
                self.val,
                ExprVal::Str(_)
                    | ExprVal::Int(_)
                    | ExprVal::Float(_)
                    | ExprVal::Bool(_)
                    | ExprVal::Null
            )
    }

    /// The literal as a `serde_json::Value`, when [`Expr::is_literal`]
    pub fn as_literal(&self) -> Option<serde_json::Value> {
        if !self.filters.is_empty() {
            return None;
        }
        match &self.val {
            ExprVal::Str(s) => Some(serde_json::Value::String(s.clone())),
            ExprVal::Int(i) => Some(serde_json::Value::Number((*i).into())),
            ExprVal::Float(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number),
            ExprVal::Bool(b) => Some(serde_json::Value::Bool(*b)),
            ExprVal::Null => Some(serde_json::Value::Null),
            _ => None,
        }
    }

    /// Whether the expression contains an `await` anywhere
    pub fn contains_await(&self) -> bool {
        fn walk(val: &ExprVal) -> bool {
            match val {
                ExprVal::Await(_) => true,
                ExprVal::Getattr { value, .. } | ExprVal::OptionalChain { value, .. } => {
                    value.contains_await()
                }
                ExprVal::Getitem { value, key } => value.contains_await() || key.contains_await(),
                ExprVal::Slice { value, lower, upper, step } => {
                    value.contains_await()
                        || [lower, upper, step]
                            .iter()
                            .any(|e| e.as_deref().is_some_and(Expr::contains_await))
                }
                ExprVal::Math(m) => m.lhs.contains_await() || m.rhs.contains_await(),
                ExprVal::Logic(l) => l.lhs.contains_await() || l.rhs.contains_await(),
                ExprVal::Compare(c) => {
                    c.lhs.contains_await() || c.comparisons.iter().any(|(_, e)| e.contains_await())
                }
                ExprVal::Not(e) => e.contains_await(),
                ExprVal::Concat { left, right }
                | ExprVal::NullCoalesce { left, right }
                | ExprVal::Range { start: left, end: right } => {
                    left.contains_await() || right.contains_await()
                }
                ExprVal::Conditional { test, if_true, if_false } => {
                    test.contains_await()
                        || if_true.contains_await()
                        || if_false.as_deref().is_some_and(Expr::contains_await)
                }
                ExprVal::Test(t) => {
                    t.expr.contains_await() || t.args.iter().any(Expr::contains_await)
                }
                ExprVal::FunctionCall(call) => {
                    call.args.iter().any(Expr::contains_await)
                        || call.kwargs.values().any(Expr::contains_await)
                }
                ExprVal::List(items) | ExprVal::Tuple(items) | ExprVal::SetLiteral(items) => {
                    items.iter().any(Expr::contains_await)
                }
                ExprVal::Dict(entries) => {
                    entries.iter().any(|(k, v)| k.contains_await() || v.contains_await())
                }
                _ => false,
            }
        }

        walk(&self.val)
            || self.filters.iter().any(|f| {
                f.args.iter().any(Expr::contains_await)
                    || f.kwargs.values().any(Expr::contains_await)
            })
    }
}

/// An if/elif/elif/else construct
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct If {
    /// First item is the if, all the ones after are elif
    pub conditions: Vec<(WS, Expr, Vec<Node>)>,
    /// The optional `else` block
    pub otherwise: Option<(WS, Vec<Node>)>,
}

/// A for loop, sync or async
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Forloop {
    /// Name of the key when iterating on map-like objects
    pub key: Option<String>,
    /// Name of the local variable for the value in the loop
    pub value: String,
    /// Expression being iterated on
    pub container: Expr,
    /// An inline `if` filtering items, `{% for x in xs if x > 1 %}`
    pub condition: Option<Box<Expr>>,
    pub body: Vec<Node>,
    /// The `{% else %}` body, rendered when the container is empty
    pub empty_body: Option<Vec<Node>>,
    /// `{% for ... recursive %}`; the body may call `loop(children)`
    pub recursive: bool,
    /// `{% async for %}`; taints the template async
    pub is_async: bool,
    /// Set by the compiler: whether the body reads `loop.*` at all.
    /// Conservatively true until the static scan has run.
    pub uses_loop: bool,
    /// Set by the compiler: whether `loop.length`/`last`/`revindex`/
    /// `nextitem` force the iterable to be fully counted up front
    pub needs_len: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WhileLoop {
    pub condition: Expr,
    pub body: Vec<Node>,
}

/// A `{% case %}` arm of a match block
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchCase {
    pub pattern: CasePattern,
    pub guard: Option<Expr>,
    pub body: Vec<Node>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CasePattern {
    /// A literal to compare the subject against
    Literal(Expr),
    /// `{% case _ %}`
    Wildcard,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub subject: Expr,
    pub cases: Vec<MatchCase>,
}

/// How far an assignment reaches
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetScope {
    /// `{% set %}`: visible after the enclosing block/loop ends
    Leak,
    /// `{% let %}`: dropped with the current scope
    Local,
    /// `{% export %}`: like `let`, and visible to importers
    Export,
}

/// Any of `{% set %}`, `{% let %}`, `{% export %}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Set {
    pub key: String,
    pub value: Expr,
    pub scope: SetScope,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub body: Vec<Node>,
    /// Whether the block sees surrounding loop variables when overridden
    pub scoped: bool,
    /// Whether a child template must override this block
    pub required: bool,
    pub pos: SourcePos,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Include {
    pub template: Expr,
    pub ignore_missing: bool,
    pub with_context: bool,
}

/// `{% import "macros.html" as m %}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Import {
    pub template: Expr,
    pub target: String,
}

/// `{% from "macros.html" import a, b as c %}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FromImport {
    pub template: Expr,
    /// (exported name, local alias)
    pub names: Vec<(String, Option<String>)>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct With {
    pub assignments: Vec<(String, Expr)>,
    pub body: Vec<Node>,
}

/// One parameter of a macro signature
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MacroParam {
    pub name: String,
    /// Validation hint only, never enforced at run time
    pub annotation: Option<String>,
    pub default: Option<Expr>,
}

/// `{% def name(params) %}` macro definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MacroDefinition {
    pub name: String,
    pub params: Vec<MacroParam>,
    /// `*args` catch-all name
    pub vararg: Option<String>,
    /// `**kwargs` catch-all name
    pub kwarg: Option<String>,
    pub body: Vec<Node>,
    pub pos: SourcePos,
}

/// `{% call m.item(3) %}body{% end %}` — the body becomes the macro's
/// `caller()`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallBlock {
    pub call: FunctionCall,
    pub body: Vec<Node>,
    pub pos: SourcePos,
}

/// `{% capture name %}...{% end %}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Capture {
    pub name: String,
    pub body: Vec<Node>,
}

/// `{% cache key ttl=30 %}...{% end %}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheBlock {
    pub key: Expr,
    pub ttl: Option<Expr>,
    pub body: Vec<Node>,
    /// Position of this cache block in the template, to keep the keys of
    /// anonymous blocks distinct
    pub index: usize,
}

/// `{% filter upper | trim %}...{% end %}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterSection {
    pub filters: Vec<FilterCall>,
    pub body: Vec<Node>,
}

/// `{% slot name %}default{% end %}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub name: String,
    pub default_body: Vec<Node>,
}

/// `{% embed "card.html" %}{% block title %}...{% end %}{% end %}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    pub template: Expr,
    pub body: Vec<Node>,
}

/// One piece of a coalesced emit run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EmitPart {
    Text(String),
    /// An output expression, still subject to autoescaping
    Expr(Expr),
}

/// All nodes a template can contain
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Node {
    /// Literal template text
    Data(SourcePos, String),
    /// The text between `{% raw %}` and `{% end %}`, not re-scanned
    Raw(WS, SourcePos, String, WS),
    /// A `{{ }}` output
    Output(WS, Expr),
    /// A run of adjacent data/simple outputs merged by the optimizer
    Emit(SourcePos, Vec<EmitPart>),
    /// A call to `{{ super() }}` in a block
    Super,
    If(If, WS),
    Forloop(WS, Forloop, WS),
    While(WS, WhileLoop, WS),
    Match(WS, Match, WS),
    Set(WS, Set),
    Block(WS, Block, WS),
    /// `{% extends "base.html" %}`; must be the first non-data,
    /// non-comment node of the template
    Extends(WS, SourcePos, Expr),
    Include(WS, Include),
    Import(WS, Import),
    FromImport(WS, FromImport),
    With(WS, With, WS),
    /// Evaluate and discard
    Do(WS, Expr),
    MacroDefinition(WS, MacroDefinition, WS),
    CallBlock(WS, CallBlock, WS),
    Capture(WS, Capture, WS),
    Cache(WS, CacheBlock, WS),
    FilterSection(WS, FilterSection, WS),
    Slot(WS, Slot, WS),
    Embed(WS, Embed, WS),
    Spaceless(WS, Vec<Node>, WS),
    Break(WS, SourcePos),
    Continue(WS, SourcePos),
    /// Only whitespace flags survive of a comment
    Comment(WS, SourcePos),
}

/// The root of a parsed template
pub type Template = Vec<Node>;
