//! Turns the token stream into the template AST.
//!
//! Expressions go through a Pratt-style parser following the precedence
//! ladder (lowest to highest): ternary, `??`, `or`, `and`, `not`,
//! comparisons, `..`, `~`, additive, multiplicative, `**`, unary, postfix
//! (`()`, `[]`, `.`, `?.`, `|`, `|>`). Statements are dispatched on the
//! keyword following `{%`.

use std::collections::{HashMap, HashSet};

use lazy_static::lazy_static;

use crate::errors::{Error, Result, SourcePos, SyntaxDetails};
use crate::lexer::{tokenize, CompiledSyntax, Operator, Token, TokenKind};

pub mod ast;
pub mod whitespace;

#[cfg(test)]
mod tests;

use self::ast::*;
use self::whitespace::remove_whitespace;

lazy_static! {
    /// Tags that close or continue an open construct
    static ref TERMINATORS: HashSet<&'static str> = [
        "end", "endif", "endfor", "endblock", "endwhile", "endmatch", "enddef", "endcall",
        "endcapture", "endcache", "endfilter", "endslot", "endembed", "endspaceless", "endwith",
        "endraw", "elif", "else", "case",
    ]
    .into_iter()
    .collect();

    /// Common misspellings with their fix, used for error suggestions
    static ref SUGGESTIONS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("endfro", "endfor");
        m.insert("endofr", "endfor");
        m.insert("enfor", "endfor");
        m.insert("ednif", "endif");
        m.insert("endi", "endif");
        m.insert("elsif", "elif");
        m.insert("elseif", "elif");
        m.insert("endblok", "endblock");
        m.insert("endmacro", "enddef");
        m.insert("macro", "def");
        m
    };
}

/// The close tag a body parser stopped on
#[derive(Debug)]
struct EndTag {
    keyword: String,
    ws: bool,
    pos: SourcePos,
}

/// Parses a template with the default delimiters.
pub fn parse(source: &str) -> Result<Template> {
    let syntax = crate::lexer::default_syntax();
    parse_with_syntax(source, &syntax)
}

/// Parses a template with custom delimiters.
pub fn parse_with_syntax(source: &str, syntax: &CompiledSyntax) -> Result<Template> {
    let tokens = tokenize(source, syntax)?;
    let mut parser = Parser::new(source, tokens);
    let nodes = parser.parse_template()?;
    Ok(remove_whitespace(nodes, None))
}

pub struct Parser<'s> {
    source: &'s str,
    tokens: Vec<Token>,
    index: usize,
    /// Open constructs, for unterminated-block diagnostics
    open_blocks: Vec<(&'static str, SourcePos)>,
    /// Running count of `{% cache %}` blocks, to key anonymous ones
    cache_counter: usize,
}

impl<'s> Parser<'s> {
    pub fn new(source: &'s str, tokens: Vec<Token>) -> Self {
        Parser { source, tokens, index: 0, open_blocks: Vec::new(), cache_counter: 0 }
    }

    fn current(&self) -> &Token {
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> Token {
        let token = self.current().clone();
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
        token
    }

    fn error_at(&self, pos: SourcePos, message: impl ToString, suggestion: Option<String>) -> Error {
        Error::syntax(message, SyntaxDetails::from_source(self.source, pos, suggestion))
    }

    fn unexpected(&self, expected: &str) -> Error {
        let token = self.current();
        self.error_at(
            token.pos,
            format!("Unexpected {}, expected {}", token.kind, expected),
            None,
        )
    }

    fn expect_name(&mut self) -> Result<(String, SourcePos)> {
        match self.current().kind.clone() {
            TokenKind::Name(name) => {
                let pos = self.current().pos;
                self.bump();
                Ok((name, pos))
            }
            _ => Err(self.unexpected("an identifier")),
        }
    }

    fn eat_name(&mut self, keyword: &str) -> bool {
        if matches!(&self.current().kind, TokenKind::Name(n) if n == keyword) {
            self.bump();
            return true;
        }
        false
    }

    fn peek_name(&self, keyword: &str) -> bool {
        matches!(&self.current().kind, TokenKind::Name(n) if n == keyword)
    }

    fn peek_operator(&self, op: Operator) -> bool {
        self.current().kind == TokenKind::Operator(op)
    }

    fn eat_operator(&mut self, op: Operator) -> bool {
        if self.peek_operator(op) {
            self.bump();
            return true;
        }
        false
    }

    fn expect_operator(&mut self, op: Operator) -> Result<SourcePos> {
        if self.peek_operator(op) {
            let pos = self.current().pos;
            self.bump();
            Ok(pos)
        } else {
            Err(self.unexpected(&format!("`{}`", op)))
        }
    }

    /// Consumes the `%}` of the tag currently being parsed.
    fn expect_block_end(&mut self) -> Result<bool> {
        match self.current().kind {
            TokenKind::BlockEnd { ws } => {
                self.bump();
                Ok(ws)
            }
            _ => Err(self.unexpected("`%}`")),
        }
    }

    fn expect_variable_end(&mut self) -> Result<bool> {
        match self.current().kind {
            TokenKind::VariableEnd { ws } => {
                self.bump();
                Ok(ws)
            }
            _ => Err(self.unexpected("`}}`")),
        }
    }

    /// Parses a whole template; the only valid terminator is EOF.
    pub fn parse_template(&mut self) -> Result<Template> {
        let (nodes, end) = self.parse_body(&[])?;
        match end {
            None => Ok(nodes),
            Some(tag) => Err(self.error_at(
                tag.pos,
                format!("Found `{{% {} %}}` but there is no open block to close", tag.keyword),
                None,
            )),
        }
    }

    /// Parses nodes until EOF or until a `{%` tag whose keyword is in
    /// `stops`. The `{%` and the keyword are consumed; the rest of the
    /// close tag is the caller's to read.
    fn parse_body(&mut self, stops: &[&str]) -> Result<(Vec<Node>, Option<EndTag>)> {
        let mut nodes = Vec::new();

        loop {
            let token = self.current().clone();
            match token.kind {
                TokenKind::Eof => {
                    if stops.is_empty() {
                        return Ok((nodes, None));
                    }
                    let (name, pos) = self
                        .open_blocks
                        .last()
                        .copied()
                        .unwrap_or(("block", SourcePos::new(1, 1)));
                    return Err(self.error_at(
                        token.pos,
                        format!("File ended with open `{{% {} %}}` started at line {}", name, pos.line),
                        Some(format!("Did you forget `{{% end{} %}}`?", name)),
                    ));
                }
                TokenKind::Data(text) => {
                    self.bump();
                    nodes.push(Node::Data(token.pos, text));
                }
                TokenKind::CommentBegin { ws: left } => {
                    self.bump();
                    let right = match self.current().kind {
                        TokenKind::CommentEnd { ws } => ws,
                        _ => false,
                    };
                    self.bump();
                    nodes.push(Node::Comment(WS { left, right }, token.pos));
                }
                TokenKind::VariableBegin { ws: left } => {
                    self.bump();
                    let expr = self.parse_expression(true)?;
                    let right = self.expect_variable_end()?;
                    nodes.push(make_output(WS { left, right }, expr));
                }
                TokenKind::BlockBegin { ws } => {
                    self.bump();
                    let (keyword, kw_pos) = self.expect_name()?;

                    if stops.contains(&keyword.as_str()) {
                        return Ok((nodes, Some(EndTag { keyword, ws, pos: token.pos })));
                    }

                    if TERMINATORS.contains(keyword.as_str()) {
                        return Err(self.mismatched_terminator(&keyword, kw_pos));
                    }

                    let node = self.parse_statement(&keyword, kw_pos, ws)?;
                    nodes.push(node);
                }
                _ => return Err(self.unexpected("template content")),
            }
        }
    }

    fn mismatched_terminator(&self, keyword: &str, pos: SourcePos) -> Error {
        match self.open_blocks.last() {
            Some(&(open, open_pos)) => self.error_at(
                pos,
                format!(
                    "Found `{{% {} %}}` but the innermost open block is `{{% {} %}}` started at line {}",
                    keyword, open, open_pos.line
                ),
                Some(format!("Did you mean `{{% end{} %}}`?", open)),
            ),
            None => self.error_at(
                pos,
                format!("Found `{{% {} %}}` but there is no open block to close", keyword),
                None,
            ),
        }
    }

    fn parse_statement(&mut self, keyword: &str, pos: SourcePos, ws: bool) -> Result<Node> {
        match keyword {
            "if" => self.parse_if(pos, ws),
            "for" => self.parse_for(pos, ws, false),
            "async" => {
                if !self.eat_name("for") {
                    return Err(self.unexpected("`for` after `async`"));
                }
                self.parse_for(pos, ws, true)
            }
            "while" => self.parse_while(pos, ws),
            "match" => self.parse_match(pos, ws),
            "set" => self.parse_set(ws, SetScope::Leak),
            "let" => self.parse_set(ws, SetScope::Local),
            "export" => self.parse_set(ws, SetScope::Export),
            "block" => self.parse_block(pos, ws),
            "extends" => {
                let template = self.parse_expression(true)?;
                let right = self.expect_block_end()?;
                Ok(Node::Extends(WS { left: ws, right }, pos, template))
            }
            "include" => self.parse_include(ws),
            "import" => self.parse_import(ws),
            "from" => self.parse_from_import(ws),
            "with" => self.parse_with(pos, ws),
            "do" => {
                let expr = self.parse_expression(true)?;
                let right = self.expect_block_end()?;
                Ok(Node::Do(WS { left: ws, right }, expr))
            }
            "raw" => self.parse_raw(pos, ws),
            "def" => self.parse_def(pos, ws),
            "call" => self.parse_call_block(pos, ws),
            "capture" => self.parse_capture(pos, ws),
            "cache" => self.parse_cache(pos, ws),
            "filter" => self.parse_filter_section(pos, ws),
            "slot" => self.parse_slot(pos, ws),
            "embed" => self.parse_embed(pos, ws),
            "spaceless" => self.parse_spaceless(pos, ws),
            "break" => {
                let right = self.expect_block_end()?;
                Ok(Node::Break(WS { left: ws, right }, pos))
            }
            "continue" => {
                let right = self.expect_block_end()?;
                Ok(Node::Continue(WS { left: ws, right }, pos))
            }
            _ => {
                let suggestion = SUGGESTIONS
                    .get(keyword)
                    .map(|fix| format!("Did you mean `{{% {} %}}`?", fix));
                Err(self.error_at(pos, format!("Unknown tag `{{% {} %}}`", keyword), suggestion))
            }
        }
    }

    // ---- statement parsers ----

    fn parse_if(&mut self, pos: SourcePos, ws: bool) -> Result<Node> {
        self.open_blocks.push(("if", pos));
        let mut conditions = Vec::new();
        let mut otherwise = None;

        let mut tag_left_ws = ws;
        let end_ws;
        loop {
            let condition = self.parse_expression(true)?;
            let tag_right_ws = self.expect_block_end()?;
            let (body, end) =
                self.parse_body(&["elif", "else", "end", "endif"])?;
            conditions.push((WS { left: tag_left_ws, right: tag_right_ws }, condition, body));

            let tag = end.expect("parse_body returns a tag unless stops are empty");
            match tag.keyword.as_str() {
                "elif" => {
                    tag_left_ws = tag.ws;
                }
                "else" => {
                    let else_left = tag.ws;
                    let else_right = self.expect_block_end()?;
                    let (body, end) = self.parse_body(&["end", "endif"])?;
                    let end_tag = end.unwrap();
                    let right = self.expect_block_end()?;
                    otherwise = Some((WS { left: else_left, right: else_right }, body));
                    end_ws = WS { left: end_tag.ws, right };
                    break;
                }
                _ => {
                    let right = self.expect_block_end()?;
                    end_ws = WS { left: tag.ws, right };
                    break;
                }
            }
        }

        self.open_blocks.pop();
        Ok(Node::If(If { conditions, otherwise }, end_ws))
    }

    fn parse_for(&mut self, pos: SourcePos, ws: bool, is_async: bool) -> Result<Node> {
        self.open_blocks.push((if is_async { "async for" } else { "for" }, pos));

        let (first, _) = self.expect_name()?;
        let (key, value) = if self.eat_operator(Operator::Comma) {
            let (second, _) = self.expect_name()?;
            (Some(first), second)
        } else {
            (None, first)
        };

        if !self.eat_name("in") {
            return Err(self.unexpected("`in`"));
        }

        // ternary is disabled so an inline `if` filters items instead
        let container = self.parse_expression(false)?;

        let condition = if self.eat_name("if") {
            Some(Box::new(self.parse_expression(false)?))
        } else {
            None
        };

        let recursive = self.eat_name("recursive");
        if recursive && is_async {
            return Err(self.error_at(
                pos,
                "`recursive` is not supported in `{% async for %}` loops",
                None,
            ));
        }

        let start_right = self.expect_block_end()?;
        let (mut body, end) = self.parse_body(&["else", "end", "endfor"])?;
        let tag = end.unwrap();

        let (empty_body, end_tag_ws, end_right) = if tag.keyword == "else" {
            if tag.ws {
                trim_trailing_data(&mut body);
            }
            let else_right = self.expect_block_end()?;
            let (mut empty, end) = self.parse_body(&["end", "endfor"])?;
            if else_right {
                trim_leading_data(&mut empty);
            }
            let end_tag = end.unwrap();
            let right = self.expect_block_end()?;
            (Some(empty), end_tag.ws, right)
        } else {
            let right = self.expect_block_end()?;
            (None, tag.ws, right)
        };

        self.open_blocks.pop();
        Ok(Node::Forloop(
            WS { left: ws, right: start_right },
            Forloop {
                key,
                value,
                container,
                condition,
                body,
                empty_body,
                recursive,
                is_async,
                uses_loop: true,
                needs_len: true,
            },
            WS { left: end_tag_ws, right: end_right },
        ))
    }

    fn parse_while(&mut self, pos: SourcePos, ws: bool) -> Result<Node> {
        self.open_blocks.push(("while", pos));
        let condition = self.parse_expression(true)?;
        let start_right = self.expect_block_end()?;
        let (body, end) = self.parse_body(&["end", "endwhile"])?;
        let tag = end.unwrap();
        let right = self.expect_block_end()?;
        self.open_blocks.pop();
        Ok(Node::While(
            WS { left: ws, right: start_right },
            WhileLoop { condition, body },
            WS { left: tag.ws, right },
        ))
    }

    fn parse_match(&mut self, pos: SourcePos, ws: bool) -> Result<Node> {
        self.open_blocks.push(("match", pos));
        let subject = self.parse_expression(true)?;
        let start_right = self.expect_block_end()?;

        // Only whitespace may sit between `{% match %}` and the first case
        let (between, end) = self.parse_body(&["case", "end", "endmatch"])?;
        for node in &between {
            match node {
                Node::Data(pos, text) if !text.trim().is_empty() => {
                    return Err(self.error_at(
                        *pos,
                        "Only whitespace and comments are allowed between `{% match %}` and the first `{% case %}`",
                        None,
                    ));
                }
                Node::Data(..) | Node::Comment(..) => (),
                _ => {
                    return Err(self.error_at(
                        pos,
                        "Only whitespace and comments are allowed between `{% match %}` and the first `{% case %}`",
                        None,
                    ));
                }
            }
        }

        let mut tag = end.unwrap();
        let mut cases: Vec<MatchCase> = Vec::new();
        let end_ws = loop {
            if tag.ws {
                if let Some(last) = cases.last_mut() {
                    trim_trailing_data(&mut last.body);
                }
            }
            if tag.keyword != "case" {
                let right = self.expect_block_end()?;
                break WS { left: tag.ws, right };
            }

            let pattern = if self.peek_name("_") {
                self.bump();
                CasePattern::Wildcard
            } else {
                let expr = self.parse_expression(false)?;
                if !expr.is_literal() {
                    return Err(self.error_at(
                        expr.pos,
                        "`{% case %}` patterns must be literals or `_`",
                        None,
                    ));
                }
                CasePattern::Literal(expr)
            };
            let guard =
                if self.eat_name("if") { Some(self.parse_expression(false)?) } else { None };
            let case_right = self.expect_block_end()?;

            let (mut body, end) = self.parse_body(&["case", "end", "endmatch"])?;
            if case_right {
                trim_leading_data(&mut body);
            }
            cases.push(MatchCase { pattern, guard, body });
            tag = end.unwrap();
        };

        self.open_blocks.pop();
        Ok(Node::Match(
            WS { left: ws, right: start_right },
            Match { subject, cases },
            end_ws,
        ))
    }

    fn parse_set(&mut self, ws: bool, scope: SetScope) -> Result<Node> {
        let (key, _) = self.expect_name()?;
        self.expect_operator(Operator::Assign)?;
        let value = self.parse_expression(true)?;
        let right = self.expect_block_end()?;
        Ok(Node::Set(WS { left: ws, right }, Set { key, value, scope }))
    }

    fn parse_block(&mut self, pos: SourcePos, ws: bool) -> Result<Node> {
        self.open_blocks.push(("block", pos));
        let (name, name_pos) = self.expect_name()?;
        let mut scoped = false;
        let mut required = false;
        loop {
            if self.eat_name("scoped") {
                scoped = true;
            } else if self.eat_name("required") {
                required = true;
            } else {
                break;
            }
        }
        let start_right = self.expect_block_end()?;

        let (body, end) = self.parse_body(&["end", "endblock"])?;
        let tag = end.unwrap();
        // `{% endblock name %}` is accepted and verified
        if let TokenKind::Name(ref end_name) = self.current().kind {
            if *end_name != name {
                let end_name = end_name.clone();
                return Err(self.error_at(
                    self.current().pos,
                    format!(
                        "Was expecting block `{}` to be closed, but `{}` is closing instead",
                        name, end_name
                    ),
                    None,
                ));
            }
            self.bump();
        }
        let right = self.expect_block_end()?;

        self.open_blocks.pop();
        Ok(Node::Block(
            WS { left: ws, right: start_right },
            Block { name, body, scoped, required, pos: name_pos },
            WS { left: tag.ws, right },
        ))
    }

    fn parse_include(&mut self, ws: bool) -> Result<Node> {
        let template = self.parse_expression(false)?;

        let mut ignore_missing = false;
        let mut with_context = true;
        loop {
            if self.eat_name("ignore") {
                if !self.eat_name("missing") {
                    return Err(self.unexpected("`missing` after `ignore`"));
                }
                ignore_missing = true;
            } else if self.eat_name("with") {
                if !self.eat_name("context") {
                    return Err(self.unexpected("`context` after `with`"));
                }
                with_context = true;
            } else if self.eat_name("without") {
                if !self.eat_name("context") {
                    return Err(self.unexpected("`context` after `without`"));
                }
                with_context = false;
            } else {
                break;
            }
        }

        let right = self.expect_block_end()?;
        Ok(Node::Include(
            WS { left: ws, right },
            Include { template, ignore_missing, with_context },
        ))
    }

    fn parse_import(&mut self, ws: bool) -> Result<Node> {
        let template = self.parse_expression(false)?;
        if !self.eat_name("as") {
            return Err(self.unexpected("`as`"));
        }
        let (target, _) = self.expect_name()?;
        let right = self.expect_block_end()?;
        Ok(Node::Import(WS { left: ws, right }, Import { template, target }))
    }

    fn parse_from_import(&mut self, ws: bool) -> Result<Node> {
        let template = self.parse_expression(false)?;
        if !self.eat_name("import") {
            return Err(self.unexpected("`import`"));
        }
        let mut names = Vec::new();
        loop {
            let (name, _) = self.expect_name()?;
            let alias = if self.eat_name("as") { Some(self.expect_name()?.0) } else { None };
            names.push((name, alias));
            if !self.eat_operator(Operator::Comma) {
                break;
            }
        }
        let right = self.expect_block_end()?;
        Ok(Node::FromImport(WS { left: ws, right }, FromImport { template, names }))
    }

    fn parse_with(&mut self, pos: SourcePos, ws: bool) -> Result<Node> {
        self.open_blocks.push(("with", pos));
        let mut assignments = Vec::new();
        loop {
            let (name, _) = self.expect_name()?;
            self.expect_operator(Operator::Assign)?;
            let value = self.parse_expression(true)?;
            assignments.push((name, value));
            if !self.eat_operator(Operator::Comma) {
                break;
            }
        }
        let start_right = self.expect_block_end()?;
        let (body, end) = self.parse_body(&["end", "endwith"])?;
        let tag = end.unwrap();
        let right = self.expect_block_end()?;
        self.open_blocks.pop();
        Ok(Node::With(
            WS { left: ws, right: start_right },
            With { assignments, body },
            WS { left: tag.ws, right },
        ))
    }

    fn parse_raw(&mut self, pos: SourcePos, ws: bool) -> Result<Node> {
        self.open_blocks.push(("raw", pos));
        let start_right = self.expect_block_end()?;

        let (content, content_pos) = match self.current().kind.clone() {
            TokenKind::Data(text) => {
                let pos = self.current().pos;
                self.bump();
                (text, pos)
            }
            _ => (String::new(), self.current().pos),
        };

        let (_, end) = self.parse_body(&["end", "endraw"])?;
        let tag = end.unwrap();
        let right = self.expect_block_end()?;
        self.open_blocks.pop();

        Ok(Node::Raw(
            WS { left: ws, right: start_right },
            content_pos,
            content,
            WS { left: tag.ws, right },
        ))
    }

    fn parse_def(&mut self, pos: SourcePos, ws: bool) -> Result<Node> {
        self.open_blocks.push(("def", pos));
        let (name, name_pos) = self.expect_name()?;
        self.expect_operator(Operator::LeftParen)?;

        let mut params: Vec<MacroParam> = Vec::new();
        let mut vararg = None;
        let mut kwarg = None;
        let mut seen_default = false;

        if !self.eat_operator(Operator::RightParen) {
            loop {
                if self.eat_operator(Operator::Pow) {
                    kwarg = Some(self.expect_name()?.0);
                } else if self.eat_operator(Operator::Mul) {
                    vararg = Some(self.expect_name()?.0);
                } else {
                    let (param_name, param_pos) = self.expect_name()?;
                    if params.iter().any(|p| p.name == param_name) {
                        return Err(self.error_at(
                            param_pos,
                            format!("Duplicate parameter `{}` in macro `{}`", param_name, name),
                            None,
                        ));
                    }
                    let annotation = if self.eat_operator(Operator::Colon) {
                        Some(self.expect_name()?.0)
                    } else {
                        None
                    };
                    let default = if self.eat_operator(Operator::Assign) {
                        seen_default = true;
                        Some(self.parse_expression(true)?)
                    } else {
                        if seen_default {
                            return Err(self.error_at(
                                param_pos,
                                format!(
                                    "Parameter `{}` without a default cannot follow parameters with defaults",
                                    param_name
                                ),
                                None,
                            ));
                        }
                        None
                    };
                    params.push(MacroParam { name: param_name, annotation, default });
                }

                if !self.eat_operator(Operator::Comma) {
                    break;
                }
            }
            self.expect_operator(Operator::RightParen)?;
        }

        let start_right = self.expect_block_end()?;
        let (body, end) = self.parse_body(&["end", "enddef"])?;
        let tag = end.unwrap();
        // `{% enddef name %}` is accepted
        if let TokenKind::Name(_) = self.current().kind {
            self.bump();
        }
        let right = self.expect_block_end()?;
        self.open_blocks.pop();

        Ok(Node::MacroDefinition(
            WS { left: ws, right: start_right },
            MacroDefinition { name, params, vararg, kwarg, body, pos: name_pos },
            WS { left: tag.ws, right },
        ))
    }

    fn parse_call_block(&mut self, pos: SourcePos, ws: bool) -> Result<Node> {
        self.open_blocks.push(("call", pos));
        let callee = self.parse_expression(false)?;
        let call = match callee.val {
            ExprVal::FunctionCall(call) => call,
            _ => {
                return Err(self.error_at(
                    callee.pos,
                    "`{% call %}` expects a macro call, e.g. `{% call list_item(3) %}`",
                    None,
                ));
            }
        };
        let start_right = self.expect_block_end()?;
        let (body, end) = self.parse_body(&["end", "endcall"])?;
        let tag = end.unwrap();
        let right = self.expect_block_end()?;
        self.open_blocks.pop();
        Ok(Node::CallBlock(
            WS { left: ws, right: start_right },
            CallBlock { call, body, pos },
            WS { left: tag.ws, right },
        ))
    }

    fn parse_capture(&mut self, pos: SourcePos, ws: bool) -> Result<Node> {
        self.open_blocks.push(("capture", pos));
        let (name, _) = self.expect_name()?;
        let start_right = self.expect_block_end()?;
        let (body, end) = self.parse_body(&["end", "endcapture"])?;
        let tag = end.unwrap();
        let right = self.expect_block_end()?;
        self.open_blocks.pop();
        Ok(Node::Capture(
            WS { left: ws, right: start_right },
            Capture { name, body },
            WS { left: tag.ws, right },
        ))
    }

    fn parse_cache(&mut self, pos: SourcePos, ws: bool) -> Result<Node> {
        self.open_blocks.push(("cache", pos));
        let key = self.parse_expression(false)?;
        let ttl = if self.eat_name("ttl") {
            self.expect_operator(Operator::Assign)?;
            Some(self.parse_expression(false)?)
        } else {
            None
        };
        let start_right = self.expect_block_end()?;
        let (body, end) = self.parse_body(&["end", "endcache"])?;
        let tag = end.unwrap();
        let right = self.expect_block_end()?;
        self.open_blocks.pop();

        let index = self.cache_counter;
        self.cache_counter += 1;
        Ok(Node::Cache(
            WS { left: ws, right: start_right },
            CacheBlock { key, ttl, body, index },
            WS { left: tag.ws, right },
        ))
    }

    fn parse_filter_section(&mut self, pos: SourcePos, ws: bool) -> Result<Node> {
        self.open_blocks.push(("filter", pos));
        let mut filters = vec![self.parse_filter_call()?];
        while matches!(self.current().kind, TokenKind::Pipe | TokenKind::Pipeline) {
            self.bump();
            filters.push(self.parse_filter_call()?);
        }
        let start_right = self.expect_block_end()?;
        let (body, end) = self.parse_body(&["end", "endfilter"])?;
        let tag = end.unwrap();
        let right = self.expect_block_end()?;
        self.open_blocks.pop();
        Ok(Node::FilterSection(
            WS { left: ws, right: start_right },
            FilterSection { filters, body },
            WS { left: tag.ws, right },
        ))
    }

    fn parse_slot(&mut self, pos: SourcePos, ws: bool) -> Result<Node> {
        self.open_blocks.push(("slot", pos));
        let (name, _) = self.expect_name()?;
        let start_right = self.expect_block_end()?;
        let (default_body, end) = self.parse_body(&["end", "endslot"])?;
        let tag = end.unwrap();
        let right = self.expect_block_end()?;
        self.open_blocks.pop();
        Ok(Node::Slot(
            WS { left: ws, right: start_right },
            Slot { name, default_body },
            WS { left: tag.ws, right },
        ))
    }

    fn parse_embed(&mut self, pos: SourcePos, ws: bool) -> Result<Node> {
        self.open_blocks.push(("embed", pos));
        let template = self.parse_expression(false)?;
        let start_right = self.expect_block_end()?;
        let (body, end) = self.parse_body(&["end", "endembed"])?;
        let tag = end.unwrap();
        let right = self.expect_block_end()?;
        self.open_blocks.pop();
        Ok(Node::Embed(
            WS { left: ws, right: start_right },
            Embed { template, body },
            WS { left: tag.ws, right },
        ))
    }

    fn parse_spaceless(&mut self, pos: SourcePos, ws: bool) -> Result<Node> {
        self.open_blocks.push(("spaceless", pos));
        let start_right = self.expect_block_end()?;
        let (body, end) = self.parse_body(&["end", "endspaceless"])?;
        let tag = end.unwrap();
        let right = self.expect_block_end()?;
        self.open_blocks.pop();
        Ok(Node::Spaceless(
            WS { left: ws, right: start_right },
            body,
            WS { left: tag.ws, right },
        ))
    }

    // ---- expression parsing ----

    /// Entry point of the Pratt parser. `allow_ternary` is disabled where
    /// a trailing `if` belongs to the surrounding tag (for-loops, cases).
    pub fn parse_expression(&mut self, allow_ternary: bool) -> Result<Expr> {
        let expr = self.parse_null_coalesce()?;

        if allow_ternary && self.peek_name("if") {
            let pos = expr.pos;
            self.bump();
            let test = self.parse_null_coalesce()?;
            let if_false = if self.eat_name("else") {
                Some(Box::new(self.parse_expression(true)?))
            } else {
                None
            };
            return Ok(Expr::new(
                ExprVal::Conditional { test: Box::new(test), if_true: Box::new(expr), if_false },
                pos,
            ));
        }

        Ok(expr)
    }

    fn parse_null_coalesce(&mut self) -> Result<Expr> {
        let mut expr = self.parse_or()?;
        while self.current().kind == TokenKind::NullCoalesce {
            let pos = expr.pos;
            self.bump();
            let right = self.parse_or()?;
            expr = Expr::new(
                ExprVal::NullCoalesce { left: Box::new(expr), right: Box::new(right) },
                pos,
            );
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut expr = self.parse_and()?;
        while self.peek_name("or") {
            let pos = expr.pos;
            self.bump();
            let rhs = self.parse_and()?;
            expr = Expr::new(
                ExprVal::Logic(LogicExpr {
                    lhs: Box::new(expr),
                    rhs: Box::new(rhs),
                    operator: LogicOperator::Or,
                }),
                pos,
            );
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut expr = self.parse_not()?;
        while self.peek_name("and") {
            let pos = expr.pos;
            self.bump();
            let rhs = self.parse_not()?;
            expr = Expr::new(
                ExprVal::Logic(LogicExpr {
                    lhs: Box::new(expr),
                    rhs: Box::new(rhs),
                    operator: LogicOperator::And,
                }),
                pos,
            );
        }
        Ok(expr)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek_name("not") {
            let pos = self.current().pos;
            self.bump();
            let operand = self.parse_not()?;
            return Ok(Expr::new(ExprVal::Not(Box::new(operand)), pos));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_comparand()?;
        let mut comparisons = Vec::new();

        loop {
            let op = match &self.current().kind {
                TokenKind::Operator(Operator::Eq) => CompareOperator::Eq,
                TokenKind::Operator(Operator::NotEq) => CompareOperator::NotEq,
                TokenKind::Operator(Operator::Lt) => CompareOperator::Lt,
                TokenKind::Operator(Operator::Gt) => CompareOperator::Gt,
                TokenKind::Operator(Operator::Lte) => CompareOperator::Lte,
                TokenKind::Operator(Operator::Gte) => CompareOperator::Gte,
                TokenKind::Name(n) if n == "in" => CompareOperator::In,
                TokenKind::Name(n) if n == "not" => {
                    // only `not in` continues a comparison
                    if matches!(
                        self.tokens.get(self.index + 1).map(|t| &t.kind),
                        Some(TokenKind::Name(next)) if next == "in"
                    ) {
                        self.bump();
                        CompareOperator::NotIn
                    } else {
                        break;
                    }
                }
                _ => break,
            };
            self.bump();
            let rhs = self.parse_comparand()?;
            comparisons.push((op, rhs));
        }

        if comparisons.is_empty() {
            return Ok(lhs);
        }
        let pos = lhs.pos;
        Ok(Expr::new(ExprVal::Compare(CompareExpr { lhs: Box::new(lhs), comparisons }), pos))
    }

    /// One comparison operand, with any `is` tests bound to it.
    fn parse_comparand(&mut self) -> Result<Expr> {
        let mut expr = self.parse_range()?;

        while self.peek_name("is") {
            let pos = expr.pos;
            self.bump();
            let negated = self.eat_name("not");
            let (name, _) = self.expect_name()?;
            let args = if self.eat_operator(Operator::LeftParen) {
                let mut args = Vec::new();
                if !self.eat_operator(Operator::RightParen) {
                    loop {
                        args.push(self.parse_expression(true)?);
                        if !self.eat_operator(Operator::Comma) {
                            break;
                        }
                    }
                    self.expect_operator(Operator::RightParen)?;
                }
                args
            } else {
                // bare literal arg form: `is divisibleby 3`
                match self.current().kind {
                    TokenKind::Int(_) | TokenKind::Float(_) | TokenKind::Str(_) => {
                        vec![self.parse_primary()?]
                    }
                    _ => Vec::new(),
                }
            };
            expr = Expr::new(
                ExprVal::Test(TestExpr { expr: Box::new(expr), name, args, negated }),
                pos,
            );
        }

        Ok(expr)
    }

    fn parse_range(&mut self) -> Result<Expr> {
        let expr = self.parse_concat()?;
        if self.eat_operator(Operator::Range) {
            let pos = expr.pos;
            let end = self.parse_concat()?;
            return Ok(Expr::new(
                ExprVal::Range { start: Box::new(expr), end: Box::new(end) },
                pos,
            ));
        }
        Ok(expr)
    }

    fn parse_concat(&mut self) -> Result<Expr> {
        let mut expr = self.parse_additive()?;
        while self.eat_operator(Operator::Tilde) {
            let pos = expr.pos;
            let right = self.parse_additive()?;
            expr =
                Expr::new(ExprVal::Concat { left: Box::new(expr), right: Box::new(right) }, pos);
        }
        Ok(expr)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut expr = self.parse_multiplicative()?;
        loop {
            let operator = match self.current().kind {
                TokenKind::Operator(Operator::Add) => MathOperator::Add,
                TokenKind::Operator(Operator::Sub) => MathOperator::Sub,
                _ => break,
            };
            let pos = expr.pos;
            self.bump();
            let rhs = self.parse_multiplicative()?;
            expr = Expr::new(
                ExprVal::Math(MathExpr { lhs: Box::new(expr), rhs: Box::new(rhs), operator }),
                pos,
            );
        }
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut expr = self.parse_power()?;
        loop {
            let operator = match self.current().kind {
                TokenKind::Operator(Operator::Mul) => MathOperator::Mul,
                TokenKind::Operator(Operator::Div) => MathOperator::Div,
                TokenKind::Operator(Operator::FloorDiv) => MathOperator::FloorDiv,
                TokenKind::Operator(Operator::Mod) => MathOperator::Mod,
                _ => break,
            };
            let pos = expr.pos;
            self.bump();
            let rhs = self.parse_power()?;
            expr = Expr::new(
                ExprVal::Math(MathExpr { lhs: Box::new(expr), rhs: Box::new(rhs), operator }),
                pos,
            );
        }
        Ok(expr)
    }

    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_unary()?;
        if self.eat_operator(Operator::Pow) {
            let pos = base.pos;
            // right-associative
            let exp = self.parse_power()?;
            return Ok(Expr::new(
                ExprVal::Math(MathExpr {
                    lhs: Box::new(base),
                    rhs: Box::new(exp),
                    operator: MathOperator::Pow,
                }),
                pos,
            ));
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let pos = self.current().pos;
        if self.eat_operator(Operator::Sub) {
            let operand = self.parse_unary()?;
            // constant-fold the sign right away for plain literals
            return Ok(match operand.val {
                ExprVal::Int(i) if operand.filters.is_empty() => {
                    Expr::new(ExprVal::Int(-i), pos)
                }
                ExprVal::Float(f) if operand.filters.is_empty() => {
                    Expr::new(ExprVal::Float(-f), pos)
                }
                _ => Expr::new(
                    ExprVal::Math(MathExpr {
                        lhs: Box::new(Expr::new(ExprVal::Int(0), pos)),
                        rhs: Box::new(operand),
                        operator: MathOperator::Sub,
                    }),
                    pos,
                ),
            });
        }
        if self.eat_operator(Operator::Add) {
            return self.parse_unary();
        }
        if self.peek_name("await") {
            self.bump();
            let operand = self.parse_unary()?;
            return Ok(Expr::new(ExprVal::Await(Box::new(operand)), pos));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.current().kind {
                TokenKind::Operator(Operator::Dot) => {
                    self.bump();
                    let pos = expr.pos;
                    let attr = match self.current().kind.clone() {
                        TokenKind::Name(name) => {
                            self.bump();
                            name
                        }
                        // `a.0` tuple-style index access
                        TokenKind::Int(i) => {
                            self.bump();
                            i.to_string()
                        }
                        _ => return Err(self.unexpected("an attribute name after `.`")),
                    };
                    expr = Expr::new(ExprVal::Getattr { value: Box::new(expr), attr }, pos);
                }
                TokenKind::OptionalChain => {
                    self.bump();
                    let pos = expr.pos;
                    let (attr, _) = self.expect_name()?;
                    expr = Expr::new(ExprVal::OptionalChain { value: Box::new(expr), attr }, pos);
                }
                TokenKind::Operator(Operator::LeftBracket) => {
                    self.bump();
                    expr = self.parse_subscript(expr)?;
                }
                TokenKind::Operator(Operator::LeftParen) => {
                    self.bump();
                    expr = self.parse_call(expr)?;
                }
                TokenKind::Pipe | TokenKind::Pipeline => {
                    self.bump();
                    let filter = self.parse_filter_call()?;
                    expr.filters.push(filter);
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    /// Everything after `value[`: a plain key or a slice.
    fn parse_subscript(&mut self, value: Expr) -> Result<Expr> {
        let pos = value.pos;

        let lower = if self.peek_operator(Operator::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expression(true)?))
        };

        if self.eat_operator(Operator::Colon) {
            let upper = if self.peek_operator(Operator::Colon)
                || self.peek_operator(Operator::RightBracket)
            {
                None
            } else {
                Some(Box::new(self.parse_expression(true)?))
            };
            let step = if self.eat_operator(Operator::Colon) {
                if self.peek_operator(Operator::RightBracket) {
                    None
                } else {
                    Some(Box::new(self.parse_expression(true)?))
                }
            } else {
                None
            };
            self.expect_operator(Operator::RightBracket)?;
            return Ok(Expr::new(
                ExprVal::Slice { value: Box::new(value), lower, upper, step },
                pos,
            ));
        }

        let key = lower.expect("non-slice subscript always has a key");
        self.expect_operator(Operator::RightBracket)?;
        Ok(Expr::new(ExprVal::Getitem { value: Box::new(value), key }, pos))
    }

    /// Everything after `callee(`. Only names and single-level attribute
    /// paths (imported macros) are callable.
    fn parse_call(&mut self, callee: Expr) -> Result<Expr> {
        let pos = callee.pos;
        let (namespace, name) = match callee.val {
            ExprVal::Ident(name) => (None, name),
            ExprVal::Getattr { value, attr } => match value.val {
                ExprVal::Ident(ns) => (Some(ns), attr),
                _ => {
                    return Err(self.error_at(
                        pos,
                        "Only functions, macros and imported macros can be called",
                        None,
                    ));
                }
            },
            _ => {
                return Err(self.error_at(
                    pos,
                    "Only functions, macros and imported macros can be called",
                    None,
                ));
            }
        };

        let (args, kwargs) = self.parse_call_args()?;
        Ok(Expr::new(
            ExprVal::FunctionCall(FunctionCall { namespace, name, args, kwargs }),
            pos,
        ))
    }

    /// Arguments up to and including the closing paren.
    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, HashMap<String, Expr>)> {
        let mut args = Vec::new();
        let mut kwargs = HashMap::new();

        if self.eat_operator(Operator::RightParen) {
            return Ok((args, kwargs));
        }

        loop {
            // a kwarg is `name=` lookahead
            let is_kwarg = matches!(self.current().kind, TokenKind::Name(_))
                && matches!(
                    self.tokens.get(self.index + 1).map(|t| &t.kind),
                    Some(TokenKind::Operator(Operator::Assign))
                );

            if is_kwarg {
                let (name, name_pos) = self.expect_name()?;
                self.expect_operator(Operator::Assign)?;
                let value = self.parse_expression(true)?;
                if kwargs.insert(name.clone(), value).is_some() {
                    return Err(self.error_at(
                        name_pos,
                        format!("Duplicate keyword argument `{}`", name),
                        None,
                    ));
                }
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error_at(
                        self.current().pos,
                        "Positional arguments cannot follow keyword arguments",
                        None,
                    ));
                }
                args.push(self.parse_expression(true)?);
            }

            if !self.eat_operator(Operator::Comma) {
                break;
            }
        }

        self.expect_operator(Operator::RightParen)?;
        Ok((args, kwargs))
    }

    fn parse_filter_call(&mut self) -> Result<FilterCall> {
        let (name, _) = self.expect_name()?;
        let (args, kwargs) = if self.eat_operator(Operator::LeftParen) {
            self.parse_call_args()?
        } else {
            (Vec::new(), HashMap::new())
        };
        Ok(FilterCall { name, args, kwargs })
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Int(i) => {
                self.bump();
                Ok(Expr::new(ExprVal::Int(i), token.pos))
            }
            TokenKind::Float(f) => {
                self.bump();
                Ok(Expr::new(ExprVal::Float(f), token.pos))
            }
            TokenKind::Str(s) => {
                self.bump();
                Ok(Expr::new(ExprVal::Str(s), token.pos))
            }
            TokenKind::Name(name) => {
                self.bump();
                let val = match name.as_str() {
                    "true" | "True" => ExprVal::Bool(true),
                    "false" | "False" => ExprVal::Bool(false),
                    "none" | "None" | "null" => ExprVal::Null,
                    _ => ExprVal::Ident(name),
                };
                Ok(Expr::new(val, token.pos))
            }
            TokenKind::Operator(Operator::LeftParen) => {
                self.bump();
                if self.eat_operator(Operator::RightParen) {
                    return Ok(Expr::new(ExprVal::Tuple(Vec::new()), token.pos));
                }
                let first = self.parse_expression(true)?;
                if self.eat_operator(Operator::Comma) {
                    let mut items = vec![first];
                    while !self.peek_operator(Operator::RightParen) {
                        items.push(self.parse_expression(true)?);
                        if !self.eat_operator(Operator::Comma) {
                            break;
                        }
                    }
                    self.expect_operator(Operator::RightParen)?;
                    return Ok(Expr::new(ExprVal::Tuple(items), token.pos));
                }
                self.expect_operator(Operator::RightParen)?;
                Ok(first)
            }
            TokenKind::Operator(Operator::LeftBracket) => {
                self.bump();
                let mut items = Vec::new();
                while !self.peek_operator(Operator::RightBracket) {
                    items.push(self.parse_expression(true)?);
                    if !self.eat_operator(Operator::Comma) {
                        break;
                    }
                }
                self.expect_operator(Operator::RightBracket)?;
                Ok(Expr::new(ExprVal::List(items), token.pos))
            }
            TokenKind::Operator(Operator::LeftBrace) => {
                self.bump();
                if self.eat_operator(Operator::RightBrace) {
                    return Ok(Expr::new(ExprVal::Dict(Vec::new()), token.pos));
                }

                // `{k: v}` is a dict, `{a, b}` a set literal
                let first = self.parse_expression(true)?;
                if self.eat_operator(Operator::Colon) {
                    let mut entries = vec![(first, self.parse_expression(true)?)];
                    while self.eat_operator(Operator::Comma) {
                        if self.peek_operator(Operator::RightBrace) {
                            break;
                        }
                        let key = self.parse_expression(true)?;
                        self.expect_operator(Operator::Colon)?;
                        let value = self.parse_expression(true)?;
                        entries.push((key, value));
                    }
                    self.expect_operator(Operator::RightBrace)?;
                    return Ok(Expr::new(ExprVal::Dict(entries), token.pos));
                }

                let mut items = vec![first];
                while self.eat_operator(Operator::Comma) {
                    if self.peek_operator(Operator::RightBrace) {
                        break;
                    }
                    items.push(self.parse_expression(true)?);
                }
                self.expect_operator(Operator::RightBrace)?;
                Ok(Expr::new(ExprVal::SetLiteral(items), token.pos))
            }
            _ => Err(self.unexpected("an expression")),
        }
    }
}

/// Trims trailing whitespace off the last data node of a body.
fn trim_trailing_data(body: &mut Vec<Node>) {
    if let Some(Node::Data(_, text)) = body.last_mut() {
        *text = text.trim_end().to_string();
        if text.is_empty() {
            body.pop();
        }
    }
}

/// Trims leading whitespace off the first data node of a body.
fn trim_leading_data(body: &mut Vec<Node>) {
    if let Some(Node::Data(_, text)) = body.first_mut() {
        *text = text.trim_start().to_string();
        if text.is_empty() {
            body.remove(0);
        }
    }
}

/// `{{ super() }}` becomes its own node so block rendering can dispatch on
/// it without evaluating a call.
fn make_output(ws: WS, expr: Expr) -> Node {
    if let ExprVal::FunctionCall(ref call) = expr.val {
        if call.namespace.is_none()
            && call.name == "super"
            && call.args.is_empty()
            && call.kwargs.is_empty()
            && expr.filters.is_empty()
        {
            return Node::Super;
        }
    }
    Node::Output(ws, expr)
}
