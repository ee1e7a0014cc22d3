//! Tokenizes template source, switching between data, expression,
//! statement and comment modes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result, SourcePos, SyntaxDetails};

/// The three delimiter pairs recognized in a template.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxConfig {
    pub variable_start: String,
    pub variable_end: String,
    pub block_start: String,
    pub block_end: String,
    pub comment_start: String,
    pub comment_end: String,
}

impl Default for SyntaxConfig {
    fn default() -> Self {
        SyntaxConfig {
            variable_start: "{{".to_string(),
            variable_end: "}}".to_string(),
            block_start: "{%".to_string(),
            block_end: "%}".to_string(),
            comment_start: "{#".to_string(),
            comment_end: "#}".to_string(),
        }
    }
}

/// A syntax config with its opening-delimiter scanner compiled.
///
/// Scanning for `variable_start|block_start|comment_start` as one compiled
/// alternation beats repeated substring searches by a wide margin on
/// data-heavy templates, so the pattern is built once and shared.
#[derive(Debug)]
pub struct CompiledSyntax {
    pub config: SyntaxConfig,
    opener_re: Regex,
}

impl CompiledSyntax {
    pub fn new(config: SyntaxConfig) -> Self {
        let pattern = format!(
            "{}|{}|{}",
            regex::escape(&config.block_start),
            regex::escape(&config.variable_start),
            regex::escape(&config.comment_start),
        );
        let opener_re = Regex::new(&pattern).unwrap();
        CompiledSyntax { config, opener_re }
    }
}

impl Default for CompiledSyntax {
    fn default() -> Self {
        CompiledSyntax::new(SyntaxConfig::default())
    }
}

lazy_static! {
    static ref DEFAULT_SYNTAX: Arc<CompiledSyntax> = Arc::new(CompiledSyntax::default());
}

/// Shared handle on the default `{{ }}` / `{% %}` / `{# #}` syntax.
pub fn default_syntax() -> Arc<CompiledSyntax> {
    DEFAULT_SYNTAX.clone()
}

/// Punctuation and operator symbols
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `//`
    FloorDiv,
    /// `%`
    Mod,
    /// `**`
    Pow,
    /// `~`
    Tilde,
    /// `==`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    Lte,
    /// `>=`
    Gte,
    /// `=`
    Assign,
    /// `(`
    LeftParen,
    /// `)`
    RightParen,
    /// `[`
    LeftBracket,
    /// `]`
    RightBracket,
    /// `{`
    LeftBrace,
    /// `}`
    RightBrace,
    /// `,`
    Comma,
    /// `:`
    Colon,
    /// `.`
    Dot,
    /// `..`
    Range,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::FloorDiv => "//",
            Operator::Mod => "%",
            Operator::Pow => "**",
            Operator::Tilde => "~",
            Operator::Eq => "==",
            Operator::NotEq => "!=",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Lte => "<=",
            Operator::Gte => ">=",
            Operator::Assign => "=",
            Operator::LeftParen => "(",
            Operator::RightParen => ")",
            Operator::LeftBracket => "[",
            Operator::RightBracket => "]",
            Operator::LeftBrace => "{",
            Operator::RightBrace => "}",
            Operator::Comma => ",",
            Operator::Colon => ":",
            Operator::Dot => ".",
            Operator::Range => "..",
        };
        write!(f, "{}", s)
    }
}

lazy_static! {
    // Fixed operator lookup. A master-regex alternation was measured
    // slower than this map, so symbol recognition goes longest-match
    // first through here.
    static ref OPERATORS: HashMap<&'static str, Operator> = {
        let mut m = HashMap::new();
        m.insert("//", Operator::FloorDiv);
        m.insert("**", Operator::Pow);
        m.insert("==", Operator::Eq);
        m.insert("!=", Operator::NotEq);
        m.insert("<=", Operator::Lte);
        m.insert(">=", Operator::Gte);
        m.insert("..", Operator::Range);
        m.insert("+", Operator::Add);
        m.insert("-", Operator::Sub);
        m.insert("*", Operator::Mul);
        m.insert("/", Operator::Div);
        m.insert("%", Operator::Mod);
        m.insert("~", Operator::Tilde);
        m.insert("<", Operator::Lt);
        m.insert(">", Operator::Gt);
        m.insert("=", Operator::Assign);
        m.insert("(", Operator::LeftParen);
        m.insert(")", Operator::RightParen);
        m.insert("[", Operator::LeftBracket);
        m.insert("]", Operator::RightBracket);
        m.insert("{", Operator::LeftBrace);
        m.insert("}", Operator::RightBrace);
        m.insert(",", Operator::Comma);
        m.insert(":", Operator::Colon);
        m.insert(".", Operator::Dot);
        m
    };
}

/// A single token with its starting position.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: SourcePos,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    /// Literal text outside of any delimiter
    Data(String),
    /// `{{`, with whether it was `{{-`
    VariableBegin { ws: bool },
    /// `}}`, with whether it was `-}}`
    VariableEnd { ws: bool },
    /// `{%` / `{%-`
    BlockBegin { ws: bool },
    /// `%}` / `-%}`
    BlockEnd { ws: bool },
    /// `{#` / `{#-`
    CommentBegin { ws: bool },
    /// `#}` / `-#}`
    CommentEnd { ws: bool },
    Name(String),
    Str(String),
    Int(i64),
    Float(f64),
    Operator(Operator),
    /// `|`
    Pipe,
    /// `|>`
    Pipeline,
    /// `??`
    NullCoalesce,
    /// `?.`
    OptionalChain,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenKind::Data(_) => write!(f, "data"),
            TokenKind::VariableBegin { .. } => write!(f, "`{{{{`"),
            TokenKind::VariableEnd { .. } => write!(f, "`}}}}`"),
            TokenKind::BlockBegin { .. } => write!(f, "`{{%`"),
            TokenKind::BlockEnd { .. } => write!(f, "`%}}`"),
            TokenKind::CommentBegin { .. } => write!(f, "`{{#`"),
            TokenKind::CommentEnd { .. } => write!(f, "`#}}`"),
            TokenKind::Name(name) => write!(f, "`{}`", name),
            TokenKind::Str(_) => write!(f, "a string"),
            TokenKind::Int(v) => write!(f, "`{}`", v),
            TokenKind::Float(v) => write!(f, "`{}`", v),
            TokenKind::Operator(op) => write!(f, "`{}`", op),
            TokenKind::Pipe => write!(f, "`|`"),
            TokenKind::Pipeline => write!(f, "`|>`"),
            TokenKind::NullCoalesce => write!(f, "`??`"),
            TokenKind::OptionalChain => write!(f, "`?.`"),
            TokenKind::Eof => write!(f, "end of template"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Mode {
    Data,
    Variable,
    Block,
}

/// The template lexer. Produces the whole token sequence at once, ending
/// in exactly one `Eof`.
pub struct Lexer<'s> {
    source: &'s str,
    syntax: &'s CompiledSyntax,
    pos: usize,
    line: usize,
    col: usize,
    mode: Mode,
    tokens: Vec<Token>,
}

/// Tokenizes `source` with the given syntax.
pub fn tokenize<'s>(source: &'s str, syntax: &'s CompiledSyntax) -> Result<Vec<Token>> {
    Lexer::new(source, syntax).run()
}

impl<'s> Lexer<'s> {
    pub fn new(source: &'s str, syntax: &'s CompiledSyntax) -> Self {
        Lexer { source, syntax, pos: 0, line: 1, col: 1, mode: Mode::Data, tokens: Vec::new() }
    }

    fn current_pos(&self) -> SourcePos {
        SourcePos::new(self.line, self.col)
    }

    fn error(&self, message: impl ToString) -> Error {
        Error::lexer(
            message,
            SyntaxDetails::from_source(self.source, self.current_pos(), None),
        )
    }

    fn rest(&self) -> &'s str {
        &self.source[self.pos..]
    }

    /// Consume `len` bytes, updating line/column counters.
    fn advance(&mut self, len: usize) {
        for c in self.source[self.pos..self.pos + len].chars() {
            if c == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
        self.pos += len;
    }

    fn push(&mut self, kind: TokenKind, pos: SourcePos) {
        self.tokens.push(Token { kind, pos });
    }

    fn run(mut self) -> Result<Vec<Token>> {
        while self.pos < self.source.len() {
            match self.mode {
                Mode::Data => self.lex_data()?,
                Mode::Variable | Mode::Block => {
                    self.lex_inside_delimiters()?;
                    // the body of `{% raw %}` is not scanned for tags
                    if self.mode == Mode::Data && self.just_closed_raw_tag() {
                        self.lex_raw_body()?;
                    }
                }
            }
        }

        if self.mode != Mode::Data {
            let what = if self.mode == Mode::Variable { "expression" } else { "statement" };
            return Err(self.error(format!("Unterminated {}: the closing delimiter is missing", what)));
        }

        let pos = self.current_pos();
        self.push(TokenKind::Eof, pos);
        Ok(self.tokens)
    }

    fn lex_data(&mut self) -> Result<()> {
        let config = &self.syntax.config;
        match self.syntax.opener_re.find(self.rest()) {
            Some(m) => {
                if m.start() > 0 {
                    let pos = self.current_pos();
                    let text = self.rest()[..m.start()].to_string();
                    self.advance(m.start());
                    self.push(TokenKind::Data(text), pos);
                }

                let pos = self.current_pos();
                let opener = m.as_str().to_string();
                self.advance(opener.len());
                let ws = self.rest().starts_with('-');
                if ws {
                    self.advance(1);
                }

                if opener == config.comment_start {
                    self.push(TokenKind::CommentBegin { ws }, pos);
                    self.lex_comment()?;
                } else if opener == config.variable_start {
                    self.push(TokenKind::VariableBegin { ws }, pos);
                    self.mode = Mode::Variable;
                } else {
                    self.push(TokenKind::BlockBegin { ws }, pos);
                    self.mode = Mode::Block;
                }
                Ok(())
            }
            None => {
                let pos = self.current_pos();
                let text = self.rest().to_string();
                self.advance(text.len());
                self.push(TokenKind::Data(text), pos);
                Ok(())
            }
        }
    }

    /// Consume everything up to the comment end delimiter. The contents
    /// produce no token, but line counting continues for error reporting.
    fn lex_comment(&mut self) -> Result<()> {
        let end = self.syntax.config.comment_end.clone();
        match self.rest().find(&end) {
            Some(idx) => {
                let ws = idx > 0 && self.rest().as_bytes()[idx - 1] == b'-';
                let content_len = if ws { idx - 1 } else { idx };
                self.advance(content_len);
                let pos = self.current_pos();
                self.advance(self.rest().find(&end).unwrap() + end.len());
                self.push(TokenKind::CommentEnd { ws }, pos);
                Ok(())
            }
            None => Err(self.error("Unterminated comment: `#}` is missing")),
        }
    }

    fn lex_inside_delimiters(&mut self) -> Result<()> {
        // skip whitespace
        let trimmed = self.rest().trim_start();
        let skipped = self.rest().len() - trimmed.len();
        if skipped > 0 {
            self.advance(skipped);
        }
        if self.pos >= self.source.len() {
            return Ok(());
        }

        let pos = self.current_pos();
        let rest = self.rest();
        let config = &self.syntax.config;

        // closing delimiter, possibly with a whitespace-control dash
        let (end_delim, end_token): (&str, fn(bool) -> TokenKind) = match self.mode {
            Mode::Variable => {
                (config.variable_end.as_str(), |ws| TokenKind::VariableEnd { ws })
            }
            _ => (config.block_end.as_str(), |ws| TokenKind::BlockEnd { ws }),
        };
        if rest.starts_with(end_delim) {
            let len = end_delim.len();
            self.advance(len);
            self.push(end_token(false), pos);
            self.mode = Mode::Data;
            return Ok(());
        }
        if rest.starts_with('-') && rest[1..].starts_with(end_delim) {
            let len = 1 + end_delim.len();
            self.advance(len);
            self.push(end_token(true), pos);
            self.mode = Mode::Data;
            return Ok(());
        }

        // the special two-char tokens of the expression grammar
        if rest.starts_with("|>") {
            self.advance(2);
            self.push(TokenKind::Pipeline, pos);
            return Ok(());
        }
        if rest.starts_with("??") {
            self.advance(2);
            self.push(TokenKind::NullCoalesce, pos);
            return Ok(());
        }
        if rest.starts_with("?.") {
            self.advance(2);
            self.push(TokenKind::OptionalChain, pos);
            return Ok(());
        }

        let first = rest.chars().next().unwrap();

        if first == '"' || first == '\'' {
            return self.lex_string(first);
        }

        if first.is_ascii_digit() {
            return self.lex_number();
        }

        if first.is_ascii_alphabetic() || first == '_' {
            let end = rest
                .char_indices()
                .find(|&(_, c)| !(c.is_ascii_alphanumeric() || c == '_'))
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            let name = rest[..end].to_string();
            self.advance(end);
            self.push(TokenKind::Name(name), pos);
            return Ok(());
        }

        if first == '|' {
            self.advance(1);
            self.push(TokenKind::Pipe, pos);
            return Ok(());
        }

        // operators, longest first
        for len in [3, 2, 1] {
            if rest.len() >= len && rest.is_char_boundary(len) {
                if let Some(op) = OPERATORS.get(&rest[..len]) {
                    self.advance(len);
                    self.push(TokenKind::Operator(*op), pos);
                    return Ok(());
                }
            }
        }

        Err(self.error(format!("Unexpected character `{}`", first)))
    }

    fn just_closed_raw_tag(&self) -> bool {
        let n = self.tokens.len();
        n >= 3
            && matches!(self.tokens[n - 1].kind, TokenKind::BlockEnd { .. })
            && matches!(&self.tokens[n - 2].kind, TokenKind::Name(name) if name == "raw")
            && matches!(self.tokens[n - 3].kind, TokenKind::BlockBegin { .. })
    }

    /// Emits everything up to the closing `{% endraw %}` / `{% end %}` as
    /// one data token, leaving the closing tag itself for normal lexing.
    fn lex_raw_body(&mut self) -> Result<()> {
        let start_tag = self.syntax.config.block_start.clone();
        let mut search_from = self.pos;

        loop {
            let Some(off) = self.source[search_from..].find(&start_tag) else {
                return Err(self.error("Unterminated `{% raw %}` block"));
            };
            let tag_pos = search_from + off;
            let mut after = tag_pos + start_tag.len();
            let bytes = self.source.as_bytes();
            if bytes.get(after) == Some(&b'-') {
                after += 1;
            }
            while after < bytes.len() && bytes[after].is_ascii_whitespace() {
                after += 1;
            }
            let rest = &self.source[after.min(self.source.len())..];
            let keyword_len = if rest.starts_with("endraw") {
                6
            } else if rest.starts_with("end") {
                3
            } else {
                0
            };
            let at_boundary = keyword_len > 0
                && rest[keyword_len..]
                    .chars()
                    .next()
                    .map_or(true, |c| !(c.is_ascii_alphanumeric() || c == '_'));

            if at_boundary {
                if tag_pos > self.pos {
                    let pos = self.current_pos();
                    let text = self.source[self.pos..tag_pos].to_string();
                    self.advance(tag_pos - self.pos);
                    self.push(TokenKind::Data(text), pos);
                }
                return Ok(());
            }
            search_from = tag_pos + start_tag.len();
        }
    }

    fn lex_string(&mut self, quote: char) -> Result<()> {
        let pos = self.current_pos();
        let mut value = String::new();
        let mut chars = self.rest().char_indices().skip(1).peekable();

        while let Some((idx, c)) = chars.next() {
            match c {
                c if c == quote => {
                    self.advance(idx + quote.len_utf8());
                    self.push(TokenKind::Str(value), pos);
                    return Ok(());
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, 'r')) => value.push('\r'),
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, '\'')) => value.push('\''),
                    Some((_, '"')) => value.push('"'),
                    Some((_, '0')) => value.push('\0'),
                    Some((_, other)) => {
                        return Err(self.error(format!("Bad escape sequence `\\{}` in string", other)));
                    }
                    None => break,
                },
                c => value.push(c),
            }
        }

        Err(self.error("Unterminated string"))
    }

    fn lex_number(&mut self) -> Result<()> {
        let pos = self.current_pos();
        let rest = self.rest();
        let bytes = rest.as_bytes();
        let mut end = 0;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }

        // a `.` continues a float unless it starts a `..` range
        let mut is_float = false;
        if end < bytes.len()
            && bytes[end] == b'.'
            && bytes.get(end + 1).is_some_and(u8::is_ascii_digit)
        {
            is_float = true;
            end += 1;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
        }

        let text = &rest[..end];
        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| self.error(format!("Invalid float literal `{}`", text)))?;
            self.advance(end);
            self.push(TokenKind::Float(value), pos);
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| self.error(format!("Integer literal `{}` is out of range", text)))?;
            self.advance(end);
            self.push(TokenKind::Int(value), pos);
        }
        Ok(())
    }
}
