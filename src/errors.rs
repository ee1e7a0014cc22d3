//! The errors of Kida.

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Where in the template source an error was detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourcePos {
    /// 1-indexed line
    pub line: usize,
    /// 1-indexed column
    pub col: usize,
}

impl SourcePos {
    pub fn new(line: usize, col: usize) -> Self {
        SourcePos { line, col }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.col)
    }
}

/// Details attached to lexer/parser/compiler errors so messages can point
/// at the offending source.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SyntaxDetails {
    pub pos: SourcePos,
    /// The offending source line, if the source was still available
    pub snippet: Option<String>,
    /// A "Did you mean ...?" style hint
    pub suggestion: Option<String>,
}

impl SyntaxDetails {
    /// Extracts the source line at `pos` and builds the details for it.
    pub fn from_source(source: &str, pos: SourcePos, suggestion: Option<String>) -> Self {
        let snippet = source.lines().nth(pos.line.saturating_sub(1)).map(|l| l.to_string());
        SyntaxDetails { pos, snippet, suggestion }
    }

    fn write_caret(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref snippet) = self.snippet {
            writeln!(f)?;
            writeln!(f, "  {}", snippet)?;
            write!(f, "  {}^", " ".repeat(self.pos.col.saturating_sub(1)))?;
        }
        if let Some(ref suggestion) = self.suggestion {
            writeln!(f)?;
            write!(f, "  {}", suggestion)?;
        }
        Ok(())
    }
}

/// The kind of an error (non-exhaustive)
#[derive(Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Generic error
    Msg(String),
    /// An error while tokenizing a template: unterminated string, comment or
    /// construct, bad escape sequence
    Lexer {
        message: String,
        details: SyntaxDetails,
    },
    /// A syntactic mistake found while parsing
    Syntax {
        message: String,
        details: SyntaxDetails,
    },
    /// A semantic error found while compiling a well-formed AST:
    /// `extends` not first, duplicate block names, `recursive` in an
    /// async loop
    Compile {
        message: String,
        details: SyntaxDetails,
    },
    /// A failure while executing a template: include depth exceeded, sync
    /// render of an async template, bad operand types
    Runtime(String),
    /// A variable or path could not be resolved
    Undefined {
        /// The dotted path that failed to resolve
        path: String,
    },
    /// The loader doesn't know that template
    TemplateNotFound(String),
    /// A filter wasn't registered
    FilterNotFound(String),
    /// A test wasn't registered
    TestNotFound(String),
    /// A function wasn't registered
    FunctionNotFound(String),
    /// A macro was called but never defined or imported
    MacroNotFound(String),
    /// An error occurred while (de)serializing values
    Json(serde_json::Error),
    /// An IO error occurred in a loader or the bytecode cache
    Io(std::io::ErrorKind),
}

/// The Error type of Kida
#[derive(Debug)]
pub struct Error {
    /// Kind of error
    pub kind: ErrorKind,
    source: Option<Box<dyn StdError + Sync + Send>>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            ErrorKind::Msg(ref message) => write!(f, "{}", message),
            ErrorKind::Lexer { ref message, ref details } => {
                write!(f, "{} ({})", message, details.pos)?;
                details.write_caret(f)
            }
            ErrorKind::Syntax { ref message, ref details } => {
                write!(f, "{} ({})", message, details.pos)?;
                details.write_caret(f)
            }
            ErrorKind::Compile { ref message, ref details } => {
                write!(f, "{} ({})", message, details.pos)?;
                details.write_caret(f)
            }
            ErrorKind::Runtime(ref message) => write!(f, "{}", message),
            ErrorKind::Undefined { ref path } => {
                write!(f, "Variable `{}` not found in context while rendering", path)
            }
            ErrorKind::TemplateNotFound(ref name) => write!(f, "Template `{}` not found", name),
            ErrorKind::FilterNotFound(ref name) => write!(f, "Filter `{}` not found", name),
            ErrorKind::TestNotFound(ref name) => write!(f, "Test `{}` not found", name),
            ErrorKind::FunctionNotFound(ref name) => write!(f, "Function `{}` not found", name),
            ErrorKind::MacroNotFound(ref name) => write!(f, "Macro `{}` not found", name),
            ErrorKind::Json(ref e) => write!(f, "{}", e),
            ErrorKind::Io(ref io_error) => {
                write!(f, "Io error while writing rendered value to output: {:?}", io_error)
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_ref().map(|c| &**c as &(dyn StdError + 'static))
    }
}

impl Error {
    /// Creates generic error
    pub fn msg(value: impl ToString) -> Self {
        Self { kind: ErrorKind::Msg(value.to_string()), source: None }
    }

    /// Creates generic error with a cause
    pub fn chain(value: impl ToString, cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self { kind: ErrorKind::Msg(value.to_string()), source: Some(cause.into()) }
    }

    /// Creates a lexer error
    pub fn lexer(message: impl ToString, details: SyntaxDetails) -> Self {
        Self { kind: ErrorKind::Lexer { message: message.to_string(), details }, source: None }
    }

    /// Creates a parser error
    pub fn syntax(message: impl ToString, details: SyntaxDetails) -> Self {
        Self { kind: ErrorKind::Syntax { message: message.to_string(), details }, source: None }
    }

    /// Creates a compiler error
    pub fn compile(message: impl ToString, details: SyntaxDetails) -> Self {
        Self { kind: ErrorKind::Compile { message: message.to_string(), details }, source: None }
    }

    /// Creates a runtime error
    pub fn runtime(value: impl ToString) -> Self {
        Self { kind: ErrorKind::Runtime(value.to_string()), source: None }
    }

    /// Creates an undefined-variable error for the given dotted path
    pub fn undefined(path: impl ToString) -> Self {
        Self { kind: ErrorKind::Undefined { path: path.to_string() }, source: None }
    }

    /// Creates a template-not-found error
    pub fn template_not_found(tpl: impl ToString) -> Self {
        Self { kind: ErrorKind::TemplateNotFound(tpl.to_string()), source: None }
    }

    /// Creates a filter-not-found error
    pub fn filter_not_found(name: impl ToString) -> Self {
        Self { kind: ErrorKind::FilterNotFound(name.to_string()), source: None }
    }

    /// Creates a test-not-found error
    pub fn test_not_found(name: impl ToString) -> Self {
        Self { kind: ErrorKind::TestNotFound(name.to_string()), source: None }
    }

    /// Creates a function-not-found error
    pub fn function_not_found(name: impl ToString) -> Self {
        Self { kind: ErrorKind::FunctionNotFound(name.to_string()), source: None }
    }

    /// Creates a macro-not-found error
    pub fn macro_not_found(name: impl ToString) -> Self {
        Self { kind: ErrorKind::MacroNotFound(name.to_string()), source: None }
    }

    /// Creates JSON error (serialization/deserialization)
    pub fn json(value: serde_json::Error) -> Self {
        Self { kind: ErrorKind::Json(value), source: None }
    }

    /// Creates an IO error
    pub fn io_error(error: std::io::Error) -> Self {
        Self { kind: ErrorKind::Io(error.kind()), source: Some(Box::new(error)) }
    }

    /// Wraps this error with the template name and line it happened on,
    /// preserving the identity of undefined/not-found errors.
    pub fn enhance(self, template_name: &str, line: usize) -> Self {
        match self.kind {
            ErrorKind::Undefined { .. } | ErrorKind::TemplateNotFound(_) => {
                let message =
                    format!("Failed to render `{}` around line {}", template_name, line);
                Self { kind: self.kind, source: Some(Box::new(Error::msg(message))) }
            }
            _ => Error::chain(
                format!("Failed to render `{}` around line {}", template_name, line),
                self,
            ),
        }
    }

    /// Returns `true` for errors that unwind a render (as opposed to
    /// compile-time failures).
    pub fn is_runtime(&self) -> bool {
        matches!(self.kind, ErrorKind::Runtime(_) | ErrorKind::Undefined { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::io_error(error)
    }
}
impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Self::msg(e)
    }
}
impl From<String> for Error {
    fn from(e: String) -> Self {
        Self::msg(e)
    }
}
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::json(e)
    }
}

/// Convenient wrapper around std::Result
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_send_and_sync() {
        fn test_send_sync<T: Send + Sync>() {}
        test_send_sync::<Error>();
    }

    #[test]
    fn test_syntax_error_renders_caret() {
        let source = "{{ name | }}";
        let details =
            SyntaxDetails::from_source(source, SourcePos::new(1, 11), Some("Expected a filter name after `|`".to_string()));
        let err = Error::syntax("Unexpected token `}}`", details);
        let msg = err.to_string();
        assert!(msg.contains("{{ name | }}"));
        assert!(msg.contains('^'));
        assert!(msg.contains("Expected a filter name"));
    }

    #[test]
    fn test_enhance_keeps_undefined_identity() {
        let err = Error::undefined("page.title").enhance("index.html", 3);
        assert!(matches!(err.kind, ErrorKind::Undefined { .. }));
        assert!(err.source().is_some());
    }
}
