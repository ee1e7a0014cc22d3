//! # Kida
//!
//! A template engine with Jinja-flavored syntax, compiled templates,
//! streaming renders and static analysis.
//!
//! The shortest path from a template to a string:
//!
//! ```rust
//! use kida::{Context, Environment};
//!
//! let env = Environment::default();
//! let mut context = Context::new();
//! context.insert("name", "world");
//!
//! let rendered = env.render_str("Hello, {{ name }}!", &context).unwrap();
//! assert_eq!(rendered, "Hello, world!");
//! ```
//!
//! Templates are usually loaded by name through a [`Loader`] and cached
//! compiled; `{% extends %}`, `{% include %}`, `{% import %}` and
//! `{% def %}` macros all resolve through the same [`Environment`].

#[macro_use]
mod macros;

pub mod analysis;
mod builtins;
pub mod cache;
mod compiler;
mod context;
mod errors;
mod lexer;
mod loader;
mod optimizer;
mod parser;
mod renderer;
mod utils;

mod environment;

pub use crate::builtins::filters::Filter;
pub use crate::builtins::functions::{AsyncFunction, Function};
pub use crate::builtins::testers::Test;
pub use crate::compiler::CompiledTemplate;
pub use crate::context::Context;
pub use crate::environment::{EnvConfig, Environment, EscapeFn};
pub use crate::errors::{Error, ErrorKind, Result, SourcePos};
pub use crate::lexer::SyntaxConfig;
pub use crate::loader::{FileSystemLoader, LoadedSource, Loader, MapLoader};
pub use crate::parser::ast;
pub use crate::parser::parse;
pub use crate::renderer::{AsyncRenderStream, RenderStream};
pub use crate::utils::{escape_html, mark_safe};
