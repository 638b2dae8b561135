//! Query translation for a bibliographic catalogue.
//!
//! Three surface formats describe the same query: the legacy URL filter
//! syntax, OQL ("Works where it's Open Access and year >= 2020") and the OQO
//! JSON object. Every format parses into [`oqo::Oqo`], which is canonicalized,
//! validated and then rendered to the other formats or compiled to SQL.

pub mod canonical;
pub mod config;
pub mod error;
pub mod executor;
pub mod format;
pub mod lexer;
pub mod oqo;
pub mod parser;
pub mod pipeline;
pub mod registry;
pub mod render;
pub mod render_tree;
pub mod sql_compiler;
pub mod token;
pub mod url_filter;
pub mod validate;

pub use error::{
    BackendError, CompileError, ConfigError, ExecuteError, ParseError, RenderError,
    TranslateError, ValidationErrors,
};
pub use oqo::{Filter, Operator, Oqo, SortOrder, Value};
pub use pipeline::{translate, QueryInput, Translation};
pub use registry::Registry;
