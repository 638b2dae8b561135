//! Error types for every stage of the query pipeline.

use crate::token::Span;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Malformed URL, OQL or OQO-JSON input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("unknown entity `{fragment}` at {span}")]
    UnknownEntity { fragment: String, span: Span },

    #[error("unknown column `{fragment}` at {span}")]
    UnknownColumn { fragment: String, span: Span },

    #[error("expected an operator after `{column}`, found `{fragment}` at {span}")]
    MissingOperator {
        column: String,
        fragment: String,
        span: Span,
    },

    #[error("expected a value, found `{fragment}` at {span}")]
    MissingValue { fragment: String, span: Span },

    #[error("{message}: `{fragment}` at {span}")]
    Unexpected {
        message: String,
        fragment: String,
        span: Span,
    },

    #[error("unexpected end of input: {message}")]
    UnexpectedEnd { message: String },

    #[error("invalid URL filter `{field}:{fragment}`: {message}")]
    UrlFilter {
        field: String,
        fragment: String,
        message: String,
    },

    #[error("invalid URL parameter `{param}`: {message}")]
    UrlParam { param: String, message: String },

    #[error("invalid OQO JSON: {message}")]
    Json { message: String },
}

impl ParseError {
    /// Builds an `Unexpected` error pointing at `span` within `source`.
    pub(crate) fn unexpected(message: impl Into<String>, source: &str, span: Span) -> Self {
        ParseError::Unexpected {
            message: message.into(),
            fragment: fragment(source, span),
            span,
        }
    }

    /// Byte span of the offending input, when the error is positional.
    pub fn span(&self) -> Option<Span> {
        match self {
            ParseError::UnknownEntity { span, .. }
            | ParseError::UnknownColumn { span, .. }
            | ParseError::MissingOperator { span, .. }
            | ParseError::MissingValue { span, .. }
            | ParseError::Unexpected { span, .. } => Some(*span),
            _ => None,
        }
    }
}

pub(crate) fn fragment(source: &str, span: Span) -> String {
    source
        .get(span.start..span.end)
        .unwrap_or_default()
        .to_string()
}

/// Category of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    UnknownEntity,
    UnknownColumn,
    InvalidOperator,
    EmptyBranch,
    InvalidSortColumn,
    InvalidSortOrder,
    InvalidSample,
}

/// One validation finding, tagged with the path of the offending node
/// (e.g. `filter_rows[1].filters[0]`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub path: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Every violation found in a well-formed but invalid OQO.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("query failed validation with {} error(s): {}", .issues.len(), join_issues(.issues))]
pub struct ValidationErrors {
    pub issues: Vec<ValidationIssue>,
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A valid OQO that the requested surface syntax cannot express.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderError {
    #[error("URL syntax cannot express an OR across columns: {}", .columns.join(", "))]
    CrossFieldOr { columns: Vec<String> },

    #[error("URL syntax cannot express a nested group at depth {depth}")]
    NestedBranch { depth: usize },

    #[error("URL syntax cannot express mixed operators inside an OR on `{column}`")]
    MixedOrOperators { column: String },

    #[error("URL syntax cannot express `{column}` {operator} {value}")]
    UnsupportedLeaf {
        column: String,
        operator: String,
        value: String,
    },
}

/// The relational compiler could not resolve the request against the
/// registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// Registry and compiler disagree; this is a programming or configuration
    /// fault rather than bad user input.
    #[error("compiler precondition failed: {0}")]
    Precondition(String),
}

/// Problems loading the registry configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read registry file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse registry JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid registry: {0}")]
    Invalid(String),
}

/// Failure reported by a relational backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("statement timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("backend error: {0}")]
    Query(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Failure of the parse → canonicalize → validate pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TranslateError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Validation(#[from] ValidationErrors),
}

impl TranslateError {
    /// Where in the input a parse error occurred.
    pub fn span(&self) -> Option<Span> {
        match self {
            TranslateError::Parse(err) => err.span(),
            TranslateError::Validation(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_span() {
        let err = ParseError::unexpected("stray token", "Works where ???", Span::new(12, 15));
        assert_eq!(err.span(), Some(Span::new(12, 15)));
        assert_eq!(err.to_string(), "stray token: `???` at 12..15");
    }

    #[test]
    fn test_validation_errors_display_lists_all() {
        let err = ValidationErrors {
            issues: vec![
                ValidationIssue {
                    kind: IssueKind::UnknownEntity,
                    path: "get_rows".to_string(),
                    message: "unknown entity `bogus`".to_string(),
                },
                ValidationIssue {
                    kind: IssueKind::InvalidSample,
                    path: "sample".to_string(),
                    message: "sample must be between 1 and 10000".to_string(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("2 error(s)"));
        assert!(text.contains("get_rows: unknown entity `bogus`"));
        assert!(text.contains("sample: sample must be"));
    }
}
