//! The token definition for the OQL statement language.

use serde::Serialize;

/// A token is a single unit of the language, with a specific kind and location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub span: Span,
}

/// The kind of a token.
///
/// Keywords (`where`, `and`, `or`, `sort`, ...) are not lexed separately:
/// OQL display names are free text, so the parser decides from context
/// whether a `Word` is a keyword or part of a name.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind<'a> {
    // Literals
    Word(&'a str),
    String(&'a str),    // The contents between double quotes
    Bracketed(&'a str), // The contents between `[` and `]`

    // Punctuation
    LParen,    // (
    RParen,    // )
    Semicolon, // ;

    // Operators
    Eq,    // =
    NotEq, // !=
    Gt,    // >
    Lt,    // <
    Gte,   // >=
    Lte,   // <=

    // Special
    Illegal, // An unterminated string/bracket or a stray character
}

impl<'a> TokenKind<'a> {
    /// The word text, if this is a `Word`.
    pub fn word(&self) -> Option<&'a str> {
        match self {
            TokenKind::Word(w) => Some(w),
            _ => None,
        }
    }

    /// Case-insensitive keyword check.
    pub fn is_word(&self, keyword: &str) -> bool {
        self.word().is_some_and(|w| w.eq_ignore_ascii_case(keyword))
    }
}

/// Represents a span in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Span {
    /// The starting byte offset.
    pub start: usize,
    /// The ending byte offset.
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Smallest span covering both.
    pub fn to(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}
