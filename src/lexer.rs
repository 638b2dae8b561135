//! The lexer for OQL statements.

use crate::token::{Span, Token, TokenKind};

pub struct Lexer<'a> {
    input: &'a str,
    /// The current position in the input (byte index)
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer { input, position: 0 }
    }

    /// Returns the character at the current position without advancing
    fn peek(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    /// Returns the character after the current one without advancing
    fn peek_next(&self) -> Option<char> {
        self.input[self.position..].chars().nth(1)
    }

    /// Advances one character and returns it
    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if let Some(c) = c {
            self.position += c.len_utf8();
        }
        c
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn token(&self, kind: TokenKind<'a>, start: usize) -> Token<'a> {
        Token {
            kind,
            span: Span::new(start, self.position),
        }
    }

    /// Reads up to `close`; the opening delimiter was already consumed.
    /// Unterminated input becomes a single `Illegal` token.
    fn read_delimited(&mut self, close: char) -> Option<&'a str> {
        let content_start = self.position;
        while let Some(c) = self.peek() {
            if c == close {
                let content = &self.input[content_start..self.position];
                self.bump();
                return Some(content);
            }
            self.bump();
        }
        None
    }

    /// `\"` and `\\` escape inside strings; the token keeps the raw text
    /// and [`unescape`] resolves it.
    fn read_string(&mut self, start: usize) -> Token<'a> {
        let content_start = self.position;
        while let Some(c) = self.peek() {
            match c {
                '"' => {
                    let content = &self.input[content_start..self.position];
                    self.bump();
                    return self.token(TokenKind::String(content), start);
                }
                '\\' => {
                    self.bump();
                    self.bump();
                }
                _ => {
                    self.bump();
                }
            }
        }
        self.token(TokenKind::Illegal, start)
    }

    fn read_bracketed(&mut self, start: usize) -> Token<'a> {
        match self.read_delimited(']') {
            Some(content) => self.token(TokenKind::Bracketed(content), start),
            None => self.token(TokenKind::Illegal, start),
        }
    }

    /// A word runs until whitespace or punctuation. `!` only ends a word
    /// when it starts `!=`.
    fn read_word(&mut self, start: usize) -> Token<'a> {
        while let Some(c) = self.peek() {
            if c.is_whitespace() || is_punctuation(c) || (c == '!' && self.peek_next() == Some('=')) {
                break;
            }
            self.bump();
        }
        self.token(TokenKind::Word(&self.input[start..self.position]), start)
    }
}

/// Resolves the escapes of a string token's raw text.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            other => out.push(other),
        }
    }
    out
}

/// `text` as an OQL string literal, quotes included.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn is_punctuation(c: char) -> bool {
    matches!(c, '(' | ')' | '[' | ']' | ';' | '"' | '<' | '>' | '=')
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.skip_whitespace();
        let start = self.position;

        let c = self.bump()?;
        let token = match c {
            '(' => self.token(TokenKind::LParen, start),
            ')' => self.token(TokenKind::RParen, start),
            ';' => self.token(TokenKind::Semicolon, start),
            '=' => self.token(TokenKind::Eq, start),
            '<' => {
                if self.peek() == Some('=') {
                    self.bump();
                    self.token(TokenKind::Lte, start)
                } else {
                    self.token(TokenKind::Lt, start)
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.bump();
                    self.token(TokenKind::Gte, start)
                } else {
                    self.token(TokenKind::Gt, start)
                }
            }
            '!' if self.peek() == Some('=') => {
                self.bump();
                self.token(TokenKind::NotEq, start)
            }
            '"' => self.read_string(start),
            '[' => self.read_bracketed(start),
            ']' => self.token(TokenKind::Illegal, start),
            _ => self.read_word(start),
        };
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind<'_>> {
        Lexer::new(input).map(|t| t.kind).collect()
    }

    #[test]
    fn test_simple_statement() {
        assert_eq!(
            kinds("Works where it's Open Access"),
            vec![
                TokenKind::Word("Works"),
                TokenKind::Word("where"),
                TokenKind::Word("it's"),
                TokenKind::Word("Open"),
                TokenKind::Word("Access"),
            ]
        );
    }

    #[test]
    fn test_all_operators_and_punctuation() {
        let input = "!= = > < >= <= ( ) ;";
        assert_eq!(
            kinds(input),
            vec![
                TokenKind::NotEq,
                TokenKind::Eq,
                TokenKind::Gt,
                TokenKind::Lt,
                TokenKind::Gte,
                TokenKind::Lte,
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::Semicolon,
            ]
        );
    }

    #[test]
    fn test_operators_split_words() {
        assert_eq!(
            kinds("year>=2020;sample 5"),
            vec![
                TokenKind::Word("year"),
                TokenKind::Gte,
                TokenKind::Word("2020"),
                TokenKind::Semicolon,
                TokenKind::Word("sample"),
                TokenKind::Word("5"),
            ]
        );
    }

    #[test]
    fn test_strings_and_brackets() {
        assert_eq!(
            kinds(r#"Country is Canada [ca] and title contains "a (b); c""#),
            vec![
                TokenKind::Word("Country"),
                TokenKind::Word("is"),
                TokenKind::Word("Canada"),
                TokenKind::Bracketed("ca"),
                TokenKind::Word("and"),
                TokenKind::Word("title"),
                TokenKind::Word("contains"),
                TokenKind::String("a (b); c"),
            ]
        );
    }

    #[test]
    fn test_escaped_quotes_stay_inside_the_string() {
        let input = r#"title contains "the \"best\" paper" and"#;
        assert_eq!(
            kinds(input),
            vec![
                TokenKind::Word("title"),
                TokenKind::Word("contains"),
                TokenKind::String(r#"the \"best\" paper"#),
                TokenKind::Word("and"),
            ]
        );
        assert_eq!(unescape(r#"the \"best\" paper"#), r#"the "best" paper"#);
        assert_eq!(unescape(r"a\\b"), r"a\b");
        assert_eq!(quote(r#"say "hi" \o/"#), r#""say \"hi\" \\o/""#);
        assert_eq!(kinds(r#""open \""#), vec![TokenKind::Illegal]);
    }

    #[test]
    fn test_spans_are_byte_offsets() {
        let tokens: Vec<_> = Lexer::new("Works  where [A1]").collect();
        assert_eq!(tokens[0].span, Span::new(0, 5));
        assert_eq!(tokens[1].span, Span::new(7, 12));
        assert_eq!(tokens[2].span, Span::new(13, 17));
    }

    #[test]
    fn test_unterminated_input_is_illegal() {
        assert_eq!(kinds(r#"title is "open"#), vec![
            TokenKind::Word("title"),
            TokenKind::Word("is"),
            TokenKind::Illegal,
        ]);
        assert_eq!(kinds("author is [A1"), vec![
            TokenKind::Word("author"),
            TokenKind::Word("is"),
            TokenKind::Illegal,
        ]);
        assert_eq!(kinds("]"), vec![TokenKind::Illegal]);
    }

    #[test]
    fn test_bang_inside_word() {
        assert_eq!(
            kinds("wow! x!=1"),
            vec![
                TokenKind::Word("wow!"),
                TokenKind::Word("x"),
                TokenKind::NotEq,
                TokenKind::Word("1"),
            ]
        );
    }
}
