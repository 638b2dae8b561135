//! The OQL statement parser.
//!
//! ## Parse flow
//!
//! ```text
//! parse()
//!   ├─ parse_entity()            longest entity name before `where`
//!   ├─ `where` → parse_or_expression()
//!   │              └─ parse_and_expression()
//!   │                   └─ parse_primary()
//!   │                        ├─ "(" → parse_or_expression() ")"
//!   │                        └─ parse_clause()
//!   │                             ├─ boolean idiom: it's [not] / it has / it doesn't have {name}
//!   │                             └─ {column} {operator} parse_value()
//!   └─ (";" parse_directive())*  sort by {column} [asc|desc] | sample {n}
//! ```
//!
//! ## Precedence (high to low)
//!
//! 1. **Groups** `( ... )`
//! 2. **Clauses** `year >= 2020`, `it's Open Access`
//! 3. **AND**
//! 4. **OR**
//!
//! ## Keywords and free text
//!
//! Display names and entity names are free text, so `and`/`or` only end a
//! value when the tokens after them start a new clause: a known column
//! followed by an operator, a boolean idiom, or `(` opening such a clause.
//! That keeps `Smith and Jones [A1]` and `Health and (Family Welfare) [I1]`
//! single names. Quoted strings take `\"` and `\\` escapes.
//!
//! ## Examples
//!
//! ```text
//! Works where it's Open Access and year >= 2020; sort by citations desc
//! Works where Country is Canada [ca]
//! Authors where (institution is [I27837315] or institution is [I136199984]); sample 50
//! ```

use crate::error::{fragment, ParseError};
use crate::lexer::{unescape, Lexer};
use crate::oqo::{Filter, Join, Operator, Oqo, SortOrder, Value};
use crate::registry::{ColumnDescriptor, EntityDescriptor, Registry};
use crate::token::{Span, Token, TokenKind};

/// Longest phrase considered when matching names.
const MAX_PHRASE_WORDS: usize = 12;

/// Operator spellings, longest first.
const OPERATOR_WORDS: &[(&[&str], Operator)] = &[
    (&["is", "greater", "than", "or", "equal", "to"], Operator::Gte),
    (&["is", "less", "than", "or", "equal", "to"], Operator::Lte),
    (&["does", "not", "contain"], Operator::NotContains),
    (&["is", "greater", "than"], Operator::Gt),
    (&["is", "less", "than"], Operator::Lt),
    (&["doesn't", "contain"], Operator::NotContains),
    (&["is", "not"], Operator::IsNot),
    (&["isn't"], Operator::IsNot),
    (&["contains"], Operator::Contains),
    (&["is"], Operator::Is),
];

/// Boolean idioms and the value they assert, longest first.
const BOOLEAN_IDIOMS: &[(&[&str], bool)] = &[
    (&["it", "does", "not", "have"], false),
    (&["it", "doesn't", "have"], false),
    (&["it", "is", "not"], false),
    (&["it's", "not"], false),
    (&["it", "is"], true),
    (&["it", "has"], true),
    (&["it's"], true),
];

/// Parses an OQL statement into a (non-canonical) OQO.
pub fn parse_oql(input: &str, registry: &Registry) -> Result<Oqo, ParseError> {
    let tokens: Vec<_> = Lexer::new(input).collect();
    Parser::new(input, &tokens, registry).parse()
}

pub struct Parser<'a> {
    source: &'a str,
    tokens: &'a [Token<'a>],
    position: usize,
    registry: &'a Registry,
    /// Entity id, set once the head of the statement is parsed.
    entity: String,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str, tokens: &'a [Token<'a>], registry: &'a Registry) -> Self {
        Self {
            source,
            tokens,
            position: 0,
            registry,
            entity: String::new(),
        }
    }

    fn peek(&self) -> Option<&'a Token<'a>> {
        self.tokens.get(self.position)
    }

    fn peek_at(&self, pos: usize) -> Option<&'a Token<'a>> {
        self.tokens.get(pos)
    }

    fn advance(&mut self) -> Option<&'a Token<'a>> {
        let token = self.tokens.get(self.position);
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn match_word(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|t| t.kind.is_word(keyword))
    }

    fn unexpected(&self, message: &str, token: Option<&Token<'_>>) -> ParseError {
        match token {
            Some(token) => ParseError::unexpected(message, self.source, token.span),
            None => ParseError::UnexpectedEnd {
                message: message.to_string(),
            },
        }
    }

    /// Span from the token at `from` to the token before `to`.
    fn span_between(&self, from: usize, to: usize) -> Span {
        let start = self.tokens[from].span;
        self.tokens
            .get(to.saturating_sub(1))
            .filter(|_| to > from)
            .map_or(start, |end| start.to(end.span))
    }

    pub fn parse(&mut self) -> Result<Oqo, ParseError> {
        if let Some(token) = self.tokens.iter().find(|t| t.kind == TokenKind::Illegal) {
            return Err(ParseError::unexpected(
                "unterminated string, bracket or stray `]`",
                self.source,
                token.span,
            ));
        }

        let entity = self.parse_entity()?;
        self.entity = entity.id.clone();
        let mut oqo = Oqo::new(entity.id.clone());

        if self.match_word("where") {
            let where_token = self.advance();
            if matches!(self.peek().map(|t| &t.kind), None | Some(TokenKind::Semicolon)) {
                return Err(self.unexpected("expected a filter after `where`", where_token));
            }
            oqo.filters = match self.parse_or_expression()? {
                Filter::Branch(branch) if branch.join == Join::And => branch.children,
                other => vec![other],
            };
        }

        while let Some(token) = self.peek() {
            match token.kind {
                TokenKind::Semicolon => {
                    self.advance();
                    self.parse_directive(&mut oqo)?;
                }
                _ => {
                    return Err(self.unexpected("expected `and`, `or`, `where` or `;`", Some(token)))
                }
            }
        }

        Ok(oqo)
    }

    /// Longest run of leading words naming an entity.
    fn parse_entity(&mut self) -> Result<&'a EntityDescriptor, ParseError> {
        let words: Vec<&str> = self
            .word_run(self.position)
            .into_iter()
            .take_while(|w| !w.eq_ignore_ascii_case("where"))
            .collect();
        if words.is_empty() {
            return Err(self.unexpected("expected an entity name", self.peek()));
        }

        for n in (1..=words.len()).rev() {
            if let Some(entity) = self.registry.find_entity_by_name(&words[..n].join(" ")) {
                self.position += n;
                return Ok(entity);
            }
        }

        let span = self.span_between(self.position, self.position + words.len());
        Err(ParseError::UnknownEntity {
            fragment: fragment(self.source, span),
            span,
        })
    }

    /// Syntax: `and_expr (or and_expr)*`
    fn parse_or_expression(&mut self) -> Result<Filter, ParseError> {
        let first = self.parse_and_expression()?;
        let mut children = vec![first];

        while self.match_word("or") {
            self.advance();
            children.push(self.parse_and_expression()?);
        }

        Ok(match children.len() {
            1 => children.remove(0),
            _ => Filter::or(children),
        })
    }

    /// Syntax: `primary (and primary)*`
    fn parse_and_expression(&mut self) -> Result<Filter, ParseError> {
        let first = self.parse_primary()?;
        let mut children = vec![first];

        while self.match_word("and") {
            self.advance();
            children.push(self.parse_primary()?);
        }

        Ok(match children.len() {
            1 => children.remove(0),
            _ => Filter::and(children),
        })
    }

    fn parse_primary(&mut self) -> Result<Filter, ParseError> {
        match self.peek() {
            Some(token) if token.kind == TokenKind::LParen => {
                self.advance();
                let expr = self.parse_or_expression()?;
                match self.peek() {
                    Some(close) if close.kind == TokenKind::RParen => {
                        self.advance();
                        Ok(expr)
                    }
                    other => Err(self.unexpected("expected `)`", other)),
                }
            }
            Some(_) => self.parse_clause(),
            None => Err(self.unexpected("expected a filter", None)),
        }
    }

    fn parse_clause(&mut self) -> Result<Filter, ParseError> {
        if let Some((len, truth)) = self.match_idiom(self.position) {
            self.position += len;
            return self.parse_boolean_name(truth);
        }

        let Some((column, len)) = self.match_column(self.position) else {
            return Err(self.column_error());
        };
        self.position += len;

        let operator = match self.match_operator(self.position) {
            Some((operator, len)) => {
                self.position += len;
                operator
            }
            None => return Err(self.column_error()),
        };

        let value = self.parse_value(column)?;
        Ok(Filter::leaf(column.column_id.clone(), operator, value))
    }

    /// The most specific error for a clause whose column did not resolve.
    fn column_error(&self) -> ParseError {
        let pos = self.position;
        let Some(token) = self.peek() else {
            return self.unexpected("expected a filter", None);
        };
        let run = self.word_run(pos);
        if run.is_empty() {
            return self.unexpected("expected a column name", Some(token));
        }

        // A known column without an operator after it.
        for n in (1..=run.len()).rev() {
            if let Some(column) = self.registry.column_by_display(&self.entity, &run[..n].join(" ")) {
                let next = self.peek_at(pos + n);
                return ParseError::MissingOperator {
                    column: column.display_name.clone(),
                    fragment: next.map(|t| fragment(self.source, t.span)).unwrap_or_default(),
                    span: next.map_or(Span::new(self.source.len(), self.source.len()), |t| t.span),
                };
            }
        }

        let end = (1..run.len())
            .find(|&i| self.match_operator(pos + i).is_some())
            .unwrap_or(1);
        let span = self.span_between(pos, pos + end);
        ParseError::UnknownColumn {
            fragment: fragment(self.source, span),
            span,
        }
    }

    fn parse_boolean_name(&mut self, truth: bool) -> Result<Filter, ParseError> {
        let run = self.word_run(self.position);
        for n in (1..=run.len()).rev() {
            let phrase = run[..n].join(" ");
            if let Some(column) = self.registry.boolean_by_display(&self.entity, &phrase) {
                if self.is_clause_end(self.position + n) {
                    self.position += n;
                    return Ok(Filter::is(column.column_id.clone(), truth));
                }
            }
        }

        if run.is_empty() {
            return Err(self.unexpected("expected a boolean column name", self.peek()));
        }
        let end = (1..=run.len())
            .find(|&n| self.is_clause_end(self.position + n))
            .unwrap_or(run.len());
        let span = self.span_between(self.position, self.position + end);
        Err(ParseError::UnknownColumn {
            fragment: fragment(self.source, span),
            span,
        })
    }

    fn parse_value(&mut self, column: &ColumnDescriptor) -> Result<Value, ParseError> {
        let Some(token) = self.peek() else {
            return Err(self.unexpected("expected a value", None));
        };
        match token.kind {
            TokenKind::Bracketed(id) => {
                self.advance();
                Ok(Value::String(expand_short_id(id, column)))
            }
            TokenKind::String(s) => {
                self.advance();
                Ok(Value::String(unescape(s)))
            }
            TokenKind::Semicolon | TokenKind::RParen => Err(ParseError::MissingValue {
                fragment: fragment(self.source, token.span),
                span: token.span,
            }),
            TokenKind::Word(word) if self.is_clause_end(self.position + 1) => {
                self.advance();
                Ok(literal(word))
            }
            _ => Ok(self.parse_named_value(column)),
        }
    }

    /// `Display Name [id]`, or unquoted multi-word text when no bracket
    /// follows before the clause ends.
    fn parse_named_value(&mut self, column: &ColumnDescriptor) -> Value {
        let start = self.position;
        let mut pos = start;
        let mut depth = 0usize;

        loop {
            match self.peek_at(pos).map(|t| &t.kind) {
                None | Some(TokenKind::Semicolon) => break,
                Some(TokenKind::Bracketed(id)) => {
                    self.position = pos + 1;
                    return Value::String(expand_short_id(id, column));
                }
                Some(TokenKind::LParen) => depth += 1,
                Some(TokenKind::RParen) => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                Some(_) if depth == 0 && pos > start && self.is_clause_end(pos) => break,
                Some(_) => {}
            }
            pos += 1;
        }

        self.position = pos;
        let span = self.span_between(start, pos);
        Value::String(fragment(self.source, span))
    }

    fn parse_directive(&mut self, oqo: &mut Oqo) -> Result<(), ParseError> {
        let Some(token) = self.advance() else {
            return Err(self.unexpected("expected `sort by` or `sample` after `;`", None));
        };

        if token.kind.is_word("sort") {
            if !self.match_word("by") {
                return Err(self.unexpected("expected `by` after `sort`", self.peek()));
            }
            self.advance();

            let mut words = self.word_run(self.position);
            let consumed = words.len();
            let order = match words.last().map(|w| w.parse::<SortOrder>()) {
                Some(Ok(order)) => {
                    words.pop();
                    Some(order)
                }
                _ => None,
            };
            if words.is_empty() {
                return Err(self.unexpected("expected a sort column", self.peek()));
            }
            self.position += consumed;

            let phrase = words.join(" ");
            let column_id = self
                .registry
                .column_by_display(&self.entity, &phrase)
                .map_or(phrase, |c| c.column_id.clone());
            oqo.sort_column = Some(column_id);
            oqo.sort_order = order;
            Ok(())
        } else if token.kind.is_word("sample") {
            match self.advance() {
                Some(size) => match size.kind.word().and_then(|w| w.parse::<u32>().ok()) {
                    Some(n) => {
                        oqo.sample = Some(n);
                        Ok(())
                    }
                    None => Err(ParseError::unexpected(
                        "expected a sample size",
                        self.source,
                        size.span,
                    )),
                },
                None => Err(self.unexpected("expected a sample size", None)),
            }
        } else {
            Err(self.unexpected("expected `sort by` or `sample`", Some(token)))
        }
    }

    /// Consecutive `Word` tokens starting at `pos`.
    fn word_run(&self, pos: usize) -> Vec<&'a str> {
        self.tokens[pos.min(self.tokens.len())..]
            .iter()
            .map_while(|t| t.kind.word())
            .take(MAX_PHRASE_WORDS)
            .collect()
    }

    fn match_operator(&self, pos: usize) -> Option<(Operator, usize)> {
        let token = self.peek_at(pos)?;
        let symbol = match token.kind {
            TokenKind::Eq => Some(Operator::Is),
            TokenKind::NotEq => Some(Operator::IsNot),
            TokenKind::Gt => Some(Operator::Gt),
            TokenKind::Gte => Some(Operator::Gte),
            TokenKind::Lt => Some(Operator::Lt),
            TokenKind::Lte => Some(Operator::Lte),
            _ => None,
        };
        if let Some(operator) = symbol {
            return Some((operator, 1));
        }
        let run = self.word_run(pos);
        OPERATOR_WORDS
            .iter()
            .find(|(words, _)| starts_with_words(&run, words))
            .map(|(words, operator)| (*operator, words.len()))
    }

    fn match_idiom(&self, pos: usize) -> Option<(usize, bool)> {
        let run = self.word_run(pos);
        BOOLEAN_IDIOMS
            .iter()
            .find(|(words, _)| starts_with_words(&run, words))
            .map(|(words, truth)| (words.len(), *truth))
    }

    /// A column phrase at `pos` that is followed by an operator.
    fn match_column(&self, pos: usize) -> Option<(&'a ColumnDescriptor, usize)> {
        let run = self.word_run(pos);
        (1..=run.len()).rev().find_map(|n| {
            let column = self.registry.column_by_display(&self.entity, &run[..n].join(" "))?;
            self.match_operator(pos + n).map(|_| (column, n))
        })
    }

    /// A group only counts when a clause opens it, so `Health and (Family
    /// Welfare) [I1]` stays one name.
    fn clause_starts_at(&self, pos: usize) -> bool {
        match self.peek_at(pos) {
            Some(token) if token.kind == TokenKind::LParen => self.clause_starts_at(pos + 1),
            Some(_) => self.match_idiom(pos).is_some() || self.match_column(pos).is_some(),
            None => false,
        }
    }

    /// End of input, `;`, `)`, or `and`/`or` introducing another clause.
    fn is_clause_end(&self, pos: usize) -> bool {
        match self.peek_at(pos) {
            None => true,
            Some(token) => match token.kind {
                TokenKind::Semicolon | TokenKind::RParen => true,
                ref kind if kind.is_word("and") || kind.is_word("or") => {
                    self.clause_starts_at(pos + 1)
                }
                _ => false,
            },
        }
    }
}

fn starts_with_words(run: &[&str], words: &[&str]) -> bool {
    run.len() >= words.len()
        && run
            .iter()
            .zip(words)
            .all(|(have, want)| normalize_apostrophe(have).eq_ignore_ascii_case(want))
}

fn normalize_apostrophe(word: &str) -> String {
    word.replace('\u{2019}', "'")
}

/// `[ca]` on a column related to `countries` means `countries/ca`.
fn expand_short_id(id: &str, column: &ColumnDescriptor) -> String {
    match &column.related_entity_type {
        Some(related) if !id.contains('/') => format!("{}/{}", related, id),
        _ => id.to_string(),
    }
}

/// A single-word bare value.
fn literal(word: &str) -> Value {
    if word.eq_ignore_ascii_case("true") {
        Value::Bool(true)
    } else if word.eq_ignore_ascii_case("false") {
        Value::Bool(false)
    } else if word.eq_ignore_ascii_case("null") || word.eq_ignore_ascii_case("unknown") {
        Value::Null
    } else {
        crate::canonical::parse_number(word).unwrap_or_else(|| Value::String(word.to_string()))
    }
}
