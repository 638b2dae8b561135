//! The legacy URL syntax: `filter=field:value,field:value&sort=field:order`.
//!
//! ```text
//! publication_year:2020-2024     ->  year >= 2020 and year <= 2024
//! publication_year:2024-         ->  year >= 2024
//! cited_by_count:-100            ->  citations <= 100
//! type:article|book              ->  (type is article or type is book)
//! type:!article|book             ->  (type is not article or type is not book)
//! authorships.countries:!null    ->  Country is not unknown
//! title.search:"cats, dogs"      ->  title search contains "cats, dogs"
//! ```
//!
//! Values are kept as strings; typing them is the canonicalizer's job.

use crate::canonical::{id_type, short_id};
use crate::error::{ParseError, RenderError};
use crate::oqo::{Filter, Join, LeafFilter, Operator, Oqo, SortOrder, Value};
use crate::registry::{ColumnDescriptor, Registry};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static CLOSED_RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]+(?:\.[0-9]+)?)-([0-9]+(?:\.[0-9]+)?)$").expect("closed range regex")
});
static FROM_RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+(?:\.[0-9]+)?)-$").expect("from range regex"));
static TO_RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-([0-9]+(?:\.[0-9]+)?)$").expect("to range regex"));
static UNSIGNED_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+(?:\.[0-9]+)?$").expect("unsigned number regex"));

/// The URL-format query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlQuery {
    pub filter: Option<String>,
    pub sort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<u32>,
}

impl UrlQuery {
    pub fn filter(filter: impl Into<String>) -> Self {
        Self {
            filter: Some(filter.into()),
            ..Self::default()
        }
    }

    pub fn with_sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }
}

/// Parses URL parameters for `entity` into a (non-canonical) OQO.
pub fn parse_url(entity: &str, query: &UrlQuery, registry: &Registry) -> Result<Oqo, ParseError> {
    let mut oqo = Oqo::new(entity);

    if let Some(filter) = query.filter.as_deref() {
        for pair in split_outside_quotes(filter, ',') {
            if pair.trim().is_empty() {
                continue;
            }
            let Some((field, raw)) = pair.split_once(':') else {
                return Err(ParseError::UrlFilter {
                    field: pair.trim().to_string(),
                    fragment: String::new(),
                    message: "expected `field:value`".to_string(),
                });
            };
            let field = field.trim();
            let column = registry
                .resolve_column(entity, field)
                .map(|r| r.descriptor);
            oqo.filters.extend(parse_field(field, raw, column)?);
        }
    }

    if let Some(sort) = query.sort.as_deref().filter(|s| !s.trim().is_empty()) {
        let (column, order) = match sort.split_once(':') {
            Some((column, order)) => {
                let order = order.parse::<SortOrder>().map_err(|message| ParseError::UrlParam {
                    param: "sort".to_string(),
                    message,
                })?;
                (column, Some(order))
            }
            None => (sort, None),
        };
        oqo = oqo.sorted_by(column.trim(), order);
    }

    oqo.sample = query.sample;
    Ok(oqo)
}

fn parse_field(
    field: &str,
    raw: &str,
    column: Option<&ColumnDescriptor>,
) -> Result<Vec<Filter>, ParseError> {
    let error = |message: &str| ParseError::UrlFilter {
        field: field.to_string(),
        fragment: raw.to_string(),
        message: message.to_string(),
    };

    let members = split_outside_quotes(raw, '|');
    if members.len() > 1 {
        let negated = members[0].starts_with('!');
        let mut children = Vec::with_capacity(members.len());
        for (i, member) in members.iter().enumerate() {
            let member = match member.strip_prefix('!') {
                Some(rest) if negated => rest,
                Some(_) if i > 0 => {
                    return Err(error("`!` must prefix the first value of an OR list"))
                }
                _ => member,
            };
            if member.is_empty() {
                return Err(error("empty value in OR list"));
            }
            children.push(plain_leaf(field, member, negated, column));
        }
        return Ok(vec![Filter::or(children)]);
    }

    if raw.is_empty() {
        return Err(error("missing value"));
    }
    if let Some(rest) = raw.strip_prefix('!') {
        if rest.is_empty() {
            return Err(error("missing value after `!`"));
        }
        return Ok(vec![plain_leaf(field, rest, true, column)]);
    }
    if let Some(rest) = raw.strip_prefix('>').filter(|r| !r.is_empty()) {
        return Ok(vec![Filter::leaf(field, Operator::Gt, unquote(rest))]);
    }
    if let Some(rest) = raw.strip_prefix('<').filter(|r| !r.is_empty()) {
        return Ok(vec![Filter::leaf(field, Operator::Lt, unquote(rest))]);
    }
    if column.is_some_and(ColumnDescriptor::is_numeric) {
        if let Some(range) = parse_range(field, raw) {
            return Ok(range);
        }
    }
    Ok(vec![plain_leaf(field, raw, false, column)])
}

/// `a-b`, `a-` and `-a` on numeric values. ISO dates and anything else
/// non-numeric never match.
fn parse_range(field: &str, raw: &str) -> Option<Vec<Filter>> {
    let (low, high) = numeric_range(raw)?;
    let mut leaves = Vec::with_capacity(2);
    if let Some(low) = low {
        leaves.push(Filter::leaf(field, Operator::Gte, low));
    }
    if let Some(high) = high {
        leaves.push(Filter::leaf(field, Operator::Lte, high));
    }
    Some(leaves)
}

/// Splits a range value into its inclusive bounds.
///
/// ```
/// use oql_dispatcher::url_filter::numeric_range;
///
/// assert_eq!(numeric_range("2020-2022"), Some((Some("2020"), Some("2022"))));
/// assert_eq!(numeric_range("100-"), Some((Some("100"), None)));
/// assert_eq!(numeric_range("-5"), Some((None, Some("5"))));
/// assert_eq!(numeric_range("2020-01-01"), None);
/// ```
pub fn numeric_range(raw: &str) -> Option<(Option<&str>, Option<&str>)> {
    if let Some(caps) = CLOSED_RANGE_RE.captures(raw) {
        let low = caps.get(1)?.as_str();
        let high = caps.get(2)?.as_str();
        return Some((Some(low), Some(high)));
    }
    if let Some(caps) = FROM_RANGE_RE.captures(raw) {
        return Some((Some(caps.get(1)?.as_str()), None));
    }
    let caps = TO_RANGE_RE.captures(raw)?;
    Some((None, Some(caps.get(1)?.as_str())))
}

/// A leaf with the column's default operator (or its negation).
fn plain_leaf(field: &str, raw: &str, negated: bool, column: Option<&ColumnDescriptor>) -> Filter {
    if raw.eq_ignore_ascii_case("null") {
        let operator = if negated { Operator::IsNot } else { Operator::Is };
        return Filter::leaf(field, operator, Value::Null);
    }
    let positive = if column.is_some_and(|c| c.is_search_column) {
        Operator::Contains
    } else {
        Operator::Is
    };
    let operator = match (positive, negated) {
        (Operator::Contains, true) => Operator::NotContains,
        (_, true) => Operator::IsNot,
        (op, false) => op,
    };
    Filter::leaf(field, operator, unquote(raw))
}

fn unquote(raw: &str) -> &str {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        &raw[1..raw.len() - 1]
    } else {
        raw
    }
}

/// Splits on `sep` outside double quotes. Quotes have no escape sequence.
fn split_outside_quotes(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == sep && !in_quotes {
            parts.push(&input[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&input[start..]);
    parts
}

/// Renders `oqo` in URL syntax, or reports the construct the syntax lacks.
pub fn render_url(oqo: &Oqo, registry: &Registry) -> Result<UrlQuery, RenderError> {
    let renderer = UrlRenderer {
        entity: &oqo.entity,
        registry,
    };

    let mut leaves: Vec<&LeafFilter> = Vec::new();
    let mut pairs = Vec::new();
    for filter in &oqo.filters {
        match filter {
            Filter::Leaf(leaf) => leaves.push(leaf),
            Filter::Branch(branch) if branch.join == Join::And => {
                for child in &branch.children {
                    match child {
                        Filter::Leaf(leaf) => leaves.push(leaf),
                        Filter::Branch(_) => return Err(RenderError::NestedBranch { depth: 1 }),
                    }
                }
            }
            Filter::Branch(branch) => {
                pairs.extend(renderer.flush(&mut leaves)?);
                let children = branch
                    .children
                    .iter()
                    .map(|child| match child {
                        Filter::Leaf(leaf) => Ok(leaf),
                        Filter::Branch(_) => Err(RenderError::NestedBranch { depth: 1 }),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                pairs.push(renderer.render_or(&children)?);
            }
        }
    }
    pairs.extend(renderer.flush(&mut leaves)?);

    let sort = oqo.sort_column.as_ref().map(|column| match oqo.sort_order {
        Some(order) => format!("{}:{}", column, order.as_str()),
        None => column.clone(),
    });

    Ok(UrlQuery {
        filter: (!pairs.is_empty()).then(|| pairs.join(",")),
        sort,
        sample: oqo.sample,
    })
}

struct UrlRenderer<'a> {
    entity: &'a str,
    registry: &'a Registry,
}

impl UrlRenderer<'_> {
    fn column(&self, column_id: &str) -> Option<&ColumnDescriptor> {
        self.registry
            .resolve_column(self.entity, column_id)
            .map(|r| r.descriptor)
    }

    /// Renders a run of AND-ed leaves, merging `>=a` followed by `<=b` on
    /// the same field into `a-b`.
    fn flush(&self, leaves: &mut Vec<&LeafFilter>) -> Result<Vec<String>, RenderError> {
        let mut pairs = Vec::with_capacity(leaves.len());
        let mut i = 0;
        while i < leaves.len() {
            let leaf = leaves[i];
            if let Some(next) = leaves.get(i + 1) {
                if leaf.operator == Operator::Gte
                    && next.operator == Operator::Lte
                    && next.column_id == leaf.column_id
                {
                    if let (Some(from), Some(to)) = (unsigned(&leaf.value), unsigned(&next.value)) {
                        pairs.push(format!("{}:{}-{}", leaf.column_id, from, to));
                        i += 2;
                        continue;
                    }
                }
            }
            pairs.push(format!("{}:{}", leaf.column_id, self.render_leaf(leaf)?));
            i += 1;
        }
        leaves.clear();
        Ok(pairs)
    }

    fn render_leaf(&self, leaf: &LeafFilter) -> Result<String, RenderError> {
        let column = self.column(&leaf.column_id);
        let unsupported = || RenderError::UnsupportedLeaf {
            column: leaf.column_id.clone(),
            operator: leaf.operator.to_string(),
            value: leaf.value.to_string(),
        };

        if leaf.value.is_null() {
            return match leaf.operator {
                Operator::Is => Ok("null".to_string()),
                Operator::IsNot => Ok("!null".to_string()),
                _ => Err(unsupported()),
            };
        }

        let numeric = column.is_some_and(ColumnDescriptor::is_numeric);
        match leaf.operator {
            Operator::Gte | Operator::Lte if !numeric => Err(unsupported()),
            Operator::Gt => Ok(format!(">{}", self.value_text(leaf, column)?)),
            Operator::Lt => Ok(format!("<{}", self.value_text(leaf, column)?)),
            Operator::Gte => unsigned(&leaf.value)
                .map(|v| format!("{}-", v))
                .ok_or_else(unsupported),
            Operator::Lte => unsigned(&leaf.value)
                .map(|v| format!("-{}", v))
                .ok_or_else(unsupported),
            op => {
                let (positive, negated) = (op.positive(), op.is_negative());
                if positive != default_operator(column) {
                    return Err(unsupported());
                }
                let text = self.value_text(leaf, column)?;
                Ok(if negated { format!("!{}", text) } else { text })
            }
        }
    }

    fn render_or(&self, children: &[&LeafFilter]) -> Result<String, RenderError> {
        let Some(first) = children.first() else {
            return Err(RenderError::NestedBranch { depth: 0 });
        };

        let mut columns: Vec<String> = Vec::new();
        for child in children {
            if !columns.contains(&child.column_id) {
                columns.push(child.column_id.clone());
            }
        }
        if columns.len() > 1 {
            return Err(RenderError::CrossFieldOr { columns });
        }
        if children.iter().any(|c| c.operator != first.operator) {
            return Err(RenderError::MixedOrOperators {
                column: first.column_id.clone(),
            });
        }

        let column = self.column(&first.column_id);
        let negated = first.operator.is_negative();
        if first.operator.positive() != default_operator(column) {
            return Err(RenderError::UnsupportedLeaf {
                column: first.column_id.clone(),
                operator: first.operator.to_string(),
                value: first.value.to_string(),
            });
        }

        let members = children
            .iter()
            .map(|leaf| {
                if leaf.value.is_null() {
                    Ok("null".to_string())
                } else {
                    self.value_text(leaf, column)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        let prefix = if negated { "!" } else { "" };
        Ok(format!("{}:{}{}", first.column_id, prefix, members.join("|")))
    }

    /// The value as URL text: related-type prefix stripped, quoted when it
    /// would otherwise be read as syntax.
    fn value_text(&self, leaf: &LeafFilter, column: Option<&ColumnDescriptor>) -> Result<String, RenderError> {
        let text = match &leaf.value {
            Value::String(s) => {
                let related = column.and_then(|c| c.related_entity_type.as_deref());
                match (related, id_type(s)) {
                    (Some(related), Some(prefix)) if prefix == related => short_id(s).to_string(),
                    _ => s.clone(),
                }
            }
            other => other.to_string(),
        };

        if text.contains('"') {
            return Err(RenderError::UnsupportedLeaf {
                column: leaf.column_id.clone(),
                operator: leaf.operator.to_string(),
                value: text,
            });
        }

        let numeric = column.is_some_and(ColumnDescriptor::is_numeric);
        let needs_quotes = text.is_empty()
            || text.contains([',', '|'])
            || text.starts_with(['!', '>', '<'])
            || text.eq_ignore_ascii_case("null")
            || (numeric && text.contains('-'));
        Ok(if needs_quotes {
            format!("\"{}\"", text)
        } else {
            text
        })
    }
}

fn default_operator(column: Option<&ColumnDescriptor>) -> Operator {
    if column.is_some_and(|c| c.is_search_column) {
        Operator::Contains
    } else {
        Operator::Is
    }
}

/// Text of a non-negative number, the only values open ranges can carry.
fn unsigned(value: &Value) -> Option<String> {
    let text = match value {
        Value::Int(_) | Value::Float(_) | Value::String(_) => value.to_string(),
        _ => return None,
    };
    UNSIGNED_NUMBER_RE.is_match(&text).then_some(text)
}
