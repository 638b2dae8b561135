//! Canonicalizer: deterministic normalization of an [`Oqo`].
//!
//! Values are typed against the registry, entity ids are normalized and the
//! filter tree is flattened. The result is what the validator, the renderers
//! and the compiler all consume, so two spellings of the same query compare
//! equal after this pass.

use crate::oqo::{BranchFilter, Filter, Join, LeafFilter, Operator, Oqo, Value};
use crate::registry::{ColumnDescriptor, Registry};
use once_cell::sync::Lazy;
use regex::Regex;

/// Prefix of fully qualified OpenAlex ids.
pub const OPENALEX_URL_PREFIX: &str = "https://openalex.org/";

/// One leading letter followed by digits (`A5023888391`, `W2741809807`).
static OPENALEX_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][0-9]+$").expect("openalex id regex"));

/// Returns the canonical form of `oqo`. Never fails: values that cannot be
/// typed are passed through unchanged.
pub fn canonicalize(oqo: &Oqo, registry: &Registry) -> Oqo {
    let entity = oqo.entity.to_lowercase();
    let mut filters = Vec::with_capacity(oqo.filters.len());
    for filter in &oqo.filters {
        match canonicalize_filter(filter, &entity, registry) {
            // Top-level filters are already AND-joined.
            Some(Filter::Branch(branch)) if branch.join == Join::And => {
                filters.extend(branch.children)
            }
            Some(other) => filters.push(other),
            None => {}
        }
    }

    Oqo {
        entity,
        filters,
        sort_column: oqo.sort_column.clone(),
        sort_order: oqo.sort_order,
        sample: oqo.sample,
    }
}

/// `None` when the node disappears (an empty branch).
fn canonicalize_filter(filter: &Filter, entity: &str, registry: &Registry) -> Option<Filter> {
    match filter {
        Filter::Leaf(leaf) => Some(Filter::Leaf(canonicalize_leaf(leaf, entity, registry))),
        Filter::Branch(branch) => {
            let mut children = Vec::with_capacity(branch.children.len());
            for child in &branch.children {
                match canonicalize_filter(child, entity, registry) {
                    Some(Filter::Branch(inner)) if inner.join == branch.join => {
                        children.extend(inner.children)
                    }
                    Some(other) => children.push(other),
                    None => {}
                }
            }
            match children.len() {
                0 => None,
                1 => children.pop(),
                _ => Some(Filter::Branch(BranchFilter {
                    join: branch.join,
                    children,
                })),
            }
        }
    }
}

fn canonicalize_leaf(leaf: &LeafFilter, entity: &str, registry: &Registry) -> LeafFilter {
    let column = registry
        .resolve_column(entity, &leaf.column_id)
        .map(|r| r.descriptor);
    let mut value = type_value(&leaf.value, column);
    let mut operator = leaf.operator;

    if let (Some(column), Value::Bool(b)) = (column, &value) {
        if column.is_boolean() && operator == Operator::IsNot {
            operator = Operator::Is;
            value = Value::Bool(!b);
        }
    }

    LeafFilter {
        column_id: leaf.column_id.clone(),
        operator,
        value,
    }
}

fn type_value(value: &Value, column: Option<&ColumnDescriptor>) -> Value {
    match value {
        Value::String(s) => {
            if s.eq_ignore_ascii_case("true") {
                return Value::Bool(true);
            }
            if s.eq_ignore_ascii_case("false") {
                return Value::Bool(false);
            }
            match column {
                Some(c) if c.is_numeric() => parse_number(s).unwrap_or_else(|| value.clone()),
                Some(c) => match &c.related_entity_type {
                    Some(related) if !s.is_empty() => Value::String(normalize_entity_id(s, related)),
                    _ => value.clone(),
                },
                None => value.clone(),
            }
        }
        Value::Int(i) => match column.and_then(|c| c.related_entity_type.as_deref()) {
            Some(related) => Value::String(normalize_entity_id(&i.to_string(), related)),
            None => value.clone(),
        },
        _ => value.clone(),
    }
}

/// Parses a numeric literal, integers first. Non-finite floats are rejected.
pub fn parse_number(s: &str) -> Option<Value> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::Int(i));
    }
    s.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(Value::Float)
}

/// Normalizes an entity reference to `type/id`, expanding a bare short id
/// with `related_type` and stripping the OpenAlex URL prefix.
pub fn normalize_entity_id(raw: &str, related_type: &str) -> String {
    let raw = raw.strip_prefix(OPENALEX_URL_PREFIX).unwrap_or(raw);
    let (entity_type, id) = match raw.split_once('/') {
        Some((entity_type, id)) => (entity_type.to_lowercase(), id),
        None => (related_type.to_lowercase(), raw),
    };
    if OPENALEX_ID_RE.is_match(id) {
        format!("{}/{}", entity_type, id)
    } else {
        format!("{}/{}", entity_type, id.to_lowercase())
    }
}

/// The part of an entity id after the type prefix.
pub fn short_id(id: &str) -> &str {
    id.split_once('/').map_or(id, |(_, short)| short)
}

/// The type prefix of an entity id, if any.
pub fn id_type(id: &str) -> Option<&str> {
    id.split_once('/').map(|(entity_type, _)| entity_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oqo::SortOrder;
    use test_case::test_case;

    fn registry() -> Registry {
        Registry::builtin().unwrap()
    }

    #[test_case("A123", "authors", "authors/A123" ; "openalex id kept verbatim")]
    #[test_case("Authors/A123", "authors", "authors/A123" ; "type lowercased")]
    #[test_case("countries/CA", "countries", "countries/ca" ; "plain id lowercased")]
    #[test_case("CA", "countries", "countries/ca" ; "short id expanded")]
    #[test_case("https://openalex.org/W42", "works", "works/W42" ; "url prefix stripped")]
    #[test_case("Types/Journal-Article", "types", "types/journal-article" ; "slug lowercased")]
    fn test_normalize_entity_id(raw: &str, related: &str, expected: &str) {
        assert_eq!(normalize_entity_id(raw, related), expected);
    }

    #[test]
    fn test_values_are_typed_by_column() {
        let registry = registry();
        let oqo = Oqo::new("Works").with_filters(vec![
            Filter::is("publication_year", "2020"),
            Filter::is("fwci", "1.5"),
            Filter::is("open_access.is_oa", "TRUE"),
            Filter::is("display_name", "2020"),
            Filter::is("publication_year", "2020-2024"),
            Filter::is("authorships.countries", "CA"),
        ]);
        let canonical = canonicalize(&oqo, &registry);
        assert_eq!(canonical.entity, "works");
        assert_eq!(
            canonical.filters,
            vec![
                Filter::is("publication_year", 2020i64),
                Filter::is("fwci", 1.5),
                Filter::is("open_access.is_oa", true),
                Filter::is("display_name", "2020"),
                Filter::is("publication_year", "2020-2024"),
                Filter::is("authorships.countries", "countries/ca"),
            ]
        );
    }

    #[test]
    fn test_boolean_negation_is_folded() {
        let registry = registry();
        let oqo = Oqo::new("works").with_filters(vec![Filter::leaf(
            "open_access.is_oa",
            Operator::IsNot,
            true,
        )]);
        let canonical = canonicalize(&oqo, &registry);
        assert_eq!(canonical.filters, vec![Filter::is("open_access.is_oa", false)]);
    }

    #[test]
    fn test_branches_are_flattened() {
        let registry = registry();
        let oqo = Oqo::new("works").with_filters(vec![
            Filter::and(vec![
                Filter::is("type", "types/article"),
                Filter::and(vec![Filter::is("language", "languages/en")]),
            ]),
            Filter::or(vec![]),
            Filter::or(vec![
                Filter::is("type", "types/book"),
                Filter::or(vec![
                    Filter::is("type", "types/dataset"),
                    Filter::is("type", "types/other"),
                ]),
            ]),
            Filter::or(vec![Filter::and(vec![Filter::is("fwci", 2i64)])]),
        ]);
        let canonical = canonicalize(&oqo, &registry);
        assert_eq!(
            canonical.filters,
            vec![
                Filter::is("type", "types/article"),
                Filter::is("language", "languages/en"),
                Filter::or(vec![
                    Filter::is("type", "types/book"),
                    Filter::is("type", "types/dataset"),
                    Filter::is("type", "types/other"),
                ]),
                Filter::is("fwci", 2i64),
            ]
        );
    }

    #[test]
    fn test_canonicalize_is_idempotent_on_example() {
        let registry = registry();
        let oqo = Oqo::new("Authors")
            .with_filters(vec![
                Filter::is("authorships.author.id", "https://openalex.org/A5"),
                Filter::or(vec![Filter::is("count(works)", "10"), Filter::is("fwci", "x")]),
            ])
            .sorted_by("count(works)", Some(SortOrder::Desc));
        let once = canonicalize(&oqo, &registry);
        assert_eq!(canonicalize(&once, &registry), once);
    }

    #[test]
    fn test_unknown_columns_pass_through() {
        let registry = registry();
        let oqo = Oqo::new("works").with_filters(vec![Filter::is("no.such.column", "Mixed/Case")]);
        let canonical = canonicalize(&oqo, &registry);
        assert_eq!(canonical.filters, vec![Filter::is("no.such.column", "Mixed/Case")]);
    }
}
