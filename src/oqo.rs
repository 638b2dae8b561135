//! The OpenAlex Query Object (OQO): the canonical, format-agnostic query IR.
//!
//! Every surface syntax parses into an [`Oqo`] and every renderer starts from
//! one. The JSON form uses the field names exposed at the API boundary:
//!
//! ```json
//! {
//!   "get_rows": "works",
//!   "filter_rows": [
//!     {"column_id": "open_access.is_oa", "value": true},
//!     {"join": "or", "filters": [
//!       {"column_id": "type", "value": "types/article"},
//!       {"column_id": "type", "value": "types/book"}
//!     ]}
//!   ],
//!   "sort_by_column": "cited_by_count",
//!   "sort_by_order": "desc",
//!   "sample": 100
//! }
//! ```

use crate::error::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The query root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Oqo {
    #[serde(rename = "get_rows")]
    pub entity: String,
    /// Implicitly AND-joined.
    #[serde(rename = "filter_rows", default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
    #[serde(rename = "sort_by_column", default, skip_serializing_if = "Option::is_none")]
    pub sort_column: Option<String>,
    #[serde(rename = "sort_by_order", default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<SortOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<u32>,
}

impl Oqo {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            filters: Vec::new(),
            sort_column: None,
            sort_order: None,
            sample: None,
        }
    }

    pub fn with_filters(mut self, filters: Vec<Filter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn sorted_by(mut self, column: impl Into<String>, order: Option<SortOrder>) -> Self {
        self.sort_column = Some(column.into());
        self.sort_order = order;
        self
    }

    pub fn with_sample(mut self, sample: u32) -> Self {
        self.sample = Some(sample);
        self
    }

    /// Decodes the JSON form.
    pub fn from_json(input: &str) -> Result<Self, ParseError> {
        serde_json::from_str(input).map_err(|e| ParseError::Json {
            message: e.to_string(),
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        // Serializing plain data into a Value cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A node in the filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Branch(BranchFilter),
    Leaf(LeafFilter),
}

impl Filter {
    pub fn leaf(column_id: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Filter::Leaf(LeafFilter {
            column_id: column_id.into(),
            operator,
            value: value.into(),
        })
    }

    /// Shorthand for an `is` leaf.
    pub fn is(column_id: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::leaf(column_id, Operator::Is, value)
    }

    pub fn and(children: Vec<Filter>) -> Self {
        Filter::Branch(BranchFilter {
            join: Join::And,
            children,
        })
    }

    pub fn or(children: Vec<Filter>) -> Self {
        Filter::Branch(BranchFilter {
            join: Join::Or,
            children,
        })
    }

    pub fn as_leaf(&self) -> Option<&LeafFilter> {
        match self {
            Filter::Leaf(leaf) => Some(leaf),
            Filter::Branch(_) => None,
        }
    }

    /// Visits every leaf in tree order.
    pub fn for_each_leaf<'a>(&'a self, f: &mut impl FnMut(&'a LeafFilter)) {
        match self {
            Filter::Leaf(leaf) => f(leaf),
            Filter::Branch(branch) => {
                for child in &branch.children {
                    child.for_each_leaf(f);
                }
            }
        }
    }

    /// Column ids referenced anywhere below this node, in tree order.
    pub fn column_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        self.for_each_leaf(&mut |leaf| ids.push(leaf.column_id.as_str()));
        ids
    }
}

/// A single column/operator/value predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafFilter {
    pub column_id: String,
    #[serde(default, skip_serializing_if = "Operator::is_default")]
    pub operator: Operator,
    pub value: Value,
}

/// An AND/OR combination of child filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchFilter {
    pub join: Join,
    #[serde(rename = "filters")]
    pub children: Vec<Filter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Join {
    And,
    Or,
}

impl Join {
    pub fn as_str(&self) -> &'static str {
        match self {
            Join::And => "and",
            Join::Or => "or",
        }
    }
}

/// The closed operator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Operator {
    #[default]
    #[serde(rename = "is")]
    Is,
    #[serde(rename = "is not")]
    IsNot,
    #[serde(rename = "is greater than")]
    Gt,
    #[serde(rename = "is greater than or equal to")]
    Gte,
    #[serde(rename = "is less than")]
    Lt,
    #[serde(rename = "is less than or equal to")]
    Lte,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "does not contain")]
    NotContains,
}

impl Operator {
    pub const ALL: [Operator; 8] = [
        Operator::Is,
        Operator::IsNot,
        Operator::Gt,
        Operator::Gte,
        Operator::Lt,
        Operator::Lte,
        Operator::Contains,
        Operator::NotContains,
    ];

    fn is_default(&self) -> bool {
        *self == Operator::Is
    }

    /// The spelled-out form used in OQO JSON and OQL.
    pub fn as_words(&self) -> &'static str {
        match self {
            Operator::Is => "is",
            Operator::IsNot => "is not",
            Operator::Gt => "is greater than",
            Operator::Gte => "is greater than or equal to",
            Operator::Lt => "is less than",
            Operator::Lte => "is less than or equal to",
            Operator::Contains => "contains",
            Operator::NotContains => "does not contain",
        }
    }

    /// Symbolic form, for the comparison operators only.
    pub fn symbol(&self) -> Option<&'static str> {
        match self {
            Operator::Gt => Some(">"),
            Operator::Gte => Some(">="),
            Operator::Lt => Some("<"),
            Operator::Lte => Some("<="),
            _ => None,
        }
    }

    pub fn is_comparison(&self) -> bool {
        self.symbol().is_some()
    }

    /// True for the operators that exclude matches.
    pub fn is_negative(&self) -> bool {
        matches!(self, Operator::IsNot | Operator::NotContains)
    }

    /// The positive counterpart of a negative operator.
    pub fn positive(&self) -> Operator {
        match self {
            Operator::IsNot => Operator::Is,
            Operator::NotContains => Operator::Contains,
            other => *other,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_words())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        Operator::ALL
            .into_iter()
            .find(|op| op.as_words() == lowered || op.symbol() == Some(lowered.as_str()))
            .ok_or_else(|| format!("unknown operator `{}`", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(format!("unknown sort order `{}`", s)),
        }
    }
}

/// A typed filter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            // Debug keeps a trailing `.0` so floats never re-parse as ints.
            Value::Float(x) => write!(f, "{:?}", x),
            Value::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_field_names() {
        let oqo = Oqo::new("works")
            .with_filters(vec![
                Filter::is("open_access.is_oa", true),
                Filter::leaf("publication_year", Operator::Gte, 2020i64),
            ])
            .sorted_by("cited_by_count", Some(SortOrder::Desc))
            .with_sample(50);

        assert_eq!(
            oqo.to_json(),
            json!({
                "get_rows": "works",
                "filter_rows": [
                    {"column_id": "open_access.is_oa", "value": true},
                    {"column_id": "publication_year", "value": 2020,
                     "operator": "is greater than or equal to"}
                ],
                "sort_by_column": "cited_by_count",
                "sort_by_order": "desc",
                "sample": 50
            })
        );
    }

    #[test]
    fn test_decode_nested_branches() {
        let input = r#"{
            "get_rows": "works",
            "filter_rows": [
                {"join": "or", "filters": [
                    {"column_id": "type", "value": "types/article"},
                    {"column_id": "type", "value": null, "operator": "is not"}
                ]}
            ]
        }"#;
        let oqo = Oqo::from_json(input).unwrap();
        assert_eq!(
            oqo.filters,
            vec![Filter::or(vec![
                Filter::is("type", "types/article"),
                Filter::leaf("type", Operator::IsNot, Value::Null),
            ])]
        );
    }

    #[test]
    fn test_decode_typed_values() {
        let oqo = Oqo::from_json(
            r#"{"get_rows": "works", "filter_rows": [
                {"column_id": "a", "value": 3},
                {"column_id": "b", "value": 2.5},
                {"column_id": "c", "value": false},
                {"column_id": "d", "value": "x"}
            ]}"#,
        )
        .unwrap();
        let values: Vec<_> = oqo
            .filters
            .iter()
            .map(|f| f.as_leaf().unwrap().value.clone())
            .collect();
        assert_eq!(
            values,
            vec![
                Value::Int(3),
                Value::Float(2.5),
                Value::Bool(false),
                Value::String("x".to_string())
            ]
        );
    }

    #[test]
    fn test_unknown_operator_is_parse_error() {
        let err = Oqo::from_json(
            r#"{"get_rows": "works", "filter_rows": [
                {"column_id": "a", "value": 3, "operator": "roughly"}
            ]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::Json { .. }));
    }

    #[test]
    fn test_operator_from_str() {
        assert_eq!("is not".parse::<Operator>(), Ok(Operator::IsNot));
        assert_eq!(">=".parse::<Operator>(), Ok(Operator::Gte));
        assert_eq!("Does Not Contain".parse::<Operator>(), Ok(Operator::NotContains));
        assert!("about".parse::<Operator>().is_err());
    }

    #[test]
    fn test_float_display_keeps_fraction() {
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Int(2).to_string(), "2");
    }
}
