//! Registry configuration: loading the declarative entity/column file.
//!
//! The file describes, per entity, its table, its join path to the fact
//! table and its columns. It is turned into lookup tables by
//! [`Registry::from_config`](crate::registry::Registry::from_config).

use crate::error::ConfigError;
use crate::oqo::{Operator, SortOrder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// The registry shipped with the crate.
const BUILTIN_REGISTRY: &str = include_str!("../config/registry.json");

/// Root of the registry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Entity id of the central fact table.
    pub fact_entity: String,
    /// Entities for which co-relationship joins are never planned.
    #[serde(default)]
    pub co_relationship_exclusions: Vec<String>,
    pub entities: Vec<EntityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    pub id: String,
    pub display_name: String,
    pub table: String,
    /// Primary key column of `table`.
    pub key: String,
    pub display_column: String,
    /// Hops from the entity table to the fact table. Empty for the fact entity.
    #[serde(default)]
    pub join_path: Vec<JoinHopConfig>,
    /// Extra GROUP BY key for entities mapped through an association.
    #[serde(default)]
    pub group_key: Option<ColumnRefConfig>,
    #[serde(default)]
    pub default_columns: Vec<String>,
    #[serde(default)]
    pub default_sort: Option<SortConfig>,
    pub columns: Vec<ColumnConfig>,
}

/// `JOIN table ON previous.from = table.to`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinHopConfig {
    pub table: String,
    pub from: String,
    pub to: String,
    /// One row on the left may match many rows of `table`.
    #[serde(default)]
    pub fans_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnRefConfig {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortConfig {
    pub column: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub id: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub boolean_display: Option<BooleanDisplay>,
    #[serde(default)]
    pub default_operator: Option<Operator>,
    /// Overrides the operators allowed for `value_type`.
    #[serde(default)]
    pub operators: Option<Vec<Operator>>,
    #[serde(default)]
    pub search: bool,
    #[serde(default)]
    pub related_entity: Option<String>,
    pub relation: RelationConfig,
}

/// Semantic type of a column's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Number,
    Boolean,
    String,
    Entity,
}

impl ValueType {
    /// Operators allowed when the column does not override them.
    pub fn default_operators(&self) -> Vec<Operator> {
        match self {
            ValueType::Number => vec![
                Operator::Is,
                Operator::IsNot,
                Operator::Gt,
                Operator::Gte,
                Operator::Lt,
                Operator::Lte,
            ],
            ValueType::Boolean | ValueType::Entity => vec![Operator::Is, Operator::IsNot],
            ValueType::String => vec![
                Operator::Is,
                Operator::IsNot,
                Operator::Contains,
                Operator::NotContains,
            ],
        }
    }
}

/// How a boolean column reads in OQL: `it's {name}` or `it has {name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BooleanDisplay {
    pub name: String,
    pub idiom: BooleanIdiom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BooleanIdiom {
    Is,
    Has,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelationConfig {
    /// A column of the owning entity's table.
    Column { column: String },
    /// A many-valued association backed by a distinct relation
    /// `table(key, value)`, `key` referencing the owner's key.
    Association {
        table: String,
        key: String,
        value: String,
    },
    /// An aggregate over a fact-table column.
    Aggregate {
        function: AggregateFunction,
        column: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Mean,
    Percent,
}

impl RegistryConfig {
    /// Loads a registry file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let content = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.display().to_string(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// The registry embedded in the crate.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_json_str(BUILTIN_REGISTRY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_config_parses() {
        let config = RegistryConfig::builtin().unwrap();
        assert_eq!(config.fact_entity, "works");
        assert!(config.entities.iter().any(|e| e.id == "authors"));
        assert_eq!(
            config.co_relationship_exclusions,
            vec!["countries", "institutions", "keywords"]
        );
    }

    #[test]
    fn test_load_valid_json_config() {
        let temp_file = std::env::temp_dir().join("oql_test_registry.json");
        let mut file = fs::File::create(&temp_file).unwrap();
        writeln!(
            file,
            r#"{{
                "fact_entity": "works",
                "entities": [{{
                    "id": "works", "display_name": "Works", "table": "works",
                    "key": "work_id", "display_column": "display_name",
                    "columns": [{{
                        "id": "publication_year", "display_name": "year", "type": "number",
                        "relation": {{ "kind": "column", "column": "publication_year" }}
                    }}]
                }}]
            }}"#
        )
        .unwrap();

        let config = RegistryConfig::from_json_file(&temp_file).unwrap();
        assert_eq!(config.entities.len(), 1);
        assert_eq!(config.entities[0].columns[0].value_type, ValueType::Number);
        assert!(config.co_relationship_exclusions.is_empty());

        fs::remove_file(&temp_file).ok();
    }

    #[test]
    fn test_invalid_json_config() {
        let result = RegistryConfig::from_json_str("invalid json");
        assert!(matches!(result, Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = RegistryConfig::from_json_file("non_existent_registry.json");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_relation_kinds() {
        let relation: RelationConfig = serde_json::from_str(
            r#"{"kind": "aggregate", "function": "percent", "column": "is_oa"}"#,
        )
        .unwrap();
        assert!(matches!(
            relation,
            RelationConfig::Aggregate {
                function: AggregateFunction::Percent,
                ..
            }
        ));
    }
}
