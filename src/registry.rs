//! Entity/column registry: `entity × column → ColumnDescriptor` lookups and
//! the per-entity join-path table, built once from a [`RegistryConfig`].
//!
//! Nothing here is mutable after construction, so one `Registry` can be
//! shared by any number of concurrent requests.

use crate::config::{
    AggregateFunction, BooleanDisplay, ColumnConfig, EntityConfig, RegistryConfig,
    RelationConfig, ValueType,
};
use crate::error::ConfigError;
use crate::oqo::{Operator, SortOrder};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// A physical `table.column` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

/// How a column is reached relationally.
#[derive(Debug, Clone, PartialEq)]
pub enum Relation {
    /// A column of the owning entity's table.
    Column(String),
    /// Many-valued; `table(key, value)` is a pre-materialized distinct relation.
    Association {
        table: String,
        key: String,
        value: String,
    },
    /// Aggregate over a fact-table column.
    Aggregate {
        function: AggregateFunction,
        column: String,
    },
}

/// Read-only description of one filterable/displayable column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub column_id: String,
    pub display_name: String,
    pub boolean_display: Option<BooleanDisplay>,
    pub value_type: ValueType,
    pub default_operator: Operator,
    pub operators: Vec<Operator>,
    /// The physical column a filter on this column constrains.
    pub relational_filter_column: ColumnRef,
    /// Where the display name of a referenced entity lives.
    pub relational_display_column: Option<ColumnRef>,
    pub is_search_column: bool,
    pub related_entity_type: Option<String>,
    pub relation: Relation,
}

impl ColumnDescriptor {
    pub fn is_numeric(&self) -> bool {
        self.value_type == ValueType::Number
    }

    pub fn is_boolean(&self) -> bool {
        self.value_type == ValueType::Boolean
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.relation, Relation::Aggregate { .. })
    }

    pub fn is_association(&self) -> bool {
        matches!(self.relation, Relation::Association { .. })
    }

    pub fn allows(&self, operator: Operator) -> bool {
        self.operators.contains(&operator)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinHop {
    pub table: String,
    pub from: String,
    pub to: String,
    pub fans_out: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescriptor {
    pub id: String,
    pub display_name: String,
    pub table: String,
    pub key: String,
    pub display_column: String,
    pub join_path: Vec<JoinHop>,
    pub group_key: Option<ColumnRef>,
    pub default_columns: Vec<String>,
    pub default_sort: Option<(String, SortOrder)>,
    columns: Vec<ColumnDescriptor>,
    column_index: HashMap<String, usize>,
}

impl EntityDescriptor {
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn column(&self, column_id: &str) -> Option<&ColumnDescriptor> {
        self.column_index.get(column_id).map(|&i| &self.columns[i])
    }

    /// True when one entity row can match several fact rows through a
    /// many-to-many hop.
    pub fn fans_out(&self) -> bool {
        self.join_path.iter().any(|hop| hop.fans_out)
    }
}

/// Which table a column resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The queried (non-fact) entity's own columns.
    Entity,
    /// The fact table's columns.
    Fact,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvedColumn<'r> {
    pub scope: Scope,
    pub descriptor: &'r ColumnDescriptor,
}

#[derive(Debug, Clone)]
pub struct Registry {
    entities: Vec<EntityDescriptor>,
    index: HashMap<String, usize>,
    fact: usize,
    co_relationship_exclusions: HashSet<String>,
}

impl Registry {
    /// The registry embedded in the crate.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_config(RegistryConfig::builtin()?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_config(RegistryConfig::from_json_file(path)?)
    }

    /// Builds lookup tables and checks the file's internal consistency.
    pub fn from_config(config: RegistryConfig) -> Result<Self, ConfigError> {
        let mut index = HashMap::new();
        for (i, entity) in config.entities.iter().enumerate() {
            if index.insert(entity.id.to_lowercase(), i).is_some() {
                return Err(invalid(format!("duplicate entity `{}`", entity.id)));
            }
        }

        let fact = *index
            .get(&config.fact_entity.to_lowercase())
            .ok_or_else(|| invalid(format!("fact entity `{}` is not defined", config.fact_entity)))?;
        let fact_table = config.entities[fact].table.clone();

        let tables: HashMap<&str, (&str, &str)> = config
            .entities
            .iter()
            .map(|e| (e.id.as_str(), (e.table.as_str(), e.display_column.as_str())))
            .collect();

        let mut entities = Vec::with_capacity(config.entities.len());
        for (i, entity) in config.entities.iter().enumerate() {
            let is_fact = i == fact;
            check_join_path(entity, is_fact, &fact_table)?;
            entities.push(build_entity(entity, &tables, &fact_table)?);
        }

        let registry = Self {
            entities,
            index,
            fact,
            co_relationship_exclusions: config
                .co_relationship_exclusions
                .iter()
                .map(|e| e.to_lowercase())
                .collect(),
        };
        registry.check_defaults()?;
        Ok(registry)
    }

    fn check_defaults(&self) -> Result<(), ConfigError> {
        for entity in &self.entities {
            let own = |c: &str| {
                if entity.id == self.fact_entity().id {
                    entity.column(c).is_some()
                } else {
                    entity.column(c).is_some() || self.fact_entity().column(c).is_some()
                }
            };
            if let Some(missing) = entity.default_columns.iter().find(|c| !own(c)) {
                return Err(invalid(format!(
                    "default column `{}` of `{}` is not defined",
                    missing, entity.id
                )));
            }
            if let Some((column, _)) = &entity.default_sort {
                if entity.column(column).is_none() {
                    return Err(invalid(format!(
                        "default sort column `{}` of `{}` is not defined",
                        column, entity.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.iter()
    }

    pub fn entity(&self, id: &str) -> Option<&EntityDescriptor> {
        self.index
            .get(&id.to_lowercase())
            .map(|&i| &self.entities[i])
    }

    pub fn fact_entity(&self) -> &EntityDescriptor {
        &self.entities[self.fact]
    }

    pub fn is_fact(&self, entity_id: &str) -> bool {
        self.entity(entity_id)
            .is_some_and(|e| e.id == self.fact_entity().id)
    }

    /// Matches a user-typed entity name (display name or id), ignoring case,
    /// hyphens and extra whitespace.
    pub fn find_entity_by_name(&self, name: &str) -> Option<&EntityDescriptor> {
        let wanted = normalize_entity_name(name);
        self.entities.iter().find(|e| {
            normalize_entity_name(&e.id) == wanted || normalize_entity_name(&e.display_name) == wanted
        })
    }

    /// A column of the entity itself, without falling back to the fact table.
    pub fn column(&self, entity_id: &str, column_id: &str) -> Option<&ColumnDescriptor> {
        self.entity(entity_id)?.column(column_id)
    }

    /// Resolves a column id for a query on `entity_id`: the entity's own
    /// columns shadow fact columns with the same id.
    pub fn resolve_column(&self, entity_id: &str, column_id: &str) -> Option<ResolvedColumn<'_>> {
        let entity = self.entity(entity_id)?;
        let fact = self.fact_entity();
        if entity.id != fact.id {
            if let Some(descriptor) = entity.column(column_id) {
                return Some(ResolvedColumn {
                    scope: Scope::Entity,
                    descriptor,
                });
            }
        }
        fact.column(column_id).map(|descriptor| ResolvedColumn {
            scope: Scope::Fact,
            descriptor,
        })
    }

    /// Columns visible to OQL for `entity_id`, entity columns first.
    pub fn oql_columns(&self, entity_id: &str) -> Vec<&ColumnDescriptor> {
        let fact = self.fact_entity();
        let mut columns: Vec<&ColumnDescriptor> = Vec::new();
        if let Some(entity) = self.entity(entity_id) {
            if entity.id != fact.id {
                columns.extend(entity.columns());
            }
        }
        columns.extend(fact.columns());
        columns
    }

    /// Finds the column an OQL phrase names: display names before raw ids,
    /// entity columns before fact columns.
    pub fn column_by_display(&self, entity_id: &str, phrase: &str) -> Option<&ColumnDescriptor> {
        let wanted = normalize_column_name(phrase);
        let columns = self.oql_columns(entity_id);
        columns
            .iter()
            .find(|c| normalize_column_name(&c.display_name) == wanted)
            .or_else(|| columns.iter().find(|c| c.column_id.to_lowercase() == wanted))
            .copied()
    }

    /// Finds a boolean column by its idiom name (`Open Access` in
    /// `it's Open Access`), falling back to the raw column id.
    pub fn boolean_by_display(&self, entity_id: &str, phrase: &str) -> Option<&ColumnDescriptor> {
        let wanted = normalize_column_name(phrase);
        let columns = self.oql_columns(entity_id);
        columns
            .iter()
            .find(|c| {
                c.boolean_display
                    .as_ref()
                    .is_some_and(|b| normalize_column_name(&b.name) == wanted)
            })
            .or_else(|| {
                columns
                    .iter()
                    .find(|c| c.is_boolean() && c.column_id.to_lowercase() == wanted)
            })
            .copied()
    }

    /// The text OQL uses for a column. Falls back to the raw id whenever the
    /// display name would parse back to a different column.
    pub fn column_display_name(&self, entity_id: &str, column_id: &str) -> String {
        self.resolve_column(entity_id, column_id)
            .map(|r| r.descriptor.display_name.clone())
            .filter(|name| {
                self.column_by_display(entity_id, name)
                    .is_some_and(|c| c.column_id == column_id)
            })
            .unwrap_or_else(|| column_id.to_string())
    }

    /// The boolean idiom name for a column, checked the same way.
    pub fn boolean_display_name(&self, entity_id: &str, column_id: &str) -> Option<BooleanDisplay> {
        let resolved = self.resolve_column(entity_id, column_id)?;
        let display = resolved.descriptor.boolean_display.clone()?;
        let round_trips = self
            .boolean_by_display(entity_id, &display.name)
            .is_some_and(|c| c.column_id == column_id);
        Some(if round_trips {
            display
        } else {
            BooleanDisplay {
                name: column_id.to_string(),
                idiom: display.idiom,
            }
        })
    }

    /// A fact-scoped association column whose related entity is the queried
    /// entity itself ("co-authors of X" rather than "X").
    pub fn is_co_relationship(&self, target_entity: &str, column: &ColumnDescriptor) -> bool {
        let target = target_entity.to_lowercase();
        column.is_association()
            && !self.is_fact(&target)
            && column.related_entity_type.as_deref() == Some(target.as_str())
            && !self.co_relationship_exclusions.contains(&target)
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid(message)
}

fn check_join_path(entity: &EntityConfig, is_fact: bool, fact_table: &str) -> Result<(), ConfigError> {
    match (is_fact, entity.join_path.last()) {
        (true, None) => Ok(()),
        (true, Some(_)) => Err(invalid(format!(
            "fact entity `{}` cannot have a join path",
            entity.id
        ))),
        (false, Some(hop)) if hop.table == fact_table => Ok(()),
        _ => Err(invalid(format!(
            "join path of `{}` must end at the fact table `{}`",
            entity.id, fact_table
        ))),
    }
}

fn build_entity(
    entity: &EntityConfig,
    tables: &HashMap<&str, (&str, &str)>,
    fact_table: &str,
) -> Result<EntityDescriptor, ConfigError> {
    let mut columns = Vec::with_capacity(entity.columns.len());
    let mut column_index = HashMap::new();
    let mut display_names = HashSet::new();

    for column in &entity.columns {
        if column_index.insert(column.id.clone(), columns.len()).is_some() {
            return Err(invalid(format!(
                "duplicate column `{}` in `{}`",
                column.id, entity.id
            )));
        }
        if !display_names.insert(normalize_column_name(&column.display_name)) {
            return Err(invalid(format!(
                "duplicate display name `{}` in `{}`",
                column.display_name, entity.id
            )));
        }
        columns.push(build_column(column, &entity.table, tables, fact_table)?);
    }

    Ok(EntityDescriptor {
        id: entity.id.to_lowercase(),
        display_name: entity.display_name.clone(),
        table: entity.table.clone(),
        key: entity.key.clone(),
        display_column: entity.display_column.clone(),
        join_path: entity
            .join_path
            .iter()
            .map(|hop| JoinHop {
                table: hop.table.clone(),
                from: hop.from.clone(),
                to: hop.to.clone(),
                fans_out: hop.fans_out,
            })
            .collect(),
        group_key: entity
            .group_key
            .as_ref()
            .map(|g| ColumnRef::new(&g.table, &g.column)),
        default_columns: entity.default_columns.clone(),
        default_sort: entity
            .default_sort
            .as_ref()
            .map(|s| (s.column.clone(), s.order)),
        columns,
        column_index,
    })
}

fn build_column(
    column: &ColumnConfig,
    owner_table: &str,
    tables: &HashMap<&str, (&str, &str)>,
    fact_table: &str,
) -> Result<ColumnDescriptor, ConfigError> {
    let relational_display_column = match &column.related_entity {
        Some(related) => {
            let (table, display) = tables.get(related.as_str()).ok_or_else(|| {
                invalid(format!(
                    "column `{}` references unknown entity `{}`",
                    column.id, related
                ))
            })?;
            Some(ColumnRef::new(*table, *display))
        }
        None => None,
    };

    let (relation, relational_filter_column) = match &column.relation {
        RelationConfig::Column { column: c } => {
            (Relation::Column(c.clone()), ColumnRef::new(owner_table, c))
        }
        RelationConfig::Association { table, key, value } => (
            Relation::Association {
                table: table.clone(),
                key: key.clone(),
                value: value.clone(),
            },
            ColumnRef::new(table, value),
        ),
        RelationConfig::Aggregate { function, column: c } => (
            Relation::Aggregate {
                function: *function,
                column: c.clone(),
            },
            ColumnRef::new(fact_table, c),
        ),
    };

    let operators = column
        .operators
        .clone()
        .unwrap_or_else(|| column.value_type.default_operators());
    let default_operator = column.default_operator.unwrap_or(Operator::Is);
    if !operators.contains(&default_operator) {
        return Err(invalid(format!(
            "default operator `{}` is not allowed for column `{}`",
            default_operator, column.id
        )));
    }

    Ok(ColumnDescriptor {
        column_id: column.id.clone(),
        display_name: column.display_name.clone(),
        boolean_display: column.boolean_display.clone(),
        value_type: column.value_type,
        default_operator,
        operators,
        relational_filter_column,
        relational_display_column,
        is_search_column: column.search,
        related_entity_type: column.related_entity.as_ref().map(|r| r.to_lowercase()),
        relation,
    })
}

/// Lowercase, hyphens/underscores as spaces, single spaces.
pub fn normalize_entity_name(name: &str) -> String {
    name.to_lowercase()
        .replace(['-', '_'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lowercase, single spaces.
pub fn normalize_column_name(name: &str) -> String {
    name.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::builtin().unwrap()
    }

    #[test]
    fn test_builtin_registry_is_consistent() {
        let registry = registry();
        assert_eq!(registry.fact_entity().id, "works");
        assert!(registry.entities().count() >= 10);
        for entity in registry.entities() {
            if entity.id != "works" {
                assert_eq!(entity.join_path.last().unwrap().table, "works");
            }
        }
    }

    #[test]
    fn test_resolve_column_prefers_entity_scope() {
        let registry = registry();
        let resolved = registry.resolve_column("authors", "display_name").unwrap();
        assert_eq!(resolved.scope, Scope::Entity);
        assert_eq!(resolved.descriptor.display_name, "name");

        let resolved = registry.resolve_column("authors", "publication_year").unwrap();
        assert_eq!(resolved.scope, Scope::Fact);

        let resolved = registry.resolve_column("works", "display_name").unwrap();
        assert_eq!(resolved.scope, Scope::Fact);
        assert!(registry.resolve_column("works", "count(works)").is_none());
    }

    #[test]
    fn test_find_entity_by_name_ignores_case_and_hyphens() {
        let registry = registry();
        assert_eq!(registry.find_entity_by_name("WORKS").unwrap().id, "works");
        assert_eq!(registry.find_entity_by_name("work-types").unwrap().id, "types");
        assert_eq!(registry.find_entity_by_name("Work  types").unwrap().id, "types");
        assert!(registry.find_entity_by_name("widgets").is_none());
    }

    #[test]
    fn test_column_by_display_and_raw_id() {
        let registry = registry();
        assert_eq!(
            registry.column_by_display("works", "Year").unwrap().column_id,
            "publication_year"
        );
        assert_eq!(
            registry
                .column_by_display("works", "authorships.author.id")
                .unwrap()
                .column_id,
            "authorships.author.id"
        );
        assert_eq!(
            registry.boolean_by_display("works", "open access").unwrap().column_id,
            "open_access.is_oa"
        );
    }

    #[test]
    fn test_display_name_falls_back_to_id_on_shadowing() {
        let registry = registry();
        assert_eq!(registry.column_display_name("works", "cited_by_count"), "citations");
        assert_eq!(registry.column_display_name("works", "not.a.column"), "not.a.column");
    }

    #[test]
    fn test_descriptor_fields() {
        let registry = registry();
        let author = registry.column("works", "authorships.author.id").unwrap();
        assert_eq!(author.related_entity_type.as_deref(), Some("authors"));
        assert_eq!(
            author.relational_filter_column,
            ColumnRef::new("work_author_distinct", "author_id")
        );
        assert_eq!(
            author.relational_display_column,
            Some(ColumnRef::new("authors", "display_name"))
        );

        let search = registry.column("works", "title.search").unwrap();
        assert!(search.is_search_column);
        assert_eq!(search.default_operator, Operator::Contains);
    }

    #[test]
    fn test_co_relationship_classification() {
        let registry = registry();
        let author = registry.column("works", "authorships.author.id").unwrap();
        let institution = registry.column("works", "authorships.institutions.id").unwrap();
        assert!(registry.is_co_relationship("authors", author));
        assert!(!registry.is_co_relationship("works", author));
        assert!(!registry.is_co_relationship("institutions", author));
        // Excluded entity.
        assert!(!registry.is_co_relationship("institutions", institution));
    }

    #[test]
    fn test_join_path_must_reach_fact_table() {
        let mut config = RegistryConfig::builtin().unwrap();
        let authors = config.entities.iter_mut().find(|e| e.id == "authors").unwrap();
        authors.join_path.pop();
        let err = Registry::from_config(config).unwrap_err();
        assert!(err.to_string().contains("must end at the fact table"));
    }

    #[test]
    fn test_unknown_related_entity_is_rejected() {
        let mut config = RegistryConfig::builtin().unwrap();
        config.entities[0].columns[0].related_entity = Some("gadgets".to_string());
        let err = Registry::from_config(config).unwrap_err();
        assert!(err.to_string().contains("unknown entity `gadgets`"));
    }
}
