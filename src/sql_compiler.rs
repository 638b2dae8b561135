//! Relational compiler: turns a query request into PostgreSQL using sea-query.
//!
//! The generated row statement has three layers:
//!
//! ```text
//! SELECT *, COUNT(*) OVER () AS total_count      -- pagination total, order, limit
//! FROM (
//!     SELECT * FROM (inner) AS sampled           -- only with `sample`
//!     ORDER BY RANDOM() LIMIT n
//! ) AS q
//! ```
//!
//! The inner statement joins the entity table to the fact table along the
//! registry's join path and applies the filter trees. For entity queries it
//! also handles projections, grouping and HAVING.

use crate::canonical::{parse_number, short_id};
use crate::config::AggregateFunction;
use crate::error::CompileError;
use crate::oqo::{Filter, Join, LeafFilter, Operator, Oqo, SortOrder, Value};
use crate::registry::{ColumnDescriptor, EntityDescriptor, Registry, Relation, ResolvedColumn, Scope};
use crate::url_filter::numeric_range;
use sea_query::{
    Alias, Asterisk, Cond, Condition, Expr, Func, Iden, JoinType, NullOrdering, Order,
    PostgresQueryBuilder, Query, SelectStatement, SimpleExpr, SubQueryStatement,
    Value as SqlValue,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Alias of the window column carrying the pre-pagination row count.
pub const TOTAL_COUNT_ALIAS: &str = "total_count";
/// Alias of the fact-count statement's single column.
pub const WORKS_COUNT_ALIAS: &str = "works_count";
/// Suffix of the sibling column holding an entity reference's display name.
pub const DISPLAY_SUFFIX: &str = "__display";

/// Limits applied to every compiled statement.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Rows returned per page.
    pub max_rows: u64,
    /// Attached to each statement for the backend to enforce.
    pub statement_timeout: Duration,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_rows: 100,
            statement_timeout: Duration::from_secs(30),
        }
    }
}

/// Table or alias identifier for sea-query
#[derive(Debug, Clone)]
pub struct TableName(pub String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl Iden for TableName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        let _ = s.write_str(&self.0);
    }
}

/// Column identifier wrapper
#[derive(Debug, Clone)]
pub struct ColumnName(pub String);

impl ColumnName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl Iden for ColumnName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        let _ = s.write_str(&self.0);
    }
}

fn column(table: &str, name: &str) -> Expr {
    Expr::col((TableName::new(table), ColumnName::new(name)))
}

/// What the compiler is asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileRequest {
    pub entity: String,
    /// Filters on fact-table columns.
    pub work_filters: Vec<Filter>,
    /// Filters on the entity's own columns.
    pub entity_filters: Vec<Filter>,
    /// Output columns; empty means the entity's default columns.
    pub show_columns: Vec<String>,
    pub sort: Option<(String, SortOrder)>,
    pub sample: Option<u32>,
    /// List the fact rows behind the matching entities instead of the
    /// entities themselves.
    pub show_underlying_works: bool,
}

impl CompileRequest {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            work_filters: Vec::new(),
            entity_filters: Vec::new(),
            show_columns: Vec::new(),
            sort: None,
            sample: None,
            show_underlying_works: false,
        }
    }

    /// Splits the top-level filters of a canonical OQO by scope. A filter
    /// goes to the entity tree when any column it names resolves to the
    /// entity itself, so shadowed ids resolve the way `Registry::resolve_column`
    /// does; its other leaves still fall back to the fact table.
    pub fn from_oqo(oqo: &Oqo, registry: &Registry) -> Self {
        let mut request = Self::new(oqo.entity.clone());
        let fact_query = registry.is_fact(&oqo.entity);
        for filter in &oqo.filters {
            let entity_scoped = !fact_query
                && filter.column_ids().iter().any(|id| {
                    registry
                        .resolve_column(&oqo.entity, id)
                        .is_some_and(|r| r.scope == Scope::Entity)
                });
            if entity_scoped {
                request.entity_filters.push(filter.clone());
            } else {
                request.work_filters.push(filter.clone());
            }
        }
        request.sort = oqo
            .sort_column
            .clone()
            .map(|c| (c, oqo.sort_order.unwrap_or(SortOrder::Asc)));
        request.sample = oqo.sample;
        request
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.show_columns = columns;
        self
    }

    pub fn underlying_works(mut self) -> Self {
        self.show_underlying_works = true;
        self
    }

    fn filters(&self) -> impl Iterator<Item = (&Filter, Scope)> {
        self.work_filters
            .iter()
            .map(|f| (f, Scope::Fact))
            .chain(self.entity_filters.iter().map(|f| (f, Scope::Entity)))
    }
}

/// A SQL string plus the timeout the backend must enforce for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlStatement {
    pub sql: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// A hop of the entity's join path to the fact table.
    Path,
    /// A separately aliased join for a co-relationship filter.
    CoRelationship,
    /// Lookup of an entity reference's display name.
    Display,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedJoin {
    pub kind: JoinKind,
    pub table: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProjectionKind {
    Value,
    /// A short entity id; the display name sits in `<alias>__display`.
    Entity { entity_type: String },
    /// JSON array of `{id, display_name}` objects.
    List { entity_type: Option<String> },
    Aggregate { function: AggregateFunction },
    /// Distinct entities behind each fact row.
    EntityCount,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Projection {
    pub alias: String,
    pub kind: ProjectionKind,
}

/// Inspectable summary of what was compiled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub entity: String,
    pub joins: Vec<PlannedJoin>,
    pub projections: Vec<Projection>,
    pub group_by: Vec<String>,
    pub distinct: bool,
    /// Aggregate columns with a HAVING tree.
    pub having: Vec<String>,
    pub sort: Option<(String, SortOrder)>,
    pub sample: Option<u32>,
    pub limit: u64,
}

#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub plan: QueryPlan,
    pub rows: SqlStatement,
    /// Distinct fact rows behind the result; only for non-fact entities.
    pub works_count: Option<SqlStatement>,
}

/// SQL compiler bound to one registry.
pub struct SqlCompiler {
    config: CompilerConfig,
    registry: Arc<Registry>,
}

impl SqlCompiler {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_config(registry, CompilerConfig::default())
    }

    pub fn with_config(registry: Arc<Registry>, config: CompilerConfig) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Compiles a canonical OQO with the entity's default columns.
    pub fn compile_oqo(&self, oqo: &Oqo) -> Result<CompiledQuery, CompileError> {
        self.compile(&CompileRequest::from_oqo(oqo, &self.registry))
    }

    pub fn compile(&self, request: &CompileRequest) -> Result<CompiledQuery, CompileError> {
        let registry = self.registry.as_ref();
        let entity = registry
            .entity(&request.entity)
            .ok_or_else(|| precondition(format!("unknown entity `{}`", request.entity)))?;
        let is_fact = registry.is_fact(&entity.id);

        let (inner, mut plan) = if request.show_underlying_works && !is_fact {
            self.underlying_works(entity, request)?
        } else {
            self.entity_rows(entity, request)?
        };
        plan.sample = request.sample;
        plan.limit = self.config.max_rows;

        let rows = self.statement(self.paginate(inner, &plan));
        let works_count = if is_fact {
            None
        } else {
            Some(self.statement(self.works_count(entity, request)?))
        };

        debug!(entity = %entity.id, sql = %rows.sql, "compiled row query");
        Ok(CompiledQuery {
            plan,
            rows,
            works_count,
        })
    }

    fn statement(&self, select: SelectStatement) -> SqlStatement {
        SqlStatement {
            sql: select.to_string(PostgresQueryBuilder),
            timeout: self.config.statement_timeout,
        }
    }

    /// One row per entity (or per fact row for the fact entity).
    fn entity_rows(
        &self,
        entity: &EntityDescriptor,
        request: &CompileRequest,
    ) -> Result<(SelectStatement, QueryPlan), CompileError> {
        let registry = self.registry.as_ref();
        let fact = registry.fact_entity();
        let is_fact = entity.id == fact.id;
        let mut builder = StatementBuilder::new(registry, entity);
        builder.apply_where(request)?;

        let mut columns = Vec::new();
        let requested = if request.show_columns.is_empty() {
            &entity.default_columns
        } else {
            &request.show_columns
        };
        for id in requested {
            columns.push(self.show_column(entity, id)?);
        }

        let sort = match &request.sort {
            Some((id, order)) => Some((id.clone(), *order)),
            None => entity.default_sort.clone(),
        };
        if let Some((id, _)) = &sort {
            if !columns.iter().any(|(_, d)| &d.column_id == id) {
                columns.push(self.show_column(entity, id)?);
            }
        }

        for (owner, descriptor) in &columns {
            builder.project(owner, descriptor)?;
        }

        let aggregated = builder.apply_having(request)?
            || columns.iter().any(|(_, d)| d.is_aggregate());
        if !is_fact {
            if aggregated {
                builder.group_by(column(&entity.table, &entity.key).into(), &entity.table, &entity.key);
                builder.group_by_projections();
                if let Some(group_key) = &entity.group_key {
                    builder.group_by(
                        column(&group_key.table, &group_key.column).into(),
                        &group_key.table,
                        &group_key.column,
                    );
                }
            } else {
                builder.distinct();
            }
        }

        Ok(builder.finish(sort))
    }

    /// The fact rows behind the matching entities.
    fn underlying_works(
        &self,
        entity: &EntityDescriptor,
        request: &CompileRequest,
    ) -> Result<(SelectStatement, QueryPlan), CompileError> {
        let registry = self.registry.as_ref();
        let fact = registry.fact_entity();
        let mut builder = StatementBuilder::new(registry, entity);
        builder.apply_where(request)?;
        if let Some(keys) = self.qualifying_keys(entity, request)? {
            builder
                .select
                .and_where(column(&entity.table, &entity.key).in_subquery(keys));
        }

        let requested = if request.show_columns.is_empty() {
            &fact.default_columns
        } else {
            &request.show_columns
        };
        let mut columns = Vec::new();
        for id in requested {
            columns.push(fact_column(fact, id)?);
        }
        let sort = match &request.sort {
            Some((id, order)) if fact.column(id).is_some() => Some((id.clone(), *order)),
            _ => fact.default_sort.clone(),
        };
        if let Some((id, _)) = &sort {
            if !columns.iter().any(|d| &d.column_id == id) {
                columns.push(fact_column(fact, id)?);
            }
        }
        for descriptor in columns {
            builder.project(fact, descriptor)?;
        }

        if entity.fans_out() {
            let alias = format!("{}_count", entity.id);
            builder.select.expr_as(
                Func::count_distinct(column(&entity.table, &entity.key)),
                Alias::new(alias.as_str()),
            );
            builder.plan.projections.push(Projection {
                alias,
                kind: ProjectionKind::EntityCount,
            });
            builder.group_by(column(&fact.table, &fact.key).into(), &fact.table, &fact.key);
            builder.group_by_projections();
        } else {
            builder.distinct();
        }

        Ok(builder.finish(sort))
    }

    /// Keys of the entities passing the aggregate filters, or `None` when no
    /// filter names an aggregate.
    fn qualifying_keys(
        &self,
        entity: &EntityDescriptor,
        request: &CompileRequest,
    ) -> Result<Option<SelectStatement>, CompileError> {
        let mut builder = StatementBuilder::new(self.registry.as_ref(), entity);
        if !builder.apply_having(request)? {
            return Ok(None);
        }
        builder.apply_where(request)?;
        builder.select.column((TableName::new(&entity.table), ColumnName::new(&entity.key)));
        builder.group_by(column(&entity.table, &entity.key).into(), &entity.table, &entity.key);
        if let Some(group_key) = &entity.group_key {
            builder.group_by(
                column(&group_key.table, &group_key.column).into(),
                &group_key.table,
                &group_key.column,
            );
        }
        Ok(Some(builder.select))
    }

    fn works_count(
        &self,
        entity: &EntityDescriptor,
        request: &CompileRequest,
    ) -> Result<SelectStatement, CompileError> {
        let fact = self.registry.fact_entity();
        let mut builder = StatementBuilder::new(self.registry.as_ref(), entity);
        builder.apply_where(request)?;
        if let Some(keys) = self.qualifying_keys(entity, request)? {
            builder
                .select
                .and_where(column(&entity.table, &entity.key).in_subquery(keys));
        }
        builder.select.expr_as(
            Func::count_distinct(column(&fact.table, &fact.key)),
            Alias::new(WORKS_COUNT_ALIAS),
        );
        Ok(builder.select)
    }

    /// A column shown for an entity query. Non-fact entities only show their
    /// own columns since the rows are grouped per entity.
    fn show_column<'r>(
        &'r self,
        entity: &'r EntityDescriptor,
        id: &str,
    ) -> Result<(&'r EntityDescriptor, &'r ColumnDescriptor), CompileError> {
        entity
            .column(id)
            .map(|d| (entity, d))
            .ok_or_else(|| precondition(format!("`{}` is not a column of `{}`", id, entity.id)))
    }

    fn paginate(&self, inner: SelectStatement, plan: &QueryPlan) -> SelectStatement {
        let source = match plan.sample {
            Some(size) => {
                let mut sampled = Query::select();
                sampled
                    .column(Asterisk)
                    .from_subquery(inner, Alias::new("sampled"))
                    .order_by_expr(Expr::cust("RANDOM()"), Order::Asc)
                    .limit(u64::from(size));
                sampled
            }
            None => inner,
        };

        let mut outer = Query::select();
        outer
            .column(Asterisk)
            .expr_as(Expr::cust("COUNT(*) OVER ()"), Alias::new(TOTAL_COUNT_ALIAS))
            .from_subquery(source, Alias::new("q"));
        if let Some((id, order)) = &plan.sort {
            outer.order_by_with_nulls(
                (Alias::new("q"), Alias::new(id.as_str())),
                match order {
                    SortOrder::Asc => Order::Asc,
                    SortOrder::Desc => Order::Desc,
                },
                NullOrdering::Last,
            );
        }
        outer.limit(self.config.max_rows);
        outer
    }
}

fn fact_column<'r>(fact: &'r EntityDescriptor, id: &str) -> Result<&'r ColumnDescriptor, CompileError> {
    fact.column(id)
        .ok_or_else(|| precondition(format!("`{}` is not a column of `{}`", id, fact.id)))
}

fn precondition(message: String) -> CompileError {
    error!(%message, "compiler precondition failed");
    CompileError::Precondition(message)
}

/// Accumulates one SELECT statement and the matching plan.
struct StatementBuilder<'r> {
    registry: &'r Registry,
    entity: &'r EntityDescriptor,
    fact: &'r EntityDescriptor,
    select: SelectStatement,
    plan: QueryPlan,
    /// Non-aggregate projected expressions, grouped when aggregating.
    groupable: Vec<(SimpleExpr, String)>,
    aliases: usize,
}

impl<'r> StatementBuilder<'r> {
    /// `FROM entity` followed by the entity's join path.
    fn new(registry: &'r Registry, entity: &'r EntityDescriptor) -> Self {
        let mut select = Query::select();
        select.from(TableName::new(&entity.table));
        let mut joins = Vec::with_capacity(entity.join_path.len());
        let mut previous = entity.table.as_str();
        for hop in &entity.join_path {
            select.join(
                JoinType::InnerJoin,
                TableName::new(&hop.table),
                column(previous, &hop.from).equals((TableName::new(&hop.table), ColumnName::new(&hop.to))),
            );
            joins.push(PlannedJoin {
                kind: JoinKind::Path,
                table: hop.table.clone(),
                alias: None,
            });
            previous = hop.table.as_str();
        }

        Self {
            registry,
            entity,
            fact: registry.fact_entity(),
            select,
            plan: QueryPlan {
                entity: entity.id.clone(),
                joins,
                projections: Vec::new(),
                group_by: Vec::new(),
                distinct: false,
                having: Vec::new(),
                sort: None,
                sample: None,
                limit: 0,
            },
            groupable: Vec::new(),
            aliases: 0,
        }
    }

    fn finish(mut self, sort: Option<(String, SortOrder)>) -> (SelectStatement, QueryPlan) {
        self.plan.sort = sort;
        (self.select, self.plan)
    }

    fn next_alias(&mut self, table: &str) -> String {
        self.aliases += 1;
        format!("{}_{}", table, self.aliases)
    }

    fn distinct(&mut self) {
        self.select.distinct();
        self.plan.distinct = true;
    }

    fn group_by(&mut self, expr: SimpleExpr, table: &str, name: &str) {
        let qualified = format!("{}.{}", table, name);
        if !self.plan.group_by.contains(&qualified) {
            self.select.add_group_by([expr]);
            self.plan.group_by.push(qualified);
        }
    }

    fn group_by_projections(&mut self) {
        for (expr, qualified) in std::mem::take(&mut self.groupable) {
            if !self.plan.group_by.contains(&qualified) {
                self.select.add_group_by([expr]);
                self.plan.group_by.push(qualified);
            }
        }
    }

    /// Resolves a leaf column. Entity trees resolve like
    /// `Registry::resolve_column`; fact trees prefer the fact column.
    fn resolve(&self, column_id: &str, preferred: Scope) -> Result<ResolvedColumn<'r>, CompileError> {
        let registry = self.registry;
        let found = match preferred {
            Scope::Entity => registry.resolve_column(&self.entity.id, column_id),
            Scope::Fact => self
                .fact
                .column(column_id)
                .map(|descriptor| ResolvedColumn {
                    scope: Scope::Fact,
                    descriptor,
                })
                .or_else(|| registry.resolve_column(&self.entity.id, column_id)),
        };
        found.ok_or_else(|| {
            precondition(format!(
                "column `{}` is not known for `{}`",
                column_id, self.entity.id
            ))
        })
    }

    fn owner(&self, scope: Scope) -> &'r EntityDescriptor {
        match scope {
            Scope::Entity => self.entity,
            Scope::Fact => self.fact,
        }
    }

    /// Whether any leaf of `filter` names an aggregate column.
    fn names_aggregate(&self, filter: &Filter, scope: Scope) -> Result<bool, CompileError> {
        for id in filter.column_ids() {
            if self.resolve(id, scope)?.descriptor.is_aggregate() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// WHERE: the top-level filters without aggregate leaves.
    fn apply_where(&mut self, request: &CompileRequest) -> Result<(), CompileError> {
        let mut conditions = Vec::new();
        for (filter, scope) in request.filters() {
            if self.names_aggregate(filter, scope)? {
                continue;
            }
            let tree = build_tree(filter, &mut |leaf: &LeafFilter| {
                let resolved = self.resolve(&leaf.column_id, scope)?;
                self.leaf_predicate(leaf, resolved)
            })?;
            conditions.extend(tree);
        }
        if !conditions.is_empty() {
            let all = conditions.into_iter().fold(Cond::all(), |all, c| all.add(c));
            self.select.cond_where(all);
        }
        Ok(())
    }

    /// HAVING: the top-level filters naming an aggregate, each compiled whole
    /// with its own AND/OR structure. Aggregate leaves compare the aggregate;
    /// row leaves become `BOOL_OR(predicate)` over the group. Returns whether
    /// anything was added.
    fn apply_having(&mut self, request: &CompileRequest) -> Result<bool, CompileError> {
        let mut having = Cond::all();
        let mut applied = false;
        for (filter, scope) in request.filters() {
            if !self.names_aggregate(filter, scope)? {
                continue;
            }
            let tree = build_tree(filter, &mut |leaf: &LeafFilter| {
                let resolved = self.resolve(&leaf.column_id, scope)?;
                let descriptor = resolved.descriptor;
                if !descriptor.is_aggregate() {
                    let row = self.leaf_predicate(leaf, resolved)?;
                    return Ok(SimpleExpr::from(Func::cust(Alias::new("BOOL_OR")).arg(row)));
                }
                if !self.plan.having.contains(&descriptor.column_id) {
                    self.plan.having.push(descriptor.column_id.clone());
                }
                let target = self.aggregate_expr(descriptor)?;
                Ok(column_predicate(target, descriptor, leaf))
            })?;
            if let Some(tree) = tree {
                having = having.add(tree);
                applied = true;
            }
        }
        if applied {
            self.select.cond_having(having);
        }
        Ok(applied)
    }

    fn leaf_predicate(
        &mut self,
        leaf: &LeafFilter,
        resolved: ResolvedColumn<'r>,
    ) -> Result<SimpleExpr, CompileError> {
        let descriptor = resolved.descriptor;
        match &descriptor.relation {
            Relation::Column(name) => {
                let owner = self.owner(resolved.scope);
                Ok(column_predicate(column(&owner.table, name).into(), descriptor, leaf))
            }
            Relation::Association { table, key, value } => {
                if resolved.scope == Scope::Fact
                    && !leaf.value.is_null()
                    && self.registry.is_co_relationship(&self.entity.id, descriptor)
                {
                    return Ok(self.co_relationship(leaf, descriptor, table, key, value));
                }
                let owner = self.owner(resolved.scope);
                Ok(semi_join(owner, leaf, descriptor, table, key, value))
            }
            Relation::Aggregate { .. } => Err(precondition(format!(
                "aggregate column `{}` cannot filter rows",
                descriptor.column_id
            ))),
        }
    }

    /// Joins the association again under a fresh alias so the primary join
    /// path is never restricted, and tests for a match.
    fn co_relationship(
        &mut self,
        leaf: &LeafFilter,
        descriptor: &ColumnDescriptor,
        table: &str,
        key: &str,
        value: &str,
    ) -> SimpleExpr {
        let alias = self.next_alias(&format!("co_{}", table));
        let positive = LeafFilter {
            operator: leaf.operator.positive(),
            ..leaf.clone()
        };
        let on = column(&alias, key)
            .equals((TableName::new(&self.fact.table), ColumnName::new(&self.fact.key)))
            .and(column_predicate(column(&alias, value).into(), descriptor, &positive));
        self.select.join_as(
            JoinType::LeftJoin,
            TableName::new(table),
            TableName::new(&alias),
            on,
        );
        self.plan.joins.push(PlannedJoin {
            kind: JoinKind::CoRelationship,
            table: table.to_string(),
            alias: Some(alias.clone()),
        });
        debug!(entity = %self.entity.id, column = %descriptor.column_id, %alias, "co-relationship join");

        let matched = column(&alias, key);
        if leaf.operator.is_negative() {
            matched.is_null()
        } else {
            matched.is_not_null()
        }
    }

    fn aggregate_expr(&self, descriptor: &ColumnDescriptor) -> Result<SimpleExpr, CompileError> {
        let Relation::Aggregate { function, column: name } = &descriptor.relation else {
            return Err(precondition(format!(
                "`{}` is not an aggregate column",
                descriptor.column_id
            )));
        };
        let target = column(&self.fact.table, name);
        Ok(match function {
            AggregateFunction::Count => Func::count_distinct(target).into(),
            AggregateFunction::Sum => Func::sum(target).into(),
            AggregateFunction::Mean => Func::avg(target).into(),
            AggregateFunction::Percent => {
                let hits = Func::sum(Expr::case(target.eq(true), 1).finally(0));
                Expr::expr(Expr::expr(hits).mul(100.0))
                    .div(Func::count(column(&self.fact.table, &self.fact.key)))
            }
        })
    }

    /// Adds one output column. Entity references get a sibling display-name
    /// column, association columns a JSON list.
    fn project(
        &mut self,
        owner: &'r EntityDescriptor,
        descriptor: &'r ColumnDescriptor,
    ) -> Result<(), CompileError> {
        let alias = descriptor.column_id.clone();
        match &descriptor.relation {
            Relation::Aggregate { function, .. } => {
                let expr = self.aggregate_expr(descriptor)?;
                self.select.expr_as(expr, Alias::new(alias.as_str()));
                self.plan.projections.push(Projection {
                    alias,
                    kind: ProjectionKind::Aggregate {
                        function: *function,
                    },
                });
            }
            Relation::Association { table, key, value } => {
                let list = self.list_subquery(owner, descriptor, table, key, value);
                self.select.expr_as(list, Alias::new(alias.as_str()));
                self.plan.projections.push(Projection {
                    alias,
                    kind: ProjectionKind::List {
                        entity_type: descriptor.related_entity_type.clone(),
                    },
                });
            }
            Relation::Column(name) => {
                let raw: SimpleExpr = column(&owner.table, name).into();
                self.select.expr_as(raw.clone(), Alias::new(alias.as_str()));
                self.groupable.push((raw, format!("{}.{}", owner.table, name)));
                let related = descriptor
                    .related_entity_type
                    .as_deref()
                    .and_then(|r| self.registry.entity(r));
                match related {
                    Some(related) => {
                        self.display_column(owner, name, related, &alias);
                        self.plan.projections.push(Projection {
                            alias,
                            kind: ProjectionKind::Entity {
                                entity_type: related.id.clone(),
                            },
                        });
                    }
                    None => self.plan.projections.push(Projection {
                        alias,
                        kind: ProjectionKind::Value,
                    }),
                }
            }
        }
        Ok(())
    }

    fn display_column(
        &mut self,
        owner: &EntityDescriptor,
        name: &str,
        related: &EntityDescriptor,
        alias: &str,
    ) {
        let display_alias = format!("{}{}", alias, DISPLAY_SUFFIX);
        // A table's own key displays from the same row.
        let (table, display) = if related.table == owner.table && related.key == name {
            (owner.table.clone(), related.display_column.clone())
        } else {
            let join_alias = self.next_alias(&related.table);
            self.select.join_as(
                JoinType::LeftJoin,
                TableName::new(&related.table),
                TableName::new(&join_alias),
                column(&join_alias, &related.key)
                    .equals((TableName::new(&owner.table), ColumnName::new(name))),
            );
            self.plan.joins.push(PlannedJoin {
                kind: JoinKind::Display,
                table: related.table.clone(),
                alias: Some(join_alias.clone()),
            });
            (join_alias, related.display_column.clone())
        };
        let expr: SimpleExpr = column(&table, &display).into();
        self.select.expr_as(expr.clone(), Alias::new(display_alias.as_str()));
        self.groupable.push((expr, format!("{}.{}", table, display)));
    }

    /// `(SELECT JSONB_AGG(...) FROM association WHERE key = owner.key)`
    fn list_subquery(
        &self,
        owner: &EntityDescriptor,
        descriptor: &ColumnDescriptor,
        table: &str,
        key: &str,
        value: &str,
    ) -> SimpleExpr {
        let items = "list_items";
        let names = "list_names";
        let related = descriptor
            .related_entity_type
            .as_deref()
            .and_then(|r| self.registry.entity(r));
        let display: SimpleExpr = match related {
            Some(related) => column(names, &related.display_column).into(),
            None => Expr::val(Option::<String>::None).into(),
        };
        let object = Func::cust(Alias::new("JSONB_BUILD_OBJECT")).args([
            Expr::val("id").into(),
            column(items, value).into(),
            Expr::val("display_name").into(),
            display,
        ]);

        let mut list = Query::select();
        list.expr(Func::cust(Alias::new("JSONB_AGG")).arg(object))
            .from_as(TableName::new(table), TableName::new(items));
        if let Some(related) = related {
            list.join_as(
                JoinType::LeftJoin,
                TableName::new(&related.table),
                TableName::new(names),
                column(names, &related.key).equals((TableName::new(items), ColumnName::new(value))),
            );
        }
        list.and_where(
            column(items, key).equals((TableName::new(&owner.table), ColumnName::new(&owner.key))),
        );
        SimpleExpr::SubQuery(None, Box::new(SubQueryStatement::SelectStatement(list)))
    }
}

/// Walks a filter tree into a condition of the same shape. Branches left
/// without any child disappear.
fn build_tree<F>(filter: &Filter, leaf: &mut F) -> Result<Option<Condition>, CompileError>
where
    F: FnMut(&LeafFilter) -> Result<SimpleExpr, CompileError>,
{
    match filter {
        Filter::Leaf(l) => Ok(Some(Cond::all().add(leaf(l)?))),
        Filter::Branch(branch) => {
            let mut condition = match branch.join {
                Join::And => Cond::all(),
                Join::Or => Cond::any(),
            };
            let mut applied = false;
            for child in &branch.children {
                if let Some(tree) = build_tree(child, leaf)? {
                    condition = condition.add(tree);
                    applied = true;
                }
            }
            Ok(applied.then_some(condition))
        }
    }
}

/// `owner.key [NOT] IN (SELECT key FROM association WHERE value ...)`
fn semi_join(
    owner: &EntityDescriptor,
    leaf: &LeafFilter,
    descriptor: &ColumnDescriptor,
    table: &str,
    key: &str,
    value: &str,
) -> SimpleExpr {
    let mut members = Query::select();
    members
        .column((TableName::new(table), ColumnName::new(key)))
        .from(TableName::new(table));
    let exclude = if leaf.value.is_null() {
        // `is unknown`: no association rows at all.
        !leaf.operator.is_negative()
    } else {
        let positive = LeafFilter {
            operator: leaf.operator.positive(),
            ..leaf.clone()
        };
        members.and_where(column_predicate(column(table, value).into(), descriptor, &positive));
        leaf.operator.is_negative()
    };

    let owner_key = column(&owner.table, &owner.key);
    if exclude {
        owner_key.not_in_subquery(members)
    } else {
        owner_key.in_subquery(members)
    }
}

/// A predicate on a single value expression.
fn column_predicate(target: SimpleExpr, descriptor: &ColumnDescriptor, leaf: &LeafFilter) -> SimpleExpr {
    match &leaf.value {
        Value::Null if leaf.operator == Operator::Is => Expr::expr(target).is_null(),
        Value::Null if leaf.operator == Operator::IsNot => Expr::expr(target).is_not_null(),
        Value::String(text)
            if descriptor.is_numeric() && matches!(leaf.operator, Operator::Is | Operator::IsNot) =>
        {
            match numeric_range(text).and_then(|(low, high)| range_predicate(&target, low, high)) {
                Some(range) if leaf.operator == Operator::IsNot => range.not(),
                Some(range) => range,
                None => compare(target, leaf.operator, &leaf.value),
            }
        }
        Value::String(text) if descriptor.related_entity_type.is_some() => {
            compare(target, leaf.operator, &Value::String(short_id(text).to_string()))
        }
        value => compare(target, leaf.operator, value),
    }
}

fn range_predicate(target: &SimpleExpr, low: Option<&str>, high: Option<&str>) -> Option<SimpleExpr> {
    let bound = |text: &str| parse_number(text).map(|n| sql_value(&n));
    let low = match low {
        Some(text) => Some(Expr::expr(target.clone()).gte(bound(text)?)),
        None => None,
    };
    let high = match high {
        Some(text) => Some(Expr::expr(target.clone()).lte(bound(text)?)),
        None => None,
    };
    match (low, high) {
        (Some(low), Some(high)) => Some(low.and(high)),
        (low, high) => low.or(high),
    }
}

fn compare(target: SimpleExpr, operator: Operator, value: &Value) -> SimpleExpr {
    match operator {
        Operator::Contains => Expr::expr(Func::lower(target)).like(like_pattern(value)),
        Operator::NotContains => Expr::expr(Func::lower(target)).not_like(like_pattern(value)),
        _ => {
            let target = Expr::expr(target);
            let value = sql_value(value);
            match operator {
                Operator::IsNot => target.ne(value),
                Operator::Gt => target.gt(value),
                Operator::Gte => target.gte(value),
                Operator::Lt => target.lt(value),
                Operator::Lte => target.lte(value),
                _ => target.eq(value),
            }
        }
    }
}

/// `%text%`, lowercased, with LIKE wildcards escaped.
fn like_pattern(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string(),
    };
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::String(None),
        Value::Bool(b) => SqlValue::Bool(Some(*b)),
        Value::Int(i) => SqlValue::BigInt(Some(*i)),
        Value::Float(f) => SqlValue::Double(Some(*f)),
        Value::String(s) => SqlValue::String(Some(Box::new(s.clone()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oqo::Filter;

    fn create_test_compiler() -> SqlCompiler {
        SqlCompiler::new(Arc::new(Registry::builtin().unwrap()))
    }

    fn compile(compiler: &SqlCompiler, oqo: Oqo) -> CompiledQuery {
        compiler.compile_oqo(&oqo).unwrap()
    }

    #[test]
    fn test_fact_query_without_filters() {
        let compiler = create_test_compiler();
        let compiled = compile(&compiler, Oqo::new("works"));
        let sql = &compiled.rows.sql;

        assert!(sql.starts_with(r#"SELECT *, COUNT(*) OVER () AS "total_count" FROM (SELECT"#));
        assert!(sql.contains(r#"FROM "works""#));
        assert!(sql.contains(r#"ORDER BY "q"."cited_by_count" DESC NULLS LAST LIMIT 100"#));
        assert!(!sql.contains("DISTINCT"));
        assert!(!sql.contains("GROUP BY"));
        assert!(compiled.works_count.is_none());
        assert_eq!(compiled.rows.timeout, Duration::from_secs(30));
        assert!(compiled.plan.joins.iter().all(|j| j.kind == JoinKind::Display));
    }

    #[test]
    fn test_compound_where_clause() {
        let compiler = create_test_compiler();
        let oqo = Oqo::new("works").with_filters(vec![
            Filter::is("open_access.is_oa", true),
            Filter::leaf("publication_year", Operator::Gte, 2020i64),
        ]);
        let sql = compile(&compiler, oqo).rows.sql;
        assert!(sql.contains(r#""works"."is_oa" = TRUE"#), "{}", sql);
        assert!(sql.contains(r#""works"."publication_year" >= 2020"#), "{}", sql);
    }

    #[test]
    fn test_numeric_range_strings() {
        let compiler = create_test_compiler();
        let oqo = Oqo::new("works").with_filters(vec![
            Filter::is("publication_year", "2020-2022"),
            Filter::leaf("cited_by_count", Operator::IsNot, "-10"),
        ]);
        let sql = compile(&compiler, oqo).rows.sql;
        assert!(sql.contains(r#""works"."publication_year" >= 2020 AND "works"."publication_year" <= 2022"#), "{}", sql);
        assert!(sql.contains("NOT"), "{}", sql);
        assert!(sql.contains(r#""works"."cited_by_count" <= 10"#), "{}", sql);
    }

    #[test]
    fn test_contains_is_case_insensitive() {
        let compiler = create_test_compiler();
        let oqo = Oqo::new("works")
            .with_filters(vec![Filter::leaf("title.search", Operator::Contains, "Deep 100%")]);
        let sql = compile(&compiler, oqo).rows.sql;
        assert!(sql.contains(r#"LOWER("works"."#), "{}", sql);
        assert!(sql.contains(r"LIKE '%deep 100\\%%'") || sql.contains(r"LIKE E'%deep 100\\%%'"), "{}", sql);
    }

    #[test]
    fn test_association_filters_are_semi_joins() {
        let compiler = create_test_compiler();
        let oqo = Oqo::new("works").with_filters(vec![
            Filter::is("authorships.institutions.id", "institutions/I1"),
            Filter::leaf("authorships.countries", Operator::IsNot, "countries/ca"),
            Filter::is("topics.id", Value::Null),
        ]);
        let compiled = compile(&compiler, oqo);
        let sql = &compiled.rows.sql;
        assert!(sql.contains(
            r#""works"."work_id" IN (SELECT "work_institution_distinct"."work_id" FROM "work_institution_distinct" WHERE "work_institution_distinct"."institution_id" = 'I1')"#
        ), "{}", sql);
        assert!(sql.contains(r#""works"."work_id" NOT IN (SELECT "work_country_distinct"."work_id""#), "{}", sql);
        assert!(sql.contains(r#""work_country_distinct"."country_id" = 'ca'"#), "{}", sql);
        assert!(sql.contains(r#""works"."work_id" NOT IN (SELECT "work_topic_distinct"."work_id" FROM "work_topic_distinct")"#), "{}", sql);
        assert!(!compiled.plan.joins.iter().any(|j| j.kind == JoinKind::CoRelationship));
    }

    #[test]
    fn test_entity_query_groups_and_joins_path() {
        let compiler = create_test_compiler();
        let compiled = compile(&compiler, Oqo::new("authors"));
        let sql = &compiled.rows.sql;

        assert!(sql.contains(r#"FROM "authors" INNER JOIN "work_author_distinct" ON "authors"."author_id" = "work_author_distinct"."author_id" INNER JOIN "works" ON "work_author_distinct"."work_id" = "works"."work_id""#), "{}", sql);
        assert!(sql.contains(r#"COUNT(DISTINCT "works"."work_id") AS "count(works)""#), "{}", sql);
        assert!(sql.contains(r#"JSONB_AGG"#));
        assert!(sql.contains(r#""authors"."display_name" AS "id__display""#), "{}", sql);
        assert_eq!(compiled.plan.group_by[0], "authors.author_id");
        assert!(compiled.plan.group_by.contains(&"authors.display_name".to_string()));
        assert!(!compiled.plan.distinct);
        assert!(sql.contains(r#"ORDER BY "q"."count(works)" DESC NULLS LAST"#));

        let works_count = compiled.works_count.unwrap().sql;
        assert!(works_count.starts_with(r#"SELECT COUNT(DISTINCT "works"."work_id") AS "works_count" FROM "authors""#), "{}", works_count);
    }

    #[test]
    fn test_entity_without_aggregates_is_distinct() {
        let compiler = create_test_compiler();
        let request = CompileRequest::new("authors")
            .with_columns(vec!["id".to_string(), "display_name".to_string()]);
        let compiled = compiler.compile(&request).unwrap();
        assert!(compiled.plan.distinct);
        assert!(compiled.plan.group_by.is_empty());
        assert!(compiled.rows.sql.contains("SELECT DISTINCT"));
    }

    #[test]
    fn test_aggregate_filters_become_having() {
        let compiler = create_test_compiler();
        let oqo = Oqo::new("authors").with_filters(vec![
            Filter::leaf("count(works)", Operator::Gt, 10i64),
            Filter::leaf("publication_year", Operator::Gte, 2020i64),
        ]);
        let compiled = compile(&compiler, oqo);
        let sql = &compiled.rows.sql;
        assert_eq!(compiled.plan.having, vec!["count(works)"]);
        let having = &sql[sql.find("HAVING").unwrap()..];
        assert!(having.contains(r#"COUNT(DISTINCT "works"."work_id") > 10"#), "{}", sql);
        let where_clause = &sql[sql.find(r#"WHERE "works""#).unwrap()..sql.find("GROUP BY").unwrap()];
        assert!(where_clause.contains(r#""works"."publication_year" >= 2020"#), "{}", sql);

        let works_count = compiled.works_count.unwrap().sql;
        assert!(works_count.contains(r#""authors"."author_id" IN (SELECT "authors"."author_id""#), "{}", works_count);
    }

    #[test]
    fn test_aggregate_or_stays_a_disjunction() {
        let compiler = create_test_compiler();
        let oqo = Oqo::new("authors").with_filters(vec![Filter::or(vec![
            Filter::leaf("count(works)", Operator::Gt, 10i64),
            Filter::leaf("mean(fwci)", Operator::Gte, 1.5),
        ])]);
        let compiled = compile(&compiler, oqo);
        let sql = &compiled.rows.sql;
        assert_eq!(compiled.plan.having, vec!["count(works)", "mean(fwci)"]);
        let having = &sql[sql.find("HAVING").unwrap()..];
        assert!(having.contains(r#"COUNT(DISTINCT "works"."work_id") > 10"#), "{}", sql);
        assert!(having.contains(r#"AVG("works"."fwci") >= 1.5"#), "{}", sql);
        assert!(having.contains(" OR "), "{}", sql);
        assert!(!having.contains(" AND "), "{}", sql);
    }

    #[test]
    fn test_mixed_or_compiles_whole_into_having() {
        let compiler = create_test_compiler();
        let oqo = Oqo::new("authors").with_filters(vec![Filter::or(vec![
            Filter::leaf("count(works)", Operator::Gt, 10i64),
            Filter::leaf("publication_year", Operator::Gte, 2020i64),
        ])]);
        let compiled = compile(&compiler, oqo);
        let sql = &compiled.rows.sql;
        let having = &sql[sql.find("HAVING").unwrap()..];
        assert!(having.contains(r#"COUNT(DISTINCT "works"."work_id") > 10"#), "{}", sql);
        assert!(having.contains(r#"BOOL_OR("#), "{}", sql);
        assert!(having.contains(r#""works"."publication_year" >= 2020"#), "{}", sql);
        assert!(having.contains(" OR ") && !having.contains(" AND "), "{}", sql);
        // The year alternative must not narrow the rows before grouping.
        assert_eq!(sql.matches("publication_year").count(), 1, "{}", sql);

        let works_count = compiled.works_count.unwrap().sql;
        assert!(works_count.contains("BOOL_OR"), "{}", works_count);
    }

    #[test]
    fn test_shadowed_column_in_mixed_or_uses_entity_table() {
        let compiler = create_test_compiler();
        let oqo = Oqo::new("authors").with_filters(vec![Filter::or(vec![
            Filter::leaf("display_name", Operator::Contains, "curie"),
            Filter::leaf("publication_year", Operator::Gte, 1900i64),
        ])]);
        let request = CompileRequest::from_oqo(&oqo, compiler.registry());
        assert_eq!(request.entity_filters.len(), 1);

        let sql = compiler.compile(&request).unwrap().rows.sql;
        assert!(sql.contains(r#"LOWER("authors"."display_name") LIKE '%curie%'"#), "{}", sql);
        assert!(sql.contains(r#""works"."publication_year" >= 1900"#), "{}", sql);
        assert!(!sql.contains(r#"LOWER("works"."display_name")"#), "{}", sql);
    }

    #[test]
    fn test_co_relationship_uses_aliased_left_join() {
        let compiler = create_test_compiler();
        let oqo = Oqo::new("authors")
            .with_filters(vec![Filter::is("authorships.author.id", "authors/A5023888391")]);
        let compiled = compile(&compiler, oqo);
        let sql = &compiled.rows.sql;

        assert!(sql.contains(r#"LEFT JOIN "work_author_distinct" AS "co_work_author_distinct_1" ON "#), "{}", sql);
        assert!(sql.contains(r#""co_work_author_distinct_1"."work_id" = "works"."work_id""#), "{}", sql);
        assert!(sql.contains(r#""co_work_author_distinct_1"."author_id" = 'A5023888391'"#), "{}", sql);
        assert!(sql.contains(r#""co_work_author_distinct_1"."work_id" IS NOT NULL"#), "{}", sql);
        // The primary join path stays unrestricted.
        assert!(sql.contains(r#"INNER JOIN "work_author_distinct" ON "authors"."author_id" = "work_author_distinct"."author_id""#));
        let co: Vec<_> = compiled
            .plan
            .joins
            .iter()
            .filter(|j| j.kind == JoinKind::CoRelationship)
            .collect();
        assert_eq!(co.len(), 1);
        assert_eq!(co[0].alias.as_deref(), Some("co_work_author_distinct_1"));
    }

    #[test]
    fn test_excluded_co_relationship_stays_semi_join() {
        let compiler = create_test_compiler();
        let oqo = Oqo::new("institutions")
            .with_filters(vec![Filter::is("authorships.institutions.id", "institutions/I1")]);
        let compiled = compile(&compiler, oqo);
        assert!(!compiled.plan.joins.iter().any(|j| j.kind == JoinKind::CoRelationship));
        assert!(compiled.rows.sql.contains(r#""works"."work_id" IN (SELECT"#));
    }

    #[test]
    fn test_entity_filters_use_entity_table() {
        let compiler = create_test_compiler();
        let oqo = Oqo::new("authors").with_filters(vec![
            Filter::leaf("summary_stats.h_index", Operator::Gt, 20i64),
            Filter::is("has_orcid", true),
        ]);
        let request = CompileRequest::from_oqo(&oqo, compiler.registry());
        assert_eq!(request.entity_filters.len(), 2);
        assert!(request.work_filters.is_empty());

        let sql = compiler.compile(&request).unwrap().rows.sql;
        assert!(sql.contains(r#""authors"."h_index" > 20"#), "{}", sql);
    }

    #[test]
    fn test_underlying_works_for_fanning_out_entity() {
        let compiler = create_test_compiler();
        let request = CompileRequest::new("authors").underlying_works();
        let compiled = compiler.compile(&request).unwrap();
        let sql = &compiled.rows.sql;
        assert!(sql.contains(r#"COUNT(DISTINCT "authors"."author_id") AS "authors_count""#), "{}", sql);
        assert_eq!(compiled.plan.group_by[0], "works.work_id");
        assert!(compiled
            .plan
            .projections
            .iter()
            .any(|p| p.kind == ProjectionKind::EntityCount));

        let request = CompileRequest::new("sources").underlying_works();
        let compiled = compiler.compile(&request).unwrap();
        assert!(compiled.plan.distinct);
    }

    #[test]
    fn test_sample_wraps_random_order() {
        let compiler = create_test_compiler();
        let sql = compile(&compiler, Oqo::new("works").with_sample(25)).rows.sql;
        assert!(sql.contains(r#"ORDER BY RANDOM() ASC LIMIT 25) AS "sampled""#), "{}", sql);
    }

    #[test]
    fn test_unknown_column_is_precondition_error() {
        let compiler = create_test_compiler();
        let oqo = Oqo::new("works").with_filters(vec![Filter::is("made.up", "x")]);
        assert!(matches!(compiler.compile_oqo(&oqo), Err(CompileError::Precondition(_))));

        let request = CompileRequest::new("authors").with_columns(vec!["publication_year".to_string()]);
        assert!(matches!(compiler.compile(&request), Err(CompileError::Precondition(_))));

        assert!(compiler.compile(&CompileRequest::new("gadgets")).is_err());
    }

    #[test]
    fn test_custom_config_limit() {
        let config = CompilerConfig {
            max_rows: 10,
            ..CompilerConfig::default()
        };
        let compiler = SqlCompiler::with_config(Arc::new(Registry::builtin().unwrap()), config);
        let compiled = compiler.compile_oqo(&Oqo::new("works")).unwrap();
        assert!(compiled.rows.sql.ends_with("LIMIT 10"));
        assert_eq!(compiled.plan.limit, 10);
    }
}
