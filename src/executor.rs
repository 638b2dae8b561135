//! Execution façade: compiles a request and runs it on a relational backend.

use crate::error::{BackendError, ExecuteError};
use crate::format::{format_rows, FormattedRow};
use crate::sql_compiler::{
    CompileRequest, SqlCompiler, SqlStatement, TOTAL_COUNT_ALIAS, WORKS_COUNT_ALIAS,
};
use serde::Serialize;
use tracing::{debug, warn};

/// One result row, keyed by column alias.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Anything that can run a SQL statement and hand back rows. The backend
/// enforces `statement.timeout`.
pub trait RelationalBackend {
    fn fetch_rows(&self, statement: &SqlStatement) -> Result<Vec<Row>, BackendError>;
}

impl<B: RelationalBackend + ?Sized> RelationalBackend for &B {
    fn fetch_rows(&self, statement: &SqlStatement) -> Result<Vec<Row>, BackendError> {
        (**self).fetch_rows(statement)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResults {
    /// Matching rows before pagination.
    pub total_count: u64,
    /// Distinct fact rows behind the result, for non-fact entities.
    pub works_count: Option<u64>,
    pub rows: Vec<FormattedRow>,
}

pub struct Executor<B> {
    compiler: SqlCompiler,
    backend: B,
}

impl<B: RelationalBackend> Executor<B> {
    pub fn new(compiler: SqlCompiler, backend: B) -> Self {
        Self { compiler, backend }
    }

    pub fn compiler(&self) -> &SqlCompiler {
        &self.compiler
    }

    /// Runs the row statement and, for non-fact entities, the fact count.
    /// Failures are returned as they are; nothing is retried.
    pub fn execute(&self, request: &CompileRequest) -> Result<QueryResults, ExecuteError> {
        let compiled = self.compiler.compile(request)?;

        let mut raw = self.backend.fetch_rows(&compiled.rows).map_err(|e| {
            warn!(entity = %request.entity, error = %e, "row query failed");
            e
        })?;
        let total_count = raw
            .first()
            .and_then(|row| row.get(TOTAL_COUNT_ALIAS))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let max_rows = usize::try_from(self.compiler.config().max_rows).unwrap_or(usize::MAX);
        raw.truncate(max_rows);
        for row in &mut raw {
            row.remove(TOTAL_COUNT_ALIAS);
        }

        let works_count = match &compiled.works_count {
            Some(statement) => {
                let rows = self.backend.fetch_rows(statement)?;
                Some(
                    rows.first()
                        .and_then(|row| row.get(WORKS_COUNT_ALIAS))
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(0),
                )
            }
            None => None,
        };

        debug!(
            entity = %request.entity,
            total_count,
            returned = raw.len(),
            "query executed"
        );
        Ok(QueryResults {
            total_count,
            works_count,
            rows: format_rows(&raw, &compiled.plan.projections),
        })
    }
}
