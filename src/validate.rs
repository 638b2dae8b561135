//! Validator: checks a canonical OQO against the registry, collecting every
//! violation instead of stopping at the first.

use crate::error::{IssueKind, ValidationErrors, ValidationIssue};
use crate::oqo::{Filter, Oqo};
use crate::registry::Registry;
use serde::Serialize;

/// Largest accepted `sample` size.
pub const MAX_SAMPLE: u32 = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    /// Findings that never block execution, such as columns missing from
    /// the registry.
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// The warnings on success, every error otherwise.
    pub fn into_result(self) -> Result<Vec<ValidationIssue>, ValidationErrors> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(ValidationErrors {
                issues: self.errors,
            })
        }
    }

    fn error(&mut self, kind: IssueKind, path: impl Into<String>, message: String) {
        self.errors.push(ValidationIssue {
            kind,
            path: path.into(),
            message,
        });
    }

    fn warn(&mut self, kind: IssueKind, path: impl Into<String>, message: String) {
        self.warnings.push(ValidationIssue {
            kind,
            path: path.into(),
            message,
        });
    }
}

pub fn validate(oqo: &Oqo, registry: &Registry) -> ValidationReport {
    let mut report = ValidationReport::default();
    let entity_known = registry.entity(&oqo.entity).is_some();
    if !entity_known {
        report.error(
            IssueKind::UnknownEntity,
            "get_rows",
            format!("unknown entity `{}`", oqo.entity),
        );
    }

    for (i, filter) in oqo.filters.iter().enumerate() {
        check_filter(
            filter,
            &format!("filter_rows[{}]", i),
            oqo,
            entity_known,
            registry,
            &mut report,
        );
    }

    match (&oqo.sort_column, oqo.sort_order) {
        (Some(column), _) if entity_known && registry.column(&oqo.entity, column).is_none() => {
            report.error(
                IssueKind::InvalidSortColumn,
                "sort_by_column",
                format!("`{}` cannot be sorted on for `{}`", column, oqo.entity),
            );
        }
        (None, Some(order)) => report.error(
            IssueKind::InvalidSortOrder,
            "sort_by_order",
            format!("sort order `{}` given without a sort column", order.as_str()),
        ),
        _ => {}
    }

    if let Some(sample) = oqo.sample {
        if !(1..=MAX_SAMPLE).contains(&sample) {
            report.error(
                IssueKind::InvalidSample,
                "sample",
                format!("sample must be between 1 and {}, got {}", MAX_SAMPLE, sample),
            );
        }
    }

    report
}

fn check_filter(
    filter: &Filter,
    path: &str,
    oqo: &Oqo,
    entity_known: bool,
    registry: &Registry,
    report: &mut ValidationReport,
) {
    match filter {
        Filter::Branch(branch) => {
            if branch.children.is_empty() {
                report.error(
                    IssueKind::EmptyBranch,
                    path,
                    format!("`{}` group has no filters", branch.join.as_str()),
                );
            }
            for (i, child) in branch.children.iter().enumerate() {
                let child_path = format!("{}.filters[{}]", path, i);
                check_filter(child, &child_path, oqo, entity_known, registry, report);
            }
        }
        Filter::Leaf(leaf) if entity_known => {
            match registry.resolve_column(&oqo.entity, &leaf.column_id) {
                Some(resolved) => {
                    if !resolved.descriptor.allows(leaf.operator) {
                        report.error(
                            IssueKind::InvalidOperator,
                            path,
                            format!(
                                "operator `{}` is not allowed for column `{}`",
                                leaf.operator, leaf.column_id
                            ),
                        );
                    }
                }
                None => report.warn(
                    IssueKind::UnknownColumn,
                    path,
                    format!("column `{}` is not known for `{}`", leaf.column_id, oqo.entity),
                ),
            }
        }
        Filter::Leaf(_) => {}
    }
}
