//! Result formatter: turns raw backend rows into typed cells. Never fails;
//! anything it does not recognize passes through as raw JSON.

use crate::executor::Row;
use crate::sql_compiler::{Projection, ProjectionKind, DISPLAY_SUFFIX, TOTAL_COUNT_ALIAS};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value as Json;

/// A reference to another entity, as shown in a result cell.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct EntityRef {
    pub id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    Entity(EntityRef),
    List(Vec<EntityRef>),
    Raw(Json),
}

/// One formatted row; cells keep the projection order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormattedRow {
    cells: Vec<(String, CellValue)>,
}

impl FormattedRow {
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn contains_key(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.cells.iter().map(|(c, v)| (c.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl Serialize for FormattedRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (column, value) in &self.cells {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

pub fn format_rows(rows: &[Row], projections: &[Projection]) -> Vec<FormattedRow> {
    rows.iter().map(|row| format_row(row, projections)).collect()
}

fn format_row(row: &Row, projections: &[Projection]) -> FormattedRow {
    let mut cells = Vec::with_capacity(projections.len());
    for projection in projections {
        let raw = row.get(&projection.alias).unwrap_or(&Json::Null);
        let cell = match &projection.kind {
            ProjectionKind::Entity { entity_type } => {
                let display = row
                    .get(&format!("{}{}", projection.alias, DISPLAY_SUFFIX))
                    .and_then(Json::as_str);
                entity_cell(raw, entity_type, display)
            }
            ProjectionKind::List { entity_type } => list_cell(raw, entity_type.as_deref()),
            _ => scalar_cell(raw),
        };
        cells.push((projection.alias.clone(), cell));
    }

    for (column, value) in row {
        let known = column == TOTAL_COUNT_ALIAS
            || column.ends_with(DISPLAY_SUFFIX)
            || projections.iter().any(|p| &p.alias == column);
        if !known {
            cells.push((column.clone(), CellValue::Raw(value.clone())));
        }
    }
    FormattedRow { cells }
}

fn scalar_cell(raw: &Json) -> CellValue {
    match raw {
        Json::Null => CellValue::Null,
        Json::Bool(b) => CellValue::Bool(*b),
        Json::Number(n) => CellValue::Number(n.clone()),
        Json::String(s) => CellValue::Text(s.clone()),
        other => CellValue::Raw(other.clone()),
    }
}

fn qualified_id(short: &str, entity_type: Option<&str>) -> String {
    match entity_type {
        Some(t) if !short.contains('/') => format!("{}/{}", t, short),
        _ => short.to_string(),
    }
}

fn id_text(raw: &Json) -> Option<String> {
    match raw {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn entity_cell(raw: &Json, entity_type: &str, display: Option<&str>) -> CellValue {
    if raw.is_null() {
        return CellValue::Null;
    }
    match id_text(raw) {
        Some(short) => CellValue::Entity(EntityRef {
            id: qualified_id(&short, Some(entity_type)),
            display_name: display.map(str::to_string),
        }),
        None => CellValue::Raw(raw.clone()),
    }
}

/// Lists arrive as JSON arrays of `{id, display_name}`, or as JSON text from
/// drivers that do not decode `jsonb`.
fn list_cell(raw: &Json, entity_type: Option<&str>) -> CellValue {
    let decoded;
    let items = match raw {
        Json::Null => return CellValue::List(Vec::new()),
        Json::Array(items) => items,
        Json::String(text) => match serde_json::from_str::<Json>(text) {
            Ok(Json::Array(items)) => {
                decoded = items;
                &decoded
            }
            _ => return CellValue::Raw(raw.clone()),
        },
        other => return CellValue::Raw(other.clone()),
    };

    let mut refs = Vec::with_capacity(items.len());
    for item in items {
        let Some(id) = item.get("id").and_then(id_text) else {
            return CellValue::Raw(raw.clone());
        };
        refs.push(EntityRef {
            id: qualified_id(&id, entity_type),
            display_name: item
                .get("display_name")
                .and_then(Json::as_str)
                .map(str::to_string),
        });
    }
    CellValue::List(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AggregateFunction;
    use serde_json::json;

    fn projection(alias: &str, kind: ProjectionKind) -> Projection {
        Projection {
            alias: alias.to_string(),
            kind,
        }
    }

    fn row(value: Json) -> Row {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_entity_and_list_cells() {
        let projections = vec![
            projection(
                "id",
                ProjectionKind::Entity {
                    entity_type: "authors".to_string(),
                },
            ),
            projection(
                "last_known_institutions.id",
                ProjectionKind::List {
                    entity_type: Some("institutions".to_string()),
                },
            ),
            projection(
                "count(works)",
                ProjectionKind::Aggregate {
                    function: AggregateFunction::Count,
                },
            ),
        ];
        let rows = vec![row(json!({
            "id": "A1",
            "id__display": "Ada Lovelace",
            "last_known_institutions.id": [{"id": "I7", "display_name": "Cambridge"}],
            "count(works)": 3,
            "total_count": 1
        }))];

        let formatted = format_rows(&rows, &projections);
        let cells: Vec<_> = formatted[0].iter().map(|(c, _)| c).collect();
        assert_eq!(cells, vec!["id", "last_known_institutions.id", "count(works)"]);
        assert_eq!(
            serde_json::to_value(&formatted[0]).unwrap(),
            json!({
                "id": {"id": "authors/A1", "display_name": "Ada Lovelace"},
                "last_known_institutions.id": [{"id": "institutions/I7", "display_name": "Cambridge"}],
                "count(works)": 3
            })
        );
    }

    #[test]
    fn test_list_from_json_text_and_null() {
        let projections = vec![projection("topics.id", ProjectionKind::List { entity_type: None })];
        let rows = vec![
            row(json!({"topics.id": r#"[{"id": "topics/T1", "display_name": null}]"#})),
            row(json!({"topics.id": null})),
        ];
        let formatted = format_rows(&rows, &projections);
        assert_eq!(
            formatted[0].get("topics.id"),
            Some(&CellValue::List(vec![EntityRef {
                id: "topics/T1".to_string(),
                display_name: None,
            }]))
        );
        assert_eq!(formatted[1].get("topics.id"), Some(&CellValue::List(vec![])));
    }

    #[test]
    fn test_unexpected_values_pass_through_raw() {
        let projections = vec![
            projection("fwci", ProjectionKind::Value),
            projection("type", ProjectionKind::Entity { entity_type: "types".to_string() }),
        ];
        let rows = vec![row(json!({
            "fwci": {"weird": true},
            "type": [1, 2],
            "extra": "x"
        }))];
        let formatted = format_rows(&rows, &projections);
        assert_eq!(formatted[0].get("fwci"), Some(&CellValue::Raw(json!({"weird": true}))));
        assert_eq!(formatted[0].get("type"), Some(&CellValue::Raw(json!([1, 2]))));
        assert_eq!(formatted[0].get("extra"), Some(&CellValue::Raw(json!("x"))));
        assert_eq!(formatted[0].len(), 3);
    }
}
