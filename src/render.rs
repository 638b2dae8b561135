//! OQL renderer. Builds the render tree and derives the text from it, so
//! the two cannot disagree.

use crate::canonical::{id_type, short_id};
use crate::config::BooleanIdiom;
use crate::lexer::quote;
use crate::oqo::{Filter, Join, LeafFilter, Operator, Oqo, Value};
use crate::registry::{ColumnDescriptor, Registry};
use crate::render_tree::{
    stringify, ClauseMeta, Directive, EntityHead, ExprNode, GroupMeta, RenderTree, Segment,
    SegmentKind, SegmentMeta, RENDER_TREE_VERSION,
};
use std::collections::HashMap;

/// Looks up the display name of an entity by its full `type/short_id`.
pub trait DisplayNameResolver {
    fn resolve(&self, entity_id: &str) -> Option<String>;
}

impl<F> DisplayNameResolver for F
where
    F: Fn(&str) -> Option<String>,
{
    fn resolve(&self, entity_id: &str) -> Option<String> {
        self(entity_id)
    }
}

/// Resolves nothing; entity values render as `[short_id]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDisplayNames;

impl DisplayNameResolver for NoDisplayNames {
    fn resolve(&self, _entity_id: &str) -> Option<String> {
        None
    }
}

/// OQL text and the tree it was flattened from.
#[derive(Debug, Clone, PartialEq)]
pub struct OqlRendering {
    pub text: String,
    pub tree: RenderTree,
}

pub fn render(oqo: &Oqo, registry: &Registry, resolver: &dyn DisplayNameResolver) -> OqlRendering {
    let tree = OqlRenderer::new(&oqo.entity, registry, resolver).render_tree(oqo);
    OqlRendering {
        text: stringify(&tree),
        tree,
    }
}

pub fn render_oql(oqo: &Oqo, registry: &Registry, resolver: &dyn DisplayNameResolver) -> String {
    render(oqo, registry, resolver).text
}

pub fn build_render_tree(
    oqo: &Oqo,
    registry: &Registry,
    resolver: &dyn DisplayNameResolver,
) -> RenderTree {
    render(oqo, registry, resolver).tree
}

struct OqlRenderer<'a> {
    entity: &'a str,
    registry: &'a Registry,
    resolver: &'a dyn DisplayNameResolver,
    /// Per-call memo of resolved display names.
    names: HashMap<String, Option<String>>,
}

impl<'a> OqlRenderer<'a> {
    fn new(entity: &'a str, registry: &'a Registry, resolver: &'a dyn DisplayNameResolver) -> Self {
        Self {
            entity,
            registry,
            resolver,
            names: HashMap::new(),
        }
    }

    fn render_tree(&mut self, oqo: &Oqo) -> RenderTree {
        let entity_head = EntityHead {
            id: oqo.entity.clone(),
            display_text: self
                .registry
                .entity(&oqo.entity)
                .map_or_else(|| oqo.entity.clone(), |e| e.display_name.clone()),
        };

        let where_clause = match oqo.filters.as_slice() {
            [] => None,
            [single] => Some(self.render_filter(single, 1)),
            many => Some(ExprNode::Group {
                join: Join::And,
                children: many.iter().map(|f| self.render_filter(f, 1)).collect(),
                prefix: String::new(),
                suffix: String::new(),
                joiner: " and ".to_string(),
                meta: GroupMeta {
                    depth: 0,
                    implicit: true,
                },
            }),
        };

        let mut directives = Vec::new();
        if let Some(column_id) = &oqo.sort_column {
            let mut text = format!(
                "; sort by {}",
                self.registry.column_display_name(self.entity, column_id)
            );
            if let Some(order) = oqo.sort_order {
                text.push(' ');
                text.push_str(order.as_str());
            }
            directives.push(Directive::Sort {
                text,
                column_id: column_id.clone(),
                order: oqo.sort_order,
            });
        }
        if let Some(size) = oqo.sample {
            directives.push(Directive::Sample {
                text: format!("; sample {}", size),
                size,
            });
        }

        RenderTree {
            version: RENDER_TREE_VERSION,
            entity_head,
            where_keyword: if where_clause.is_some() {
                " where ".to_string()
            } else {
                String::new()
            },
            where_clause,
            directives,
        }
    }

    fn render_filter(&mut self, filter: &Filter, depth: usize) -> ExprNode {
        match filter {
            Filter::Leaf(leaf) => self.render_leaf(leaf),
            Filter::Branch(branch) => ExprNode::Group {
                join: branch.join,
                children: branch
                    .children
                    .iter()
                    .map(|child| self.render_filter(child, depth + 1))
                    .collect(),
                prefix: "(".to_string(),
                suffix: ")".to_string(),
                joiner: format!(" {} ", branch.join.as_str()),
                meta: GroupMeta {
                    depth,
                    implicit: false,
                },
            },
        }
    }

    fn render_leaf(&mut self, leaf: &LeafFilter) -> ExprNode {
        let column = self
            .registry
            .resolve_column(self.entity, &leaf.column_id)
            .map(|r| r.descriptor);

        if let Some(node) = self.render_boolean_idiom(leaf, column) {
            return node;
        }

        let column_meta = SegmentMeta {
            column_id: Some(leaf.column_id.clone()),
            ..SegmentMeta::default()
        };
        let operator_text = leaf
            .operator
            .symbol()
            .unwrap_or_else(|| leaf.operator.as_words());

        let segments = vec![
            Segment::new(
                SegmentKind::Column,
                self.registry.column_display_name(self.entity, &leaf.column_id),
            )
            .with_meta(column_meta),
            Segment::space(),
            Segment::new(SegmentKind::Operator, operator_text).with_meta(SegmentMeta {
                operator: Some(leaf.operator),
                ..SegmentMeta::default()
            }),
            Segment::space(),
            self.render_value(&leaf.value, column),
        ];

        ExprNode::Clause {
            segments,
            meta: ClauseMeta {
                column_id: leaf.column_id.clone(),
                operator: leaf.operator,
                boolean_idiom: false,
            },
        }
    }

    /// `it's Open Access`, `it doesn't have a DOI`, ...
    fn render_boolean_idiom(
        &self,
        leaf: &LeafFilter,
        column: Option<&ColumnDescriptor>,
    ) -> Option<ExprNode> {
        let column = column.filter(|c| c.is_boolean())?;
        let Value::Bool(value) = leaf.value else {
            return None;
        };
        let truth = match leaf.operator {
            Operator::Is => value,
            Operator::IsNot => !value,
            _ => return None,
        };
        let display = self
            .registry
            .boolean_display_name(self.entity, &column.column_id)?;

        let idiom = match (display.idiom, truth) {
            (BooleanIdiom::Is, true) => "it's",
            (BooleanIdiom::Is, false) => "it's not",
            (BooleanIdiom::Has, true) => "it has",
            (BooleanIdiom::Has, false) => "it doesn't have",
        };

        Some(ExprNode::Clause {
            segments: vec![
                Segment::new(SegmentKind::BooleanIdiom, idiom).with_meta(SegmentMeta {
                    operator: Some(leaf.operator),
                    ..SegmentMeta::default()
                }),
                Segment::space(),
                Segment::new(SegmentKind::Column, display.name).with_meta(SegmentMeta {
                    column_id: Some(leaf.column_id.clone()),
                    ..SegmentMeta::default()
                }),
            ],
            meta: ClauseMeta {
                column_id: leaf.column_id.clone(),
                operator: leaf.operator,
                boolean_idiom: true,
            },
        })
    }

    fn render_value(&mut self, value: &Value, column: Option<&ColumnDescriptor>) -> Segment {
        match value {
            Value::Null => Segment::new(SegmentKind::Value, "unknown"),
            Value::String(s) => match column.and_then(|c| c.related_entity_type.as_deref()) {
                Some(related) => self.render_entity(s, related),
                None => Segment::new(SegmentKind::Value, quote(s)),
            },
            other => Segment::new(SegmentKind::Value, other.to_string()),
        }
    }

    /// `Name [short_id]`, or `[short_id]` without a usable name. The full id
    /// goes in the brackets when its type differs from the column's.
    fn render_entity(&mut self, id: &str, related: &str) -> Segment {
        let short = if id_type(id) == Some(related) {
            short_id(id)
        } else {
            id
        };
        let name = self.display_name(id);
        let text = match &name {
            Some(name) => format!("{} [{}]", name, short),
            None => format!("[{}]", short),
        };
        Segment::new(SegmentKind::Entity, text).with_meta(SegmentMeta {
            entity_id: Some(id.to_string()),
            short_id: Some(short_id(id).to_string()),
            display_name: name,
            ..SegmentMeta::default()
        })
    }

    fn display_name(&mut self, id: &str) -> Option<String> {
        if let Some(cached) = self.names.get(id) {
            return cached.clone();
        }
        let name = self
            .resolver
            .resolve(id)
            .map(|n| sanitize_display_name(&n))
            .filter(|n| !n.is_empty());
        self.names.insert(id.to_string(), name.clone());
        name
    }
}

/// Rewrites characters that OQL reads as syntax: brackets become
/// parentheses, `;` a comma, `"` an apostrophe. Unmatched `)` are dropped.
pub fn sanitize_display_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut depth = 0usize;
    for c in name.trim().chars() {
        match c {
            '(' | '[' => {
                depth += 1;
                out.push('(');
            }
            ')' | ']' => {
                if depth > 0 {
                    depth -= 1;
                    out.push(')');
                }
            }
            ';' => out.push(','),
            '"' => out.push('\''),
            other => out.push(other),
        }
    }
    out.trim().to_string()
}
