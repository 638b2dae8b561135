//! The render tree: a UI-facing, segment-based form of an OQL statement.
//!
//! Concatenating every piece of text in tree order gives back the OQL
//! string exactly; [`stringify`] does that concatenation.

use crate::oqo::{Join, Operator, SortOrder};
use serde::Serialize;

pub const RENDER_TREE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderTree {
    pub version: u32,
    pub entity_head: EntityHead,
    /// `" where "`, or empty when there are no filters.
    pub where_keyword: String,
    #[serde(rename = "where")]
    pub where_clause: Option<ExprNode>,
    pub directives: Vec<Directive>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityHead {
    pub id: String,
    pub display_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExprNode {
    Clause {
        segments: Vec<Segment>,
        meta: ClauseMeta,
    },
    Group {
        join: Join,
        children: Vec<ExprNode>,
        prefix: String,
        suffix: String,
        joiner: String,
        meta: GroupMeta,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClauseMeta {
    pub column_id: String,
    pub operator: Operator,
    /// Rendered with the `it's` / `it has` idiom.
    pub boolean_idiom: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMeta {
    pub depth: usize,
    /// The implicit AND of the top-level filter list (no parentheses).
    pub implicit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub text: String,
    #[serde(skip_serializing_if = "SegmentMeta::is_empty")]
    pub meta: SegmentMeta,
}

impl Segment {
    pub fn new(kind: SegmentKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            meta: SegmentMeta::default(),
        }
    }

    pub fn space() -> Self {
        Self::new(SegmentKind::Whitespace, " ")
    }

    pub fn with_meta(mut self, meta: SegmentMeta) -> Self {
        self.meta = meta;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    BooleanIdiom,
    Column,
    Operator,
    Value,
    Entity,
    Whitespace,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SegmentMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<Operator>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl SegmentMeta {
    pub fn is_empty(&self) -> bool {
        *self == SegmentMeta::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Directive {
    Sort {
        text: String,
        column_id: String,
        order: Option<SortOrder>,
    },
    Sample {
        text: String,
        size: u32,
    },
}

impl Directive {
    pub fn text(&self) -> &str {
        match self {
            Directive::Sort { text, .. } | Directive::Sample { text, .. } => text,
        }
    }
}

/// Flattens the tree back into OQL text.
pub fn stringify(tree: &RenderTree) -> String {
    let mut out = String::new();
    out.push_str(&tree.entity_head.display_text);
    out.push_str(&tree.where_keyword);
    if let Some(node) = &tree.where_clause {
        stringify_node(node, &mut out);
    }
    for directive in &tree.directives {
        out.push_str(directive.text());
    }
    out
}

fn stringify_node(node: &ExprNode, out: &mut String) {
    match node {
        ExprNode::Clause { segments, .. } => {
            for segment in segments {
                out.push_str(&segment.text);
            }
        }
        ExprNode::Group {
            children,
            prefix,
            suffix,
            joiner,
            ..
        } => {
            out.push_str(prefix);
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    out.push_str(joiner);
                }
                stringify_node(child, out);
            }
            out.push_str(suffix);
        }
    }
}
