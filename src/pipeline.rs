//! Translation pipeline: any input format to every output format.
//!
//! ```text
//! Url | Oql | Oqo --parse--> Oqo --canonicalize--> Oqo --validate--> Oqo
//!                                                                    |
//!                           OQL text + render tree  <----render------+
//!                           URL (or a warning)      <----render------+
//! ```

use crate::canonical::canonicalize;
use crate::error::{ParseError, RenderError, TranslateError, ValidationIssue};
use crate::oqo::Oqo;
use crate::parser::parse_oql;
use crate::registry::Registry;
use crate::render::{render, DisplayNameResolver};
use crate::render_tree::RenderTree;
use crate::url_filter::{parse_url, render_url, UrlQuery};
use crate::validate::validate;
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum QueryInput {
    Url { entity: String, query: UrlQuery },
    Oql(String),
    /// An OQO in its JSON form.
    OqoJson(String),
    Oqo(Oqo),
}

/// Something worth reporting that did not stop the translation.
#[derive(Debug, Clone, PartialEq)]
pub enum TranslationWarning {
    Validation(ValidationIssue),
    /// The query has no URL form; OQL and OQO are still available.
    UrlUnavailable(RenderError),
}

impl fmt::Display for TranslationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranslationWarning::Validation(issue) => write!(f, "{}", issue),
            TranslationWarning::UrlUnavailable(err) => write!(f, "no URL form: {}", err),
        }
    }
}

impl Serialize for TranslationWarning {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Translation {
    /// Canonical form.
    pub oqo: Oqo,
    pub oql: String,
    pub render_tree: RenderTree,
    pub url: Option<UrlQuery>,
    pub warnings: Vec<TranslationWarning>,
}

pub fn parse_input(input: &QueryInput, registry: &Registry) -> Result<Oqo, ParseError> {
    match input {
        QueryInput::Url { entity, query } => parse_url(entity, query, registry),
        QueryInput::Oql(text) => parse_oql(text, registry),
        QueryInput::OqoJson(json) => Oqo::from_json(json),
        QueryInput::Oqo(oqo) => Ok(oqo.clone()),
    }
}

pub fn translate(
    input: &QueryInput,
    registry: &Registry,
    resolver: &dyn DisplayNameResolver,
) -> Result<Translation, TranslateError> {
    let parsed = parse_input(input, registry).map_err(|e| {
        debug!(error = %e, "input rejected by parser");
        e
    })?;
    let oqo = canonicalize(&parsed, registry);
    let mut warnings: Vec<TranslationWarning> = validate(&oqo, registry)
        .into_result()?
        .into_iter()
        .map(TranslationWarning::Validation)
        .collect();

    let rendering = render(&oqo, registry, resolver);
    let url = match render_url(&oqo, registry) {
        Ok(url) => Some(url),
        Err(e) => {
            warn!(entity = %oqo.entity, error = %e, "query has no URL form");
            warnings.push(TranslationWarning::UrlUnavailable(e));
            None
        }
    };

    debug!(entity = %oqo.entity, oql = %rendering.text, "translated query");
    Ok(Translation {
        oqo,
        oql: rendering.text,
        render_tree: rendering.tree,
        url,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::NoDisplayNames;

    fn registry() -> Registry {
        Registry::builtin().unwrap()
    }

    #[test]
    fn test_url_to_everything() {
        let input = QueryInput::Url {
            entity: "works".to_string(),
            query: UrlQuery::filter("publication_year:2020-,open_access.is_oa:true")
                .with_sort("cited_by_count:desc"),
        };
        let translation = translate(&input, &registry(), &NoDisplayNames).unwrap();
        assert_eq!(
            translation.oql,
            "Works where year >= 2020 and it's Open Access; sort by citations desc"
        );
        assert_eq!(
            translation.url.unwrap().filter.as_deref(),
            Some("publication_year:2020-,open_access.is_oa:true")
        );
        assert!(translation.warnings.is_empty());
    }

    #[test]
    fn test_url_failure_is_a_warning() {
        let input = QueryInput::Oql("Works where year > 2020 or it's Open Access".to_string());
        let translation = translate(&input, &registry(), &NoDisplayNames).unwrap();
        assert!(translation.url.is_none());
        assert!(matches!(
            translation.warnings[0],
            TranslationWarning::UrlUnavailable(RenderError::CrossFieldOr { .. })
        ));
    }

    #[test]
    fn test_parse_and_validation_errors() {
        let err = translate(&QueryInput::Oql("Gadgets".to_string()), &registry(), &NoDisplayNames)
            .unwrap_err();
        assert!(matches!(err, TranslateError::Parse(ParseError::UnknownEntity { .. })));

        let json = r#"{"get_rows": "works", "sample": 0}"#;
        let err = translate(&QueryInput::OqoJson(json.to_string()), &registry(), &NoDisplayNames)
            .unwrap_err();
        assert!(matches!(err, TranslateError::Validation(_)));
    }

    #[test]
    fn test_unknown_column_warning_keeps_result() {
        let oqo = Oqo::new("works").with_filters(vec![crate::oqo::Filter::is("made.up", "x")]);
        let translation = translate(&QueryInput::Oqo(oqo), &registry(), &NoDisplayNames).unwrap();
        assert!(matches!(translation.warnings[0], TranslationWarning::Validation(_)));
        assert!(translation.oql.starts_with("Works where made.up is"));
    }
}
