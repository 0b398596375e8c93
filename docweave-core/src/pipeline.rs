//! Aggregation pipeline stages and parameterized pipeline templates.
//!
//! [`Stage`] is the backend-neutral form of an aggregation stage. Commands
//! build typed stages; [`Template`] produces raw stages from caller-written
//! pipeline text with `<tag>` placeholders.

use bson::{Bson, Document, ser::serialize_to_bson};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::{OdmError, OdmResult},
    filter::{Expr, Projection, Sort, validate_field_path},
};

/// One aggregation stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Keeps documents matching the expression.
    Match(Expr),
    /// Orders documents by the sort keys.
    Sort(Vec<Sort>),
    Skip(u64),
    Limit(u64),
    Project(Projection),
    /// Joins documents from `from` whose `foreign_field` equals this
    /// document's `local_field`, storing them as an array in `as_field`.
    Lookup {
        from: String,
        local_field: String,
        foreign_field: String,
        as_field: String,
    },
    /// Emits one document per element of the array at the path.
    Unwind(String),
    /// Replaces each document with the embedded document at the path.
    ReplaceRoot(String),
    /// Emits a single `{field: n}` document counting its input.
    Count(String),
    /// Runs named sub-pipelines over the same input, emitting one document
    /// with an array per name.
    Facet(Vec<(String, Vec<Stage>)>),
    /// A store-native stage document, passed through as-is.
    Raw(Document),
}

impl Stage {
    /// Checks paths and nested stages.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] on the first malformed stage.
    pub fn validate(&self) -> OdmResult<()> {
        match self {
            Stage::Match(expr) => expr.validate(),
            Stage::Sort(keys) => keys.iter().try_for_each(|key| match key {
                Sort::Field { field, .. } => validate_field_path(field),
                Sort::TextScore => Ok(()),
            }),
            Stage::Project(projection) => projection.validate(),
            Stage::Lookup { from, local_field, foreign_field, as_field } => {
                if from.is_empty() {
                    return Err(OdmError::validation("lookup needs a source collection"));
                }
                validate_field_path(local_field)?;
                validate_field_path(foreign_field)?;
                validate_field_path(as_field)
            }
            Stage::Unwind(path) | Stage::ReplaceRoot(path) | Stage::Count(path) => {
                validate_field_path(path)
            }
            Stage::Facet(facets) => {
                let mut seen = BTreeSet::new();
                for (name, stages) in facets {
                    validate_field_path(name)?;
                    if !seen.insert(name.as_str()) {
                        return Err(OdmError::validation(format!("duplicate facet '{name}'")));
                    }
                    stages.iter().try_for_each(Stage::validate)?;
                }
                Ok(())
            }
            Stage::Raw(document) => {
                if document.len() != 1 || !document.keys().all(|k| k.starts_with('$')) {
                    return Err(OdmError::validation(
                        "a raw stage must be a document with exactly one operator key",
                    ));
                }
                Ok(())
            }
            Stage::Skip(_) | Stage::Limit(_) => Ok(()),
        }
    }
}

/// A pipeline written as JSON text with `<tag>` placeholders.
///
/// Each placeholder is substituted before parsing:
///
/// - [`tag`](Template::tag) inserts a value encoded as JSON,
/// - [`raw_tag`](Template::raw_tag) inserts text verbatim,
/// - [`path`](Template::path) inserts a `"$field"` reference.
///
/// Every placeholder must be supplied and every supplied tag must appear in
/// the text.
///
/// ```ignore
/// let stages = Template::new(r#"[
///     { "$match": { "age": { "$gte": <min_age> } } },
///     { "$sort": { <sort_field>: 1 } }
/// ]"#)
/// .tag("min_age", 21)?
/// .raw_tag("sort_field", "\"name\"")
/// .render()?;
/// ```
#[derive(Debug, Clone)]
pub struct Template {
    text: String,
    values: BTreeMap<String, String>,
}

impl Template {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), values: BTreeMap::new() }
    }

    /// Substitutes `<name>` with the JSON encoding of `value`.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Serialization`] if `value` cannot be encoded.
    pub fn tag(mut self, name: impl Into<String>, value: impl Serialize) -> OdmResult<Self> {
        let encoded = serde_json::to_string(&value)?;
        self.values.insert(name.into(), encoded);
        Ok(self)
    }

    /// Substitutes `<name>` with `text` verbatim.
    pub fn raw_tag(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.values.insert(name.into(), text.into());
        self
    }

    /// Substitutes `<name>` with a quoted `"$field"` reference.
    pub fn path(mut self, name: impl Into<String>, field: &str) -> Self {
        self.values.insert(name.into(), format!("\"${field}\""));
        self
    }

    /// Names of the placeholders appearing in the text, in order of first use.
    pub fn placeholders(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (start, _) in self.text.match_indices('<') {
            let rest = &self.text[start + 1..];
            let Some(end) = rest.find('>') else { break };
            let name = &rest[..end];
            if is_tag_name(name) && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    /// Produces the substituted pipeline text.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] if a placeholder has no value or a
    /// value was supplied for a tag that does not appear.
    pub fn render_text(&self) -> OdmResult<String> {
        let placeholders = self.placeholders();
        if let Some(missing) = placeholders.iter().find(|name| !self.values.contains_key(*name)) {
            return Err(OdmError::validation(format!(
                "no value supplied for pipeline tag <{missing}>"
            )));
        }
        if let Some(unknown) = self.values.keys().find(|name| !placeholders.contains(name)) {
            return Err(OdmError::validation(format!(
                "pipeline has no tag named <{unknown}>"
            )));
        }
        // One pass over the original text; substituted values are never rescanned.
        let mut text = String::with_capacity(self.text.len());
        let mut rest = self.text.as_str();
        while let Some(start) = rest.find('<') {
            text.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            match after.find('>').map(|end| (&after[..end], end)) {
                Some((name, end)) if is_tag_name(name) => {
                    // Every tag name in the text was checked to have a value above.
                    text.push_str(self.values.get(name).map_or("", String::as_str));
                    rest = &after[end + 1..];
                }
                _ => {
                    text.push('<');
                    rest = after;
                }
            }
        }
        text.push_str(rest);
        Ok(text)
    }

    /// Produces the pipeline as raw stages.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] for tag problems or if the result is
    /// not an array of single-operator documents, and
    /// [`OdmError::Serialization`] if the text is not valid JSON.
    pub fn render(&self) -> OdmResult<Vec<Stage>> {
        let text = self.render_text()?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        let Bson::Array(items) = serialize_to_bson(&value)? else {
            return Err(OdmError::validation("a pipeline must be a JSON array of stages"));
        };
        items
            .into_iter()
            .map(|item| match item {
                Bson::Document(document) => {
                    let stage = Stage::Raw(document);
                    stage.validate()?;
                    Ok(stage)
                }
                other => Err(OdmError::validation(format!(
                    "pipeline stage must be a document, got {:?}",
                    other.element_type()
                ))),
            })
            .collect()
    }
}

fn is_tag_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}
