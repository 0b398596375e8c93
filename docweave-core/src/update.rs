//! Field-level modifications for update commands.
//!
//! An [`Update`] is an ordered list of [`UpdateOp`]s. Backends either apply the
//! operations directly or render them into their native update document,
//! grouped by operator.

use bson::{Bson, Document};

use crate::{
    error::{OdmError, OdmResult},
    filter::validate_field_path,
};

/// A single field modification.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    /// Sets a field to a value.
    Set(String, Bson),
    /// Removes a field.
    Unset(String),
    /// Adds a number to a numeric field (missing fields start at zero).
    Inc(String, Bson),
    /// Multiplies a numeric field (missing fields become zero).
    Mul(String, Bson),
    /// Sets the field to `value` if `value` is smaller.
    Min(String, Bson),
    /// Sets the field to `value` if `value` is greater.
    Max(String, Bson),
    /// Moves a field to a new name.
    Rename(String, String),
    /// Appends to an array field.
    Push(String, Bson),
    /// Removes every matching element from an array field.
    Pull(String, Bson),
    /// Appends to an array field unless already present.
    AddToSet(String, Bson),
    /// Sets a field to the current server time.
    CurrentDate(String),
    /// A store-native update document, passed through as-is.
    Raw(Document),
}

impl UpdateOp {
    /// Field paths written by this operation.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            UpdateOp::Set(field, _)
            | UpdateOp::Unset(field)
            | UpdateOp::Inc(field, _)
            | UpdateOp::Mul(field, _)
            | UpdateOp::Min(field, _)
            | UpdateOp::Max(field, _)
            | UpdateOp::Push(field, _)
            | UpdateOp::Pull(field, _)
            | UpdateOp::AddToSet(field, _)
            | UpdateOp::CurrentDate(field) => vec![field.as_str()],
            UpdateOp::Rename(from, to) => vec![from.as_str(), to.as_str()],
            UpdateOp::Raw(document) => document
                .values()
                .filter_map(Bson::as_document)
                .flat_map(|fields| fields.keys().map(String::as_str))
                .collect(),
        }
    }
}

/// Ordered list of field modifications applied atomically to each matched
/// document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    ops: Vec<UpdateOp>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Appends an arbitrary operation.
    pub fn push_op(&mut self, op: UpdateOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.ops.push(UpdateOp::Set(field.into(), value.into()));
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.ops.push(UpdateOp::Unset(field.into()));
        self
    }

    pub fn inc(mut self, field: impl Into<String>, by: impl Into<Bson>) -> Self {
        self.ops.push(UpdateOp::Inc(field.into(), by.into()));
        self
    }

    pub fn mul(mut self, field: impl Into<String>, by: impl Into<Bson>) -> Self {
        self.ops.push(UpdateOp::Mul(field.into(), by.into()));
        self
    }

    pub fn min(mut self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.ops.push(UpdateOp::Min(field.into(), value.into()));
        self
    }

    pub fn max(mut self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.ops.push(UpdateOp::Max(field.into(), value.into()));
        self
    }

    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.ops.push(UpdateOp::Rename(from.into(), to.into()));
        self
    }

    pub fn push(mut self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.ops.push(UpdateOp::Push(field.into(), value.into()));
        self
    }

    pub fn pull(mut self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.ops.push(UpdateOp::Pull(field.into(), value.into()));
        self
    }

    pub fn add_to_set(mut self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.ops.push(UpdateOp::AddToSet(field.into(), value.into()));
        self
    }

    pub fn current_date(mut self, field: impl Into<String>) -> Self {
        self.ops.push(UpdateOp::CurrentDate(field.into()));
        self
    }

    /// Appends a store-native update document such as
    /// `{ "$set": { "a": 1 }, "$inc": { "b": 2 } }`.
    pub fn raw(mut self, document: Document) -> Self {
        self.ops.push(UpdateOp::Raw(document));
        self
    }

    /// Checks that the update is non-empty, uses valid paths and never
    /// touches `_id`.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] describing the first problem found.
    pub fn validate(&self) -> OdmResult<()> {
        if self.ops.is_empty() {
            return Err(OdmError::validation("update has no modifications"));
        }
        for op in &self.ops {
            if let UpdateOp::Raw(document) = op {
                if document.is_empty() || document.keys().any(|k| !k.starts_with('$')) {
                    return Err(OdmError::validation(
                        "a raw update must only contain update operators",
                    ));
                }
            }
            for path in op.paths() {
                validate_field_path(path)?;
                if path == "_id" || path.starts_with("_id.") {
                    return Err(OdmError::validation("the identifier field cannot be modified"));
                }
            }
        }
        Ok(())
    }

    /// Renders the update as a native document grouped by operator.
    ///
    /// Operations on the same operator are merged in order; a later write to
    /// the same path wins.
    pub fn to_document(&self) -> Document {
        let mut rendered = Document::new();
        let mut put = |operator: &str, field: &str, value: Bson| {
            let entry = rendered
                .entry(operator.to_string())
                .or_insert_with(|| Bson::Document(Document::new()));
            if let Bson::Document(fields) = entry {
                fields.insert(field.to_string(), value);
            }
        };
        for op in &self.ops {
            match op {
                UpdateOp::Set(f, v) => put("$set", f, v.clone()),
                UpdateOp::Unset(f) => put("$unset", f, Bson::String(String::new())),
                UpdateOp::Inc(f, v) => put("$inc", f, v.clone()),
                UpdateOp::Mul(f, v) => put("$mul", f, v.clone()),
                UpdateOp::Min(f, v) => put("$min", f, v.clone()),
                UpdateOp::Max(f, v) => put("$max", f, v.clone()),
                UpdateOp::Rename(from, to) => put("$rename", from, Bson::String(to.clone())),
                UpdateOp::Push(f, v) => put("$push", f, v.clone()),
                UpdateOp::Pull(f, v) => put("$pull", f, v.clone()),
                UpdateOp::AddToSet(f, v) => put("$addToSet", f, v.clone()),
                UpdateOp::CurrentDate(f) => put("$currentDate", f, Bson::Boolean(true)),
                UpdateOp::Raw(document) => {
                    for (operator, fields) in document {
                        if let Bson::Document(fields) = fields {
                            for (field, value) in fields {
                                put(operator, field, value.clone());
                            }
                        }
                    }
                }
            }
        }
        rendered
    }
}
