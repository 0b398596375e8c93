//! Core traits for persisted entities and their serialization.
//!
//! Every type stored through a [`Context`](crate::context::Context) implements
//! [`Entity`]. The trait carries the entity's identifier and the identifier
//! kind it declares; everything else (collection names, tags, relations) is
//! configured once at startup through [`Schema`](crate::schema::Schema).

use bson::{Bson, Document, de::deserialize_from_bson, ser::serialize_to_bson};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::any::Any;

use crate::{
    error::{OdmError, OdmResult},
    id::{EntityId, IdKind},
};

/// Core trait that every persisted entity must implement.
///
/// The identifier must be serialized under the `_id` key, which is where the
/// store keeps it:
///
/// ```ignore
/// use docweave::prelude::*;
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct Author {
///     #[serde(rename = "_id")]
///     pub id: EntityId,
///     pub name: String,
/// }
///
/// impl Entity for Author {
///     fn id(&self) -> &EntityId {
///         &self.id
///     }
///
///     fn assign_id(&mut self, id: EntityId) {
///         self.id = id;
///     }
///
///     fn id_kind() -> IdKind {
///         IdKind::ObjectId
///     }
///
///     fn type_name() -> &'static str {
///         "Author"
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + Clone + 'static {
    /// Returns this entity's identifier.
    fn id(&self) -> &EntityId;

    /// Stores a freshly generated identifier.
    ///
    /// Called by the context exactly once per unsaved entity, at save time.
    fn assign_id(&mut self, id: EntityId);

    /// The identifier representation this type declares.
    fn id_kind() -> IdKind;

    /// Stable type name, used as the default collection name and as the key
    /// for per-type global filters.
    fn type_name() -> &'static str;

    /// Receives the context's audit value before the entity is saved.
    fn set_modified_by(&mut self, _modified_by: &ModifiedBy) {}

    /// Field that holds the audit value, if the type tracks one.
    ///
    /// When present, update commands set it alongside the caller's changes.
    fn modified_by_field() -> Option<&'static str> {
        None
    }
}

/// Extension trait converting entities to and from BSON documents.
///
/// Implemented for every [`Entity`]. Failures are reported as
/// [`OdmError::Serialization`] tagged with the entity's type name.
pub trait EntityExt: Entity {
    /// Serializes this entity into a BSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if a field cannot be represented in BSON or the
    /// entity does not serialize to a document.
    fn to_document(&self) -> OdmResult<Document>;

    /// Deserializes an entity from a BSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not match the entity's shape.
    fn from_document(document: Document) -> OdmResult<Self>;
}

impl<E: Entity> EntityExt for E {
    fn to_document(&self) -> OdmResult<Document> {
        match serialize_to_bson(self) {
            Ok(Bson::Document(document)) => Ok(document),
            Ok(other) => Err(OdmError::serialization_of(
                E::type_name(),
                format!("expected a document, got {:?}", other.element_type()),
            )),
            Err(e) => Err(OdmError::serialization_of(E::type_name(), e)),
        }
    }

    fn from_document(document: Document) -> OdmResult<Self> {
        deserialize_from_bson(Bson::Document(document))
            .map_err(|e| OdmError::serialization_of(E::type_name(), e))
    }
}

/// Deserializes an arbitrary result shape from a BSON document.
///
/// Used for projections and pipeline results that do not map to an entity.
pub(crate) fn decode<R: DeserializeOwned>(document: Document) -> OdmResult<R> {
    deserialize_from_bson(Bson::Document(document))
        .map_err(|e| OdmError::serialization::<R>(e))
}

/// Type-erased entity handed to context hooks.
///
/// Hooks that only care about a few concrete types downcast with
/// [`downcast_mut`](dyn AnyEntity::downcast_mut).
pub trait AnyEntity: Send + Sync {
    /// Returns the entity's identifier.
    fn entity_id(&self) -> &EntityId;

    /// Returns the entity's type name.
    fn entity_type(&self) -> &'static str;

    /// Returns a reference to the entity as `Any`.
    fn as_any(&self) -> &dyn Any;

    /// Returns a mutable reference to the entity as `Any`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl dyn AnyEntity + '_ {
    /// Attempts to downcast to a concrete entity type.
    pub fn downcast_ref<E: Entity>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    /// Attempts to downcast to a concrete entity type, mutably.
    pub fn downcast_mut<E: Entity>(&mut self) -> Option<&mut E> {
        self.as_any_mut().downcast_mut::<E>()
    }
}

impl<E: Entity> AnyEntity for E {
    fn entity_id(&self) -> &EntityId {
        self.id()
    }

    fn entity_type(&self) -> &'static str {
        E::type_name()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Audit value copied into entities and updates by the context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedBy {
    pub user_id: String,
    pub user_name: String,
}

impl ModifiedBy {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), user_name: user_name.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        #[serde(rename = "_id")]
        id: EntityId,
        body: String,
    }

    impl Entity for Note {
        fn id(&self) -> &EntityId {
            &self.id
        }

        fn assign_id(&mut self, id: EntityId) {
            self.id = id;
        }

        fn id_kind() -> IdKind {
            IdKind::Sequence
        }

        fn type_name() -> &'static str {
            "Note"
        }
    }

    #[test]
    fn identifier_lands_in_underscore_id() {
        let note = Note { id: EntityId::Sequence(9), body: "hi".into() };
        let document = note.to_document().unwrap();
        assert_eq!(document, doc! { "_id": 9_i64, "body": "hi" });
        assert_eq!(Note::from_document(document).unwrap(), note);
    }

    #[test]
    fn decode_failure_names_the_entity() {
        match Note::from_document(doc! { "_id": 1_i64 }) {
            Err(OdmError::Serialization { type_name, .. }) => assert_eq!(type_name, "Note"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn erased_entity_downcasts() {
        let mut note = Note { id: EntityId::Sequence(1), body: String::new() };
        let erased: &mut dyn AnyEntity = &mut note;
        assert_eq!(erased.entity_type(), "Note");
        erased.downcast_mut::<Note>().unwrap().body.push_str("edited");
        assert_eq!(note.body, "edited");
    }
}
