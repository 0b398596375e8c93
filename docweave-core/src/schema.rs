//! Startup configuration of entity types and relations.
//!
//! A [`Schema`] is built once with [`Schema::builder`] and shared by every
//! context. It records per-type collection overrides and tags (shared keys
//! that global filters can target, standing in for a common interface or base
//! type) and every relation between entity types together with the join
//! collection that stores its edges.
//!
//! ```ignore
//! let schema = Schema::builder()
//!     .entity::<Author>(|c| c.collection("authors").tag("soft_delete"))
//!     .entity::<Book>(|c| c.tag("soft_delete"))
//!     .one_to_many::<Author, Review>("reviews")
//!     .many_to_many::<Author, Book>("books", "authors")
//!     .build()?;
//! ```
//!
//! Declaring a many-to-many relation names both endpoints at once and makes
//! the first type parameter the owner, so every pair has exactly one owner.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    entity::Entity,
    error::{OdmError, OdmResult},
};

/// Configuration of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityConfig {
    pub type_name: &'static str,
    pub collection: String,
    pub tags: Vec<String>,
}

/// Per-type settings collected by [`SchemaBuilder::entity`].
#[derive(Debug, Default)]
pub struct EntityConfigBuilder {
    collection: Option<String>,
    tags: Vec<String>,
}

impl EntityConfigBuilder {
    /// Overrides the collection name, which defaults to the type name.
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collection = Some(name.into());
        self
    }

    /// Adds a tag that global filters can be registered against.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Navigable from the owner only.
    OneToMany,
    /// Navigable from both endpoints; the inverse side swaps key positions.
    ManyToMany,
}

/// Which endpoint of a relation a navigation starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Owner,
    Inverse,
}

/// A declared relation and its join collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    pub kind: RelationKind,
    /// Type name of the owner. Join records keep its id in `parent_id`.
    pub owner: &'static str,
    /// Type name of the other endpoint. Join records keep its id in `child_id`.
    pub target: &'static str,
    pub owner_property: String,
    pub inverse_property: Option<String>,
    pub join_collection: String,
}

impl RelationDef {
    /// Target type name as seen from `side`.
    pub fn other_type(&self, side: Side) -> &'static str {
        match side {
            Side::Owner => self.target,
            Side::Inverse => self.owner,
        }
    }
}

/// Immutable registry of entity configurations and relations.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: BTreeMap<&'static str, EntityConfig>,
    relations: Vec<RelationDef>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Collection name of a type, defaulting to the type name.
    pub fn collection_of(&self, type_name: &'static str) -> &str {
        self.entities
            .get(type_name)
            .map(|config| config.collection.as_str())
            .unwrap_or(type_name)
    }

    pub fn tags_of(&self, type_name: &str) -> &[String] {
        self.entities
            .get(type_name)
            .map(|config| config.tags.as_slice())
            .unwrap_or_default()
    }

    pub fn entity(&self, type_name: &str) -> Option<&EntityConfig> {
        self.entities.get(type_name)
    }

    pub fn relations(&self) -> &[RelationDef] {
        &self.relations
    }

    /// Finds the relation reachable from `type_name` through `property`.
    pub fn relation(&self, type_name: &str, property: &str) -> Option<(&RelationDef, Side)> {
        self.relations.iter().find_map(|relation| {
            if relation.owner == type_name && relation.owner_property == property {
                Some((relation, Side::Owner))
            } else if relation.target == type_name
                && relation.inverse_property.as_deref() == Some(property)
            {
                Some((relation, Side::Inverse))
            } else {
                None
            }
        })
    }

    /// Join collections holding edges of `type_name`, with the key fields its
    /// ids occupy in each. A self-relation lists both key fields.
    pub fn join_positions(&self, type_name: &str) -> Vec<(&str, Vec<&'static str>)> {
        self.relations
            .iter()
            .filter_map(|relation| {
                let mut keys = Vec::new();
                if relation.owner == type_name {
                    keys.push(crate::join::PARENT_KEY);
                }
                if relation.target == type_name {
                    keys.push(crate::join::CHILD_KEY);
                }
                (!keys.is_empty()).then_some((relation.join_collection.as_str(), keys))
            })
            .collect()
    }

    pub fn has_relations(&self, type_name: &str) -> bool {
        self.relations
            .iter()
            .any(|r| r.owner == type_name || r.target == type_name)
    }
}

struct PendingRelation {
    kind: RelationKind,
    owner: &'static str,
    target: &'static str,
    owner_property: String,
    inverse_property: Option<String>,
}

/// Builder for [`Schema`]. Problems are reported by [`build`](Self::build).
#[derive(Default)]
pub struct SchemaBuilder {
    entities: Vec<(&'static str, EntityConfigBuilder)>,
    relations: Vec<PendingRelation>,
}

impl SchemaBuilder {
    /// Configures an entity type.
    pub fn entity<E: Entity>(
        mut self,
        configure: impl FnOnce(EntityConfigBuilder) -> EntityConfigBuilder,
    ) -> Self {
        let config = configure(EntityConfigBuilder::default());
        self.entities.push((E::type_name(), config));
        self
    }

    /// Declares a relation navigable from `P` through `property`.
    pub fn one_to_many<P: Entity, C: Entity>(mut self, property: impl Into<String>) -> Self {
        self.relations.push(PendingRelation {
            kind: RelationKind::OneToMany,
            owner: P::type_name(),
            target: C::type_name(),
            owner_property: property.into(),
            inverse_property: None,
        });
        self
    }

    /// Declares a relation navigable from `Owner` through `owner_property`
    /// and from `Inverse` through `inverse_property`.
    pub fn many_to_many<Owner: Entity, Inverse: Entity>(
        mut self,
        owner_property: impl Into<String>,
        inverse_property: impl Into<String>,
    ) -> Self {
        self.relations.push(PendingRelation {
            kind: RelationKind::ManyToMany,
            owner: Owner::type_name(),
            target: Inverse::type_name(),
            owner_property: owner_property.into(),
            inverse_property: Some(inverse_property.into()),
        });
        self
    }

    /// Validates the configuration and derives join collection names.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] if a type is configured twice, two
    /// types share a collection, a name is malformed, or a (type, property)
    /// pair is bound by more than one relation.
    pub fn build(self) -> OdmResult<Schema> {
        let mut entities = BTreeMap::new();
        let mut collections = BTreeSet::new();
        for (type_name, config) in self.entities {
            let collection = config.collection.unwrap_or_else(|| type_name.to_string());
            validate_name("collection", &collection)?;
            if config.tags.iter().any(|tag| tag.trim().is_empty()) {
                return Err(OdmError::validation(format!("{type_name} has an empty tag")));
            }
            if !collections.insert(collection.clone()) {
                return Err(OdmError::validation(format!(
                    "collection '{collection}' is used by more than one entity type"
                )));
            }
            let entity = EntityConfig { type_name, collection, tags: config.tags };
            if entities.insert(type_name, entity).is_some() {
                return Err(OdmError::validation(format!("{type_name} is configured twice")));
            }
        }

        let mut schema = Schema { entities, relations: Vec::new() };
        let mut bound = BTreeSet::new();
        for pending in self.relations {
            validate_name("relation property", &pending.owner_property)?;
            let mut bindings = vec![(pending.owner, pending.owner_property.clone())];
            if let Some(inverse) = &pending.inverse_property {
                validate_name("relation property", inverse)?;
                bindings.push((pending.target, inverse.clone()));
            }
            for (type_name, property) in bindings {
                if !bound.insert((type_name, property.clone())) {
                    return Err(OdmError::validation(format!(
                        "{type_name}.{property} is bound to more than one relation"
                    )));
                }
            }

            let owner_collection = schema.collection_of(pending.owner).to_string();
            let target_collection = schema.collection_of(pending.target).to_string();
            let join_collection = match &pending.inverse_property {
                None => format!("[{owner_collection}~{target_collection}({})]", pending.owner_property),
                Some(inverse) => format!(
                    "[({inverse}){owner_collection}~{target_collection}({})]",
                    pending.owner_property
                ),
            };
            schema.relations.push(RelationDef {
                kind: pending.kind,
                owner: pending.owner,
                target: pending.target,
                owner_property: pending.owner_property,
                inverse_property: pending.inverse_property,
                join_collection,
            });
        }
        Ok(schema)
    }
}

fn validate_name(what: &str, name: &str) -> OdmResult<()> {
    let bad = name.trim().is_empty()
        || name.starts_with('$')
        || name.chars().any(|c| matches!(c, '\0' | '.' | '~' | '(' | ')' | '[' | ']'));
    if bad {
        return Err(OdmError::validation(format!("invalid {what} name '{name}'")));
    }
    Ok(())
}
