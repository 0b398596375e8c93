//! Main docweave crate: typed entities and relations over a document store.
//!
//! This crate is the entry point for users of docweave. It re-exports the core
//! types from the sub-crates and gives access to the storage backends.
//!
//! # Features
//!
//! - **Typed entities**: serde types with pluggable identifier kinds
//! - **Relations without joins**: single references and join-collection relations
//!   navigated through aggregation pipelines
//! - **Command builders**: find, update, replace, delete, paged search and
//!   parameterized pipelines, all cancellable
//! - **Context**: global filters, audit hooks and transactions
//! - **Fuzzy matching**: diacritic-insensitive, phonetic text search
//! - **Migrations**: numbered, forward-only, recorded in the store
//!
//! # Quick Start
//!
//! ```ignore
//! use docweave::{prelude::*, memory::InMemoryStore};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! pub struct Author {
//!     #[serde(rename = "_id")]
//!     pub id: EntityId,
//!     pub name: String,
//! }
//!
//! impl Entity for Author {
//!     fn id(&self) -> &EntityId { &self.id }
//!     fn assign_id(&mut self, id: EntityId) { self.id = id; }
//!     fn id_kind() -> IdKind { IdKind::Sequence }
//!     fn type_name() -> &'static str { "Author" }
//! }
//!
//! #[tokio::main]
//! async fn main() -> OdmResult<()> {
//!     let ctx = Context::new(InMemoryStore::builder().build().await?);
//!
//!     let mut author = Author { id: EntityId::default(), name: "Ursula".into() };
//!     ctx.save(&mut author).await?;
//!
//!     let found = ctx
//!         .find::<Author>()
//!         .matching(Filter::eq("name", "Ursula"))
//!         .execute_single()
//!         .await?;
//!     assert_eq!(found.map(|a| a.id), Some(author.id));
//!
//!     Ok(())
//! }
//! ```
//!
//! # Relations
//!
//! ```ignore
//! let schema = Schema::builder()
//!     .many_to_many::<Author, Book>("books", "authors")
//!     .build()?;
//! let ctx = Context::builder(backend).schema(schema).build();
//!
//! ctx.many::<Author, Book>(&author, "books")?.add(&book).await?;
//! let books = ctx.many::<Author, Book>(&author, "books")?.children().execute().await?;
//! ```
//!
//! # Migrations
//!
//! ```ignore
//! use docweave::{prelude::*, migrate::{Migration, MigrationRef, Migrations}};
//!
//! struct AddDisplayName;
//!
//! #[async_trait]
//! impl Migration for AddDisplayName {
//!     fn number(&self) -> u32 { 1 }
//!     fn name(&self) -> &'static str { "add_display_name" }
//!
//!     async fn upgrade(&self, ctx: &Context) -> OdmResult<()> {
//!         ctx.update::<Author>().match_all().set("display_name", "").execute().await?;
//!         Ok(())
//!     }
//! }
//!
//! struct AppMigrations;
//!
//! impl Migrations for AppMigrations {
//!     fn migrations() -> Vec<MigrationRef> {
//!         vec![Box::new(AddDisplayName)]
//!     }
//! }
//!
//! ctx.migrate::<AppMigrations>().await?;
//! ```
//!
//! # Backends
//!
//! - [`memory`] - In-process storage for development and testing
//! - [`mongodb`] - MongoDB backend (requires the `mongodb` feature)

pub mod prelude;

pub use docweave_core::{
    backend, command, context, entity, error, filter, fuzzy, id, join, metaphone, migrate, page,
    pipeline, relation, schema, update,
};

// Re-export BSON types for convenience
pub use bson;

/// In-memory storage backend.
pub mod memory {
    pub use docweave_memory::{InMemoryStore, InMemoryStoreBuilder, MemoryStoreError};
}

/// MongoDB storage backend.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use docweave_mongodb::{MongoDbStore, MongoDbStoreBuilder};
}
