//! Convenient re-exports of commonly used types from docweave.
//!
//! ```ignore
//! use docweave::prelude::*;
//! ```
//!
//! This provides access to:
//! - Entity traits and identifiers
//! - The context, its builder and the schema
//! - Filter, update and pipeline construction
//! - Relations, pages and fuzzy strings
//! - Store backend traits, error types and migration tools

pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
pub use tokio_util::sync::CancellationToken;

pub use docweave_core::{
    backend::{IndexKind, IndexModel, StoreBackend, StoreBackendBuilder, WriteSummary},
    command::DeleteSummary,
    context::{Context, ContextBuilder, ContextHooks, FilterScope},
    entity::{AnyEntity, Entity, EntityExt, ModifiedBy},
    error::{OdmError, OdmResult},
    filter::{Expr, Field, FieldOp, Filter, FilterPosition, Projection, Query, Search, Sort, SortDirection},
    fuzzy::FuzzyString,
    id::{EntityId, IdKind},
    migrate::{Migration, MigrationRecord, MigrationRef, Migrations, Migrator},
    page::Page,
    pipeline::{Stage, Template},
    relation::{Many, One},
    schema::Schema,
    update::Update,
};
