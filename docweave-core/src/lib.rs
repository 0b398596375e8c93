//! Typed entities and relations over a document store without native joins.
//!
//! This crate is the core of the docweave project and provides:
//!
//! - **Identifiers** ([`id`]) - Pluggable identifier kinds and the sequence generator
//! - **Entities** ([`entity`]) - The trait every persisted type implements
//! - **Schema** ([`schema`]) - Collection overrides, tags and relation declarations
//! - **Filters, updates and pipelines** ([`filter`], [`update`], [`pipeline`]) - Backend-neutral ASTs
//! - **Store backend abstraction** ([`backend`]) - The trait document-store clients implement
//! - **Relations** ([`relation`], [`join`]) - Single references and join-collection relations
//! - **Commands** ([`command`]) - Find, update, replace, delete, paged search and pipelines
//! - **Context** ([`context`]) - Global filters, audit hooks and transactions
//! - **Fuzzy matching** ([`fuzzy`], [`metaphone`]) - Normalized and phonetic text facets
//! - **Migrations** ([`migrate`]) - Numbered forward-only migrations
//! - **Error handling** ([`error`]) - Error and result types
//!
//! # Example
//!
//! ```ignore
//! use docweave_core::{context::Context, filter::Filter};
//!
//! let ctx = Context::builder(backend).schema(schema).build();
//!
//! let mut author = Author::new("Ursula");
//! ctx.save(&mut author).await?;
//!
//! let found = ctx.find::<Author>().matching(Filter::eq("name", "Ursula")).execute().await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docweave_core;

pub mod backend;
pub mod command;
pub mod context;
pub mod entity;
pub mod error;
pub mod filter;
pub mod fuzzy;
pub mod id;
pub mod join;
pub mod metaphone;
pub mod migrate;
pub mod page;
pub mod pipeline;
pub mod relation;
pub mod schema;
pub mod update;
