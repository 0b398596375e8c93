//! In-memory document store backend for docweave.
//!
//! This crate implements [`StoreBackend`](docweave_core::backend::StoreBackend)
//! entirely in process. It evaluates the core filter, update and pipeline
//! types directly, parses raw store-native documents for the operators it
//! supports, enforces unique indexes and runs snapshot transactions. It backs
//! the test-suite and suits development and small deployments.
//!
//! # Features
//!
//! - **Thread-safe access**: concurrent reads and writes behind an async `RwLock`
//! - **All-or-nothing writes**: each call works on a copy that is swapped in on success
//! - **Aggregation**: `$match`, `$sort`, `$skip`, `$limit`, `$project`, `$lookup`,
//!   `$unwind`, `$replaceRoot`, `$count` and `$facet`, typed or raw
//! - **Transactions**: snapshot per session, applied on commit
//!
//! # Quick Start
//!
//! ```ignore
//! use docweave::prelude::*;
//! use docweave::memory::InMemoryStore;
//!
//! let backend = InMemoryStore::builder().build().await?;
//! let ctx = Context::new(backend);
//! ctx.save(&mut author).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docweave_memory;

mod aggregate;
pub mod error;
mod evaluator;
mod parse;
mod paths;
pub mod store;
mod updater;

pub use error::MemoryStoreError;
pub use store::{InMemoryStore, InMemoryStoreBuilder};
