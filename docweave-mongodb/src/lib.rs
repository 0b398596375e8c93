//! MongoDB backend implementation for docweave.
//!
//! This crate provides a MongoDB implementation of the `StoreBackend` trait.
//! Filters, updates and pipeline stages are translated into native BSON and
//! executed by the official driver; transactions run on driver sessions.
//!
//! To use this backend, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! docweave = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Features
//!
//! - **Native translation**: filters, updates and stages become MongoDB syntax
//! - **Transactions**: one driver `ClientSession` per open transaction
//! - **Bulk writes**: `Client::bulk_write` (MongoDB 8.0 or later)
//! - **Multi-tenancy**: [`MongoDbStore::tenant`] shares one client across databases
//!
//! # Example
//!
//! ```ignore
//! use docweave::{backend::StoreBackendBuilder, mongodb::MongoDbStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoDbStore::builder("mongodb://localhost:27017", "my_database")
//!         .build()
//!         .await?;
//!     let other = store.tenant("other_database");
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docweave_mongodb;

pub mod store;
mod query;

pub use store::{MongoDbStore, MongoDbStoreBuilder};
