//! Errors raised by the in-memory backend.

use docweave_core::error::OdmError;
use thiserror::Error;

/// Failures of the in-memory store, surfaced as [`OdmError::Store`].
#[derive(Error, Debug)]
pub enum MemoryStoreError {
    #[error("duplicate key in {collection} for index {index}: {key}")]
    DuplicateKey {
        collection: String,
        index: String,
        key: String,
    },
    #[error("the _id of a document in {0} cannot be modified")]
    ImmutableId(String),
    #[error("no open transaction with session {0}")]
    UnknownSession(u64),
    #[error("unsupported operator {0}")]
    UnsupportedOperator(String),
    #[error("invalid operand for {operator}: {message}")]
    InvalidOperand { operator: String, message: String },
    #[error("cannot build unique index {index} on {collection}: existing documents collide")]
    IndexBuild { collection: String, index: String },
}

impl MemoryStoreError {
    pub(crate) fn operand(operator: impl Into<String>, message: impl Into<String>) -> Self {
        MemoryStoreError::InvalidOperand { operator: operator.into(), message: message.into() }
    }
}

impl From<MemoryStoreError> for OdmError {
    fn from(err: MemoryStoreError) -> Self {
        OdmError::store(err)
    }
}

pub type MemoryResult<T> = Result<T, MemoryStoreError>;
