//! Error types and result types for mapping-layer operations.
//!
//! Every fallible operation returns [`OdmResult<T>`]. Structural problems are
//! detected locally and surface as [`OdmError::Validation`] before any round
//! trip is made; failures raised by the document-store client are wrapped in
//! [`OdmError::Store`] without being translated, so callers can downcast the
//! original error through [`std::error::Error::source`].
//!
//! A query or write that matches nothing is not an error. It is reported as an
//! empty `Option`, an empty `Vec` or a zero count.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error originating in a store backend.
pub type BoxedStoreError = Box<dyn StdError + Send + Sync + 'static>;

/// Represents all possible errors raised by the mapping layer.
#[derive(Error, Debug)]
pub enum OdmError {
    /// A filter, update, pipeline or relation configuration is malformed.
    ///
    /// Raised before any I/O and never retried.
    #[error("Validation error: {0}")]
    Validation(String),
    /// A transaction was started while another is active, or committed or
    /// aborted while none is open.
    #[error("Transaction state error: {0}")]
    TransactionState(String),
    /// A failure reported by the underlying document-store client.
    #[error(transparent)]
    Store(BoxedStoreError),
    /// A value could not be represented in its declared identifier or field type.
    #[error("Serialization error for {type_name}: {message}")]
    Serialization {
        /// The type of the offending value.
        type_name: String,
        /// Description of the failure.
        message: String,
    },
    /// The operation observed its cancellation signal before completing.
    #[error("Operation cancelled")]
    Cancelled,
    /// A migration failed; the run was halted at this migration.
    #[error("Migration {number} ({name}) failed: {source}")]
    Migration {
        /// Number of the failing migration.
        number: u32,
        /// Name of the failing migration.
        name: String,
        /// The error returned by the migration.
        #[source]
        source: Box<OdmError>,
    },
    /// Error during backend construction or connection setup.
    #[error("Initialization error: {0}")]
    Initialization(String),
}

/// A specialized `Result` type for mapping-layer operations.
pub type OdmResult<T> = Result<T, OdmError>;

impl OdmError {
    /// Wraps an error from the document-store client.
    pub fn store<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        OdmError::Store(Box::new(err))
    }

    /// Builds a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        OdmError::Validation(message.into())
    }

    /// Builds a serialization error tagged with the Rust type `T`.
    pub fn serialization<T: ?Sized>(message: impl ToString) -> Self {
        OdmError::Serialization {
            type_name: std::any::type_name::<T>().to_string(),
            message: message.to_string(),
        }
    }

    /// Builds a serialization error tagged with an explicit type name.
    pub fn serialization_of(type_name: impl Into<String>, message: impl ToString) -> Self {
        OdmError::Serialization {
            type_name: type_name.into(),
            message: message.to_string(),
        }
    }

    /// Returns `true` for errors raised locally before any I/O.
    pub fn is_validation(&self) -> bool {
        matches!(self, OdmError::Validation(_))
    }
}

impl From<BsonError> for OdmError {
    fn from(err: BsonError) -> Self {
        OdmError::serialization_of("bson", err)
    }
}

impl From<SerdeJsonError> for OdmError {
    fn from(err: SerdeJsonError) -> Self {
        OdmError::serialization_of("json", err)
    }
}
