//! Error types for the plexus-storage crate.
//!
//! All storage operations return [`StorageError`] via [`StorageResult`].
//! At the component boundary errors are converted into
//! [`plexus_kernel::KernelError`] under the engine's name.

use std::time::Duration;

use thiserror::Error;

/// Alias for `Result<T, StorageError>`.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Relational backend operation failed.
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Embedded document store operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// MongoDB operation failed.
    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// Converting a JSON document to BSON failed.
    #[error("bson error: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A schema migration of the embedded document store failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// A data-source descriptor names a dialect nobody speaks.
    #[error("unsupported dialect `{dialect}` for data source `{source_name}`")]
    UnsupportedDialect { source_name: String, dialect: String },

    /// A data-source descriptor is malformed.
    #[error("invalid data source `{source_name}`: {reason}")]
    InvalidSource { source_name: String, reason: String },

    /// No connection is registered under the requested service name.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// The command names no service.
    #[error("unknown service")]
    MissingService,

    /// A relational command arrived without SQL text.
    #[error("missing sql raw")]
    MissingSql,

    /// A document command arrived without a collection or filter.
    #[error("missing {0}")]
    MissingField(&'static str),

    /// The SQL statement is neither a query nor a row mutation.
    #[error("unsupported statement: {0}")]
    UnsupportedStatement(String),

    /// A result column has a type the relational driver cannot decode.
    #[error("unsupported column `{column}` of type {type_name}")]
    UnsupportedColumn { column: String, type_name: String },

    /// The message verb is not one the router handles.
    #[error("unknown command ({0})")]
    UnknownCommand(String),

    /// A dependent read gave up waiting for its write.
    #[error("{key} not found within {waited:?}")]
    NotReady { key: String, waited: Duration },

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
