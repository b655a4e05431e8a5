//! Error types for pgmetrics-core

use thiserror::Error;

/// Main error type for the pgmetrics-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error, e.g. reading a config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration is present but invalid
    #[error("configuration error: {0}")]
    ConfigInvalid(String),

    /// Table manager could not resolve a table's structure against the
    /// live catalog after exhausting its retry
    #[error("schema unresolvable for table {table}: {message}")]
    SchemaUnresolvable { table: String, message: String },

    /// Two columns with the same name disagree on a type that cannot be
    /// widened into one another
    #[error("column conflict on {table}.{column}: {existing} vs {incoming}")]
    ColumnConflict {
        table: String,
        column: String,
        existing: String,
        incoming: String,
    },

    /// The tag-table merge step failed
    #[error("tag insert failed for table {table}: {message}")]
    TagInsertFailed { table: String, message: String },

    /// The bulk-copy step failed
    #[error("copy failed for table {table}: {message}")]
    CopyFailed { table: String, message: String },

    /// A database operation failed with an error the classifier marked
    /// temporary, after retries were exhausted
    #[error("transient database error: {0}")]
    Transient(String),

    /// A database operation failed with an error the classifier marked
    /// permanent
    #[error("permanent database error: {0}")]
    Permanent(String),

    /// The writer is shutting down and can no longer accept batches
    #[error("writer is shutting down")]
    ShuttingDown,
}

/// Result type alias for pgmetrics-core
pub type Result<T> = std::result::Result<T, Error>;
