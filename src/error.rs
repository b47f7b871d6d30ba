//! Error types for tidemark.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tidemark operations.
pub type Result<T> = std::result::Result<T, TidemarkError>;

/// Main error type for tidemark operations.
#[derive(Error, Debug)]
pub enum TidemarkError {
    #[error("No rows given to insert")]
    EmptyBatch,

    #[error("WAL {operation} failed: {details}")]
    Wal { operation: String, details: String },

    #[error("Data corruption detected: {0}")]
    DataCorruption(String),

    #[error("Cannot open partition at {path:?}: {details}")]
    InvalidPartition { path: PathBuf, details: String },

    #[error("Cannot insert rows into read-only partition at {path:?}")]
    ReadOnlyPartition { path: PathBuf },

    #[error("Partition not found for timestamp {timestamp}")]
    PartitionNotFound { timestamp: i64 },

    #[error("Partition with max timestamp {max_timestamp} is expired")]
    PartitionExpired { max_timestamp: i64 },

    #[error("Storage has degraded to read-only mode and rejects inserts")]
    DegradedMode,

    #[error("Storage is shutting down")]
    ShuttingDown,

    #[error("Storage already closed")]
    Closed,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("IO error at path {path:?}: {source}")]
    IoWithPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}
