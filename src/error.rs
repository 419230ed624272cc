//! Error types for seqindex

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Insufficient samples: got {got}, need at least {required}")]
    InsufficientSamples { got: usize, required: usize },

    #[error("Empty corpus: {0}")]
    EmptyCorpus(String),

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Index write error: {0}")]
    IndexWrite(String),

    #[error("Index query error: {0}")]
    IndexQuery(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn index_write(msg: impl Into<String>) -> Self {
        Error::IndexWrite(msg.into())
    }

    pub fn index_query(msg: impl Into<String>) -> Self {
        Error::IndexQuery(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether the error came from the nearest-neighbor index collaborator
    /// (and is therefore worth one retry at the query boundary).
    pub fn is_index_error(&self) -> bool {
        matches!(
            self,
            Error::IndexUnavailable(_)
                | Error::IndexWrite(_)
                | Error::IndexQuery(_)
                | Error::Storage(_)
                | Error::Io(_)
        )
    }
}
