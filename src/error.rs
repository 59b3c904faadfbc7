//! Error types shared across the tracker

use thiserror::Error;

/// Failures of the key/value substrate under the durable track store
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),
}

/// Durable track store write failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Poll and enrichment fetch failures
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("feed exhausted")]
    Exhausted,
}
