//! Error types for store operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store is locked, refusing to modify: {0}")]
    Locked(String),

    #[error("Value rejected by validator for path: {0}")]
    Validation(String),

    #[error("Path is not under any item directory: {0}")]
    OutsideItems(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Entry at {0} is not a task record")]
    NotARecord(String),

    #[error("Invalid state transition: from {from:?} to {to:?}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid store URI: {0}")]
    InvalidUri(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
