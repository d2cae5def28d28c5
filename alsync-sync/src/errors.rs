//! Error types for sync operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] alsync_store::StoreError),

    #[error("Remote error: {0}")]
    Remote(#[from] alsync_remote::RemoteError),

    #[error("Update cache is locked, a propagation phase is pending")]
    CacheLocked,

    #[error("Propagation requires the update cache to be locked")]
    NotLocked,

    #[error("Task at {0} has no backup metadata")]
    MissingBackupInfo(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
