//! Error types for remote storage access

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("Request rejected {code}: {message}")]
    Request { code: i64, message: String },

    #[error("Login failed for user {0}")]
    Login(String),

    #[error("Malformed response: {0}")]
    BadResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;
