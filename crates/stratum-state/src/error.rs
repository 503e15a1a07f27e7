//! State store error types

use thiserror::Error;

/// State store errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("State backend unavailable: {0}")]
    Backend(String),

    #[error("Corrupt state record {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("State record version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Timed out waiting for lock: {0}")]
    LockTimeout(String),

    #[error("Secret error: {0}")]
    Secret(String),

    #[error("Invalid state key: {0}")]
    InvalidKey(String),
}

impl From<reqwest::Error> for StateError {
    fn from(err: reqwest::Error) -> Self {
        StateError::Backend(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StateError {
    fn from(err: tokio::task::JoinError) -> Self {
        StateError::Backend(format!("state worker task failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, StateError>;
