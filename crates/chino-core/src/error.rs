//! Error types for the coordination layer.

use thiserror::Error;

/// Failures surfaced by core components.
///
/// Collaborator failures (model, stores, HTTP) are transient: callers log them and
/// carry on. `Config` is raised at construction time and is never retried.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Language model error: {0}")]
    LanguageModel(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Background task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::Config(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
