//! Error types for the turn pipeline

use thiserror::Error;

/// Result type alias for turn pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the turn pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Inbound event rejected (malformed user id, kind/payload mismatch)
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Webhook signature missing or invalid
    #[error("signature error: {0}")]
    Signature(String),

    /// Channel error
    #[error("channel error: {0}")]
    Channel(String),

    /// Reasoner returned an error
    #[error("reasoner error: {0}")]
    Reasoner(String),

    /// Reasoner did not answer within the configured timeout
    #[error("reasoner timed out after {0:?}")]
    ReasonerTimeout(std::time::Duration),

    /// Event ledger backend unreachable
    #[error("event ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// Recent-history store error
    #[error("history error: {0}")]
    History(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
