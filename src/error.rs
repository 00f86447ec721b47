use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate-limit realm is at quota. `retry_after` is when the oldest
    /// request in the realm's window expires.
    #[error("Rate limit reached for realm {realm} (retry in {}s)", retry_after.as_secs())]
    RateLimited { realm: String, retry_after: Duration },

    #[error("Vendor API error: {0}")]
    Vendor(String),

    #[error("Storage {step} failed with HTTP {status}")]
    Storage { step: &'static str, status: u16 },

    #[error("Token refresh failed for {provider} (HTTP {status}); member needs to re-authorize")]
    TokenRefresh { provider: String, status: u16 },

    #[error("Could not load existing data: {0}")]
    ExistingData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
