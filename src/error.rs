use crate::database::ItemStatus;
use thiserror::Error;

/// Errors surfaced by the item store and lock table.
///
/// None of these are retried internally; workers decide whether to retry by
/// re-entering their claim loop.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid transition for item {item_id}: {from} -> {to}")]
    InvalidTransition {
        item_id: i64,
        from: ItemStatus,
        to: ItemStatus,
    },

    #[error("Not found: item {0}")]
    NotFound(i64),

    #[error("{0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("database connection mutex poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Typed application error hierarchy for everything above the store.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Io(String),

    #[error("Feed error: {0}")]
    Feed(String),

    #[error("{0}")]
    Json(String),

    #[error("{0}")]
    Other(String),
}

// ── From impls ─────────────────────────────────────────────────────────────

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Store(StoreError::Database(e))
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(e: serde_yaml::Error) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Feed(e.to_string())
    }
}

impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Other(s)
    }
}

impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Other(s.to_string())
    }
}
