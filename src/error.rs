use thiserror::Error;

pub type Result<T> = std::result::Result<T, MirrorError>;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Discord error: {0}")]
    Discord(#[from] serenity::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Remote request failed: {0}")]
    Remote(String),

    #[error("Media too large: {size} bytes (limit {limit})")]
    MediaTooLarge { size: u64, limit: u64 },

    #[error("Database lock poisoned")]
    LockPoisoned,
}
