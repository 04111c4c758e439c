use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Object storage error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("Date parse error: {0}")]
    Date(#[from] chrono::ParseError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Catalog snapshot for '{object_type}' is missing columns: {missing:?}")]
    SchemaMismatch {
        object_type: String,
        missing: Vec<String>,
    },

    #[error("Catalog download for '{object_type}' failed with HTTP status {status}")]
    CatalogDownload { object_type: String, status: u16 },

    #[error("Archive key does not encode a ddmmyyyy date: {0}")]
    InvalidArchiveKey(String),

    #[error("Illegal archive transition for {key}: {from} -> {to}")]
    IllegalTransition {
        key: String,
        from: String,
        to: String,
    },

    #[error("Matomo API error: {message}")]
    Matomo { message: String },

    #[error("Notification failed: {0}")]
    Notify(String),

    #[error("Run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, MetricsError>;
