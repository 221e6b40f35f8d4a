use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Injected failure: {0}")]
    Injected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Recoverable failure of a single indicator. Never escapes the registry:
/// the indicator contributes a zero-score, zero-confidence result instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndicatorError {
    #[error("missing data: {0}")]
    MissingData(&'static str),

    #[error("missing context: {0}")]
    MissingContext(&'static str),

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: f64 },
}
