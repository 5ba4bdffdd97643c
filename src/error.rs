use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unexpected argument: {0}")]
    UnexpectedArgument(String),

    #[error("PostgresEngine can only be created through one of its factory methods")]
    ConstructorMisuse,

    #[error("Engine is closed")]
    Closed,

    #[error("Column '{column}' has type {type_name} which cannot be decoded; cast it to text")]
    UnsupportedColumnType { column: String, type_name: String },

    #[error("Connector error: {0}")]
    Connector(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("SQL error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Argument errors are raised before any network or authentication attempt.
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_) | EngineError::UnexpectedArgument(_)
        )
    }

    pub fn is_validation_error(&self) -> bool {
        matches!(self, EngineError::Validation(_))
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }
}
