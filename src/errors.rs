use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("VALIDATION: {0}")]
    Validation(String),
    #[error("UNAUTHENTICATED: {0}")]
    Unauthenticated(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("SUBSCRIPTION_FAILED: {0}")]
    Subscription(String),
    #[error("DECODE_FAILED: {0}")]
    Decode(String),
    #[error("WRITE_FAILED: {0}")]
    Write(String),
    #[error("SUGGESTION_FAILED: {0}")]
    Suggestion(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(value: reqwest::Error) -> Self {
        Self::Suggestion(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
