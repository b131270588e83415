use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("FETCH_FAILED: {0}")]
    Fetch(String),
    #[error("MERGE_FAILED: {0}")]
    Merge(String),
    #[error("QUERY_FAILED: {0}")]
    Query(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn into_merge(self) -> Self {
        match self {
            Self::Merge(message) => Self::Merge(message),
            other => Self::Merge(other.message()),
        }
    }

    pub fn into_query(self) -> Self {
        match self {
            Self::Query(message) => Self::Query(message),
            other => Self::Query(other.message()),
        }
    }

    fn message(self) -> String {
        match self {
            Self::Fetch(message)
            | Self::Merge(message)
            | Self::Query(message)
            | Self::Config(message)
            | Self::Io(message)
            | Self::Internal(message) => message,
        }
    }
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
        Self::Fetch(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
