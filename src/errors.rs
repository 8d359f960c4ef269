use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("address is required for geocoding")]
    MissingAddress,
    #[error("geocoding provider is rate limiting requests")]
    RateLimited,
    #[error("geocoding provider error: {0}")]
    Provider(String),
    #[error("invalid coordinates: {0}")]
    InvalidCoordinates(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("recommendation delegate unavailable: {0}")]
    DelegateUnavailable(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("{0}")]
    Config(String),
}

impl AppError {
    /// True for errors caused by the caller's input rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::MissingAddress
                | AppError::InvalidCoordinates(_)
                | AppError::NotFound(_)
                | AppError::InvalidQuery(_)
                | AppError::InvalidRequest(_)
        )
    }
}
