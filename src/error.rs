use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::capacity::CapacityError;
use crate::storage::StorageError;
use crate::tree::{PathError, TreeError};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found")]
    NotFound,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<PathError> for AppError {
    fn from(e: PathError) -> Self {
        AppError::Tree(TreeError::Path(e))
    }
}

fn internal(kind: &str, detail: &dyn std::fmt::Display) -> (StatusCode, String) {
    tracing::error!("{}: {}", kind, detail);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_string(),
    )
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Capacity(e) => (StatusCode::CONFLICT, e.to_string()),
            AppError::Tree(TreeError::Path(e)) => (StatusCode::BAD_REQUEST, e.to_string()),
            AppError::Tree(TreeError::RootWrite) => {
                (StatusCode::BAD_REQUEST, TreeError::RootWrite.to_string())
            }
            AppError::Tree(e) => internal("Tree error", e),
            AppError::Storage(StorageError::InvalidKey(_)) => {
                (StatusCode::BAD_REQUEST, "Invalid blob key".to_string())
            }
            AppError::Storage(e @ StorageError::TooLarge { .. }) => {
                (StatusCode::PAYLOAD_TOO_LARGE, e.to_string())
            }
            AppError::Storage(e @ StorageError::UnsupportedType(_)) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, e.to_string())
            }
            AppError::Storage(e) => internal("Storage error", e),
            AppError::Database(e) => internal("Database error", e),
            AppError::Pool(e) => internal("Pool error", e),
            AppError::Internal(msg) => internal("Internal error", msg),
        };

        (status, message).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
