use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No filings found for {0}")]
    NoFilingsFound(String),

    #[error("Provider failure: {0}")]
    ProviderFailure(String),

    #[error("Pipeline state corrupt: {0}")]
    StateCorrupt(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Operation cancelled")]
    Cancelled,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Unauthorized(msg) => {
                tracing::warn!("Unauthorized: {}", msg);
                (StatusCode::UNAUTHORIZED, "Unauthorized", msg)
            }
            ApiError::NotFound(msg) => {
                tracing::warn!("Not found: {}", msg);
                (StatusCode::NOT_FOUND, "NotFound", msg)
            }
            ApiError::Validation(msg) => {
                tracing::warn!("Validation error: {}", msg);
                (StatusCode::BAD_REQUEST, "ValidationError", msg)
            }
            ApiError::NoFilingsFound(msg) => {
                tracing::warn!("No filings found: {}", msg);
                (StatusCode::NOT_FOUND, "NoFilingsFound", msg)
            }
            ApiError::ProviderFailure(msg) => {
                tracing::error!("Provider failure: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "ProviderFailure", msg)
            }
            ApiError::StateCorrupt(msg) => {
                tracing::error!("Pipeline state corrupt: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "StateCorrupt", msg)
            }
            ApiError::QueryFailed(msg) => {
                tracing::error!("Query failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "QueryFailed", msg)
            }
            ApiError::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError", msg)
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError", msg)
            }
            ApiError::Cancelled => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Cancelled",
                "request cancelled".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}
