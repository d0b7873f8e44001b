use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::utils::content::ContentError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token is scoped to pod '{token_pod}' but the request targets '{host_pod}'")]
    PodMismatch {
        token_pod: String,
        host_pod: String,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Pod not found: {0}")]
    PodNotFound(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Pod already exists: {0}")]
    PodExists(String),

    #[error("Stream already exists: {0}")]
    StreamAlreadyExists(String),

    #[error("Name already exists: {0}")]
    NameExists(String),

    #[error("Name conflict: {0}")]
    NameConflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid pod name: {0}")]
    InvalidPodId(String),

    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    #[error("Invalid content: {0}")]
    InvalidContent(String),

    #[error("Content size {size} exceeds maximum {max}")]
    ContentTooLarge { size: usize, max: usize },

    #[error("Schema validation failed: {0}")]
    ValidationError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded { limit: u32, reset: i64 },

    #[error("Internal server error")]
    Internal,

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl ApiError {
    /// Wire code carried in the response body's `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::InvalidToken(_) => "INVALID_TOKEN",
            ApiError::TokenExpired => "TOKEN_EXPIRED",
            ApiError::PodMismatch { .. } => "POD_MISMATCH",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::PodNotFound(_) => "POD_NOT_FOUND",
            ApiError::StreamNotFound(_) => "STREAM_NOT_FOUND",
            ApiError::RecordNotFound(_) => "RECORD_NOT_FOUND",
            ApiError::PodExists(_) => "POD_EXISTS",
            ApiError::StreamAlreadyExists(_) => "STREAM_ALREADY_EXISTS",
            ApiError::NameExists(_) => "NAME_EXISTS",
            ApiError::NameConflict(_) => "NAME_CONFLICT",
            ApiError::InvalidInput(_) => "INVALID_INPUT",
            ApiError::InvalidName(_) => "INVALID_NAME",
            ApiError::InvalidPodId(_) => "INVALID_POD_ID",
            ApiError::InvalidIndex(_) => "INVALID_INDEX",
            ApiError::InvalidContent(_) => "INVALID_CONTENT",
            ApiError::ContentTooLarge { .. } => "CONTENT_TOO_LARGE",
            ApiError::ValidationError(_) => "VALIDATION_ERROR",
            ApiError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            ApiError::Internal => "INTERNAL_ERROR",
            ApiError::Database(_) => "DATABASE_ERROR",
            ApiError::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized | ApiError::InvalidToken(_) | ApiError::TokenExpired => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::PodMismatch { .. } | ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_)
            | ApiError::PodNotFound(_)
            | ApiError::StreamNotFound(_)
            | ApiError::RecordNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PodExists(_)
            | ApiError::StreamAlreadyExists(_)
            | ApiError::NameExists(_)
            | ApiError::NameConflict(_) => StatusCode::CONFLICT,
            ApiError::InvalidInput(_)
            | ApiError::InvalidName(_)
            | ApiError::InvalidPodId(_)
            | ApiError::InvalidIndex(_)
            | ApiError::InvalidContent(_)
            | ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::ContentTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal | ApiError::Database(_) | ApiError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Log full details server-side for 5xx classes. Database errors may
        // contain constraint and table names; NEVER expose these to the
        // client (CWE-209).
        let message = match &self {
            ApiError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                "A database error occurred. Please try again later.".to_string()
            }
            ApiError::Storage(e) => {
                tracing::error!("Storage error: {}", e);
                "A storage error occurred. Please try again later.".to_string()
            }
            ApiError::Internal => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            error: self.code().to_string(),
            message,
        });

        if let ApiError::RateLimitExceeded { limit, reset } = &self {
            let headers = [
                ("x-ratelimit-limit", limit.to_string()),
                ("x-ratelimit-remaining", "0".to_string()),
                ("x-ratelimit-reset", reset.to_string()),
            ];
            return (self.status(), headers, body).into_response();
        }

        (self.status(), body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        // Unique-constraint violations are user-facing conflicts; the
        // details stay server-side (CWE-209).
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some("23505") {
                tracing::debug!("unique-constraint violation: {:?}", db_err);
                return ApiError::NameExists(
                    "a record with that value already exists".to_string(),
                );
            }
        }
        ApiError::Database(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Unexpected error: {:?}", err);
        ApiError::Internal
    }
}

impl From<ContentError> for ApiError {
    fn from(err: ContentError) -> Self {
        match err {
            ContentError::TooLarge { size, max } => ApiError::ContentTooLarge { size, max },
            other => ApiError::InvalidContent(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Storage(err.to_string())
    }
}
