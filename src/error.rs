use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt::Display;

use crate::services::ServiceError;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Rejected(reason) => {
                tracing::info!(reason = %reason, "rejected input");
                AppError::bad_request(reason.to_string())
            }
            ServiceError::NotFound(message) => AppError::not_found(message),
            ServiceError::Unreadable { path, source } => {
                tracing::error!(path = %path.display(), error = %source, "unreadable data file");
                AppError::internal(format!("Error reading data file {}", path.display()))
            }
            ServiceError::LayersNotFound { path, missing } => {
                tracing::warn!(path = %path.display(), missing = ?missing, "layers missing from data file");
                AppError::new(
                    StatusCode::CONFLICT,
                    format!(
                        "Layers {} not found in {}",
                        missing.join(", "),
                        path.display()
                    ),
                )
            }
            ServiceError::Database(err) => {
                let (status, message) = map_db_error(err);
                AppError::new(status, message)
            }
            ServiceError::Internal(message) => {
                let (status, message) = internal_error(message);
                AppError::new(status, message)
            }
        }
    }
}

pub fn internal_error(err: impl Display) -> (StatusCode, String) {
    tracing::error!(error = %err, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_string(),
    )
}

pub fn map_db_error(err: sqlx::Error) -> (StatusCode, String) {
    let status = match &err {
        sqlx::Error::RowNotFound => StatusCode::NOT_FOUND,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => StatusCode::CONFLICT,    // unique_violation
            Some("23503") => StatusCode::BAD_REQUEST, // foreign_key_violation
            Some("23502") => StatusCode::BAD_REQUEST, // not_null_violation
            Some("22P02") => StatusCode::BAD_REQUEST, // invalid_text_representation
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    tracing::error!(error = %err, status = %status, "database error");

    let message = match status {
        StatusCode::NOT_FOUND => "Resource not found",
        StatusCode::CONFLICT => "Resource already exists",
        StatusCode::BAD_REQUEST => "Invalid request",
        _ => "Database error",
    };

    (status, message.to_string())
}
