//! Crate-wide error type and the stable REST error-code mapping from the
//! external interface contract.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Errors that can cross the API boundary.
///
/// Internal managers mostly return `anyhow::Result` or their own narrow
/// error enums; this type is what `src/api` handlers convert those into so
/// every response carries a stable `code`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("queued at position {position}")]
    Queued { position: usize },

    #[error("{0}")]
    ExecutionError(String),

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::Queued { .. } => "QUEUED",
            AppError::ExecutionError(_) => "EXECUTION_ERROR",
            AppError::Upstream { status, .. } => {
                // Leaked into a 'static str table for the common cases; falls
                // back to a generic tag for uncommon upstream codes.
                match status {
                    400 => "HTTP_400",
                    401 => "HTTP_401",
                    403 => "HTTP_403",
                    404 => "HTTP_404",
                    429 => "HTTP_429",
                    500 => "HTTP_500",
                    502 => "HTTP_502",
                    503 => "HTTP_503",
                    _ => "HTTP_UNKNOWN",
                }
            }
            AppError::Internal(_) => "EXECUTION_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Queued { .. } => StatusCode::ACCEPTED,
            AppError::ExecutionError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        if matches!(self, AppError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }
        let status = self.status();
        let code = self.code();
        let body = Json(json!({ "error": { "code": code, "message": self.to_string() } }));
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
