use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde::Serialize;
use thiserror::Error;

/// HTTP-facing error shape (§7): maps the pipeline's `AppError` taxonomy onto
/// the status codes of §6, logging internal detail server-side and handing
/// the caller only a short message.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal server error")]
    InternalError(String),
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::NotFound(msg) => Self::NotFound(msg),
            AppError::AlreadyExists(msg) => Self::Conflict(msg),
            AppError::Validation(msg)
            | AppError::InvalidQuery(msg)
            | AppError::UnsupportedType(msg) => Self::BadRequest(msg),
            AppError::ParseError { filename, cause } => {
                Self::BadRequest(format!("{filename}: {cause}"))
            }
            AppError::EmptyContent => {
                Self::BadRequest("document produced no content after parsing".to_string())
            }
            AppError::TransportError(_) | AppError::Database(_) | AppError::ObjectStore(_) => {
                tracing::error!(error = %err, "store unavailable");
                Self::ServiceUnavailable("store unavailable".to_string())
            }
            AppError::ModelError(_) | AppError::OpenAI(_) | AppError::RetrievalError(_) => {
                tracing::error!(error = %err, "model invocation failed");
                Self::InternalError("model unavailable".to_string())
            }
            AppError::SchemaMismatch(_)
            | AppError::Cancelled
            | AppError::Internal(_)
            | AppError::Io(_)
            | AppError::Config(_)
            | AppError::Join(_) => {
                tracing::error!(error = %err, "internal error");
                Self::InternalError("internal server error".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            Self::InternalError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            ),
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                status: "error".to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    error: String,
    status: String,
}
