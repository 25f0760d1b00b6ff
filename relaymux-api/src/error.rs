use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;

/// Result type for HTTP handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Application error with HTTP status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
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

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Error body shape: `{"error": "<message>"}`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<relaymux_core::Error> for ApiError {
    fn from(err: relaymux_core::Error) -> Self {
        use relaymux_core::Error;

        match err {
            Error::Auth(e) => Self::unauthorized(e.message),
            Error::NotFound(msg) => Self::not_found(msg),
            Error::Validation(msg) => Self::bad_request(msg),
            Error::Conflict(msg) => Self::bad_request(msg),
            Error::NoStreamAvailable(path) => {
                Self::not_found(format!("no one is publishing to path '{path}'"))
            }
            Error::Transport(msg) => {
                tracing::error!("transport error: {}", msg);
                Self::internal(msg)
            }
            Error::Terminated => Self::new(StatusCode::SERVICE_UNAVAILABLE, "terminated"),
        }
    }
}
