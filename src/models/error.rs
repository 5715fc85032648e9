//! Application error with kind tags mapped to HTTP statuses at the boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Bad user input. Surfaces as 400, never retried.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Entity missing. Surfaces as 404.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Store or upstream temporarily unavailable. Surfaces as 5xx so the
    /// caller (GitLab webhook retry, next scheduler tick) retries delivery.
    #[error("dependency unavailable: {0}")]
    Transient(String),

    /// Uniqueness conflict on an insert that should have been an upsert.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Database(#[from] diesel::result::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// HTTP status for this error kind.
    pub fn status(&self) -> StatusCode {
        use diesel::result::{DatabaseErrorKind, Error as DieselError};
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Invariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Database(DieselError::NotFound) => StatusCode::NOT_FOUND,
            AppError::Database(DieselError::DatabaseError(
                DatabaseErrorKind::UniqueViolation,
                _,
            )) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Database(_) | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short kind tag used for logs and error counters.
    pub fn kind(&self) -> &'static str {
        use diesel::result::Error as DieselError;
        match self {
            AppError::Validation(_) => "validation",
            AppError::NotFound(_) | AppError::Database(DieselError::NotFound) => "not_found",
            AppError::Transient(_) => "transient",
            AppError::Invariant(_) => "invariant",
            AppError::Database(_) => "database",
            AppError::Other(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "request failed");
        } else {
            tracing::debug!(kind = self.kind(), error = %self, "request rejected");
        }
        crate::metrics::error_recorded(self.kind());
        (status, self.to_string()).into_response()
    }
}

impl From<diesel_async::pooled_connection::bb8::RunError> for AppError {
    fn from(e: diesel_async::pooled_connection::bb8::RunError) -> Self {
        AppError::Transient(format!("connection pool: {e}"))
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Transient(format!("redis: {e}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Transient(format!("http: {e}"))
    }
}
