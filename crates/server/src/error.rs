//! The error taxonomy surfaced to HTTP/MQTT clients.
//!
//! Adapters and services return `anyhow::Result<T>` for anything that is
//! just propagated-with-context; at the ingress seam, errors are mapped
//! into `AppError`, which renders the structured `{error, message,
//! timestamp, path, request_id}` envelope and never leaks internals.

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("authentication failed")]
    AuthFailed,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("name already registered")]
    Conflict { existing_id: i64 },

    #[error("rate limited")]
    RateLimited { limit: u32, remaining: u32, reset_at: i64 },

    #[error("partial write")]
    PartialWrite { rejected: Vec<String> },

    #[error("time-series store unavailable")]
    StoreUnavailable,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "ValidationError",
            AppError::AuthRequired => "AuthRequired",
            AppError::AuthFailed => "AuthFailed",
            AppError::NotFound(_) => "NotFound",
            AppError::Conflict { .. } => "Conflict",
            AppError::RateLimited { .. } => "RateLimited",
            AppError::PartialWrite { .. } => "PartialWrite",
            AppError::StoreUnavailable => "StoreUnavailable",
            AppError::Internal(_) => "Internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::AuthRequired => StatusCode::UNAUTHORIZED,
            AppError::AuthFailed => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::PartialWrite { .. } => StatusCode::from_u16(207).unwrap(),
            AppError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message — never the `Display` of an internal error,
    /// which might carry adapter-specific detail.
    fn message(&self) -> String {
        match self {
            AppError::Internal(_) => "an internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    path: String,
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    existing_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rejected: Option<Vec<String>>,
}

/// Render an `AppError` into a response, given the request path and the
/// per-request tracing id attached by the middleware stack.
pub fn render(err: &AppError, path: &str, request_id: &str) -> Response {
    let status = err.status();
    let (existing_id, rejected) = match err {
        AppError::Conflict { existing_id } => (Some(*existing_id), None),
        AppError::PartialWrite { rejected } => (None, Some(rejected.clone())),
        _ => (None, None),
    };

    let mut response = (
        status,
        Json(ErrorBody {
            error: err.kind(),
            message: err.message(),
            timestamp: chrono::Utc::now(),
            path: path.to_string(),
            request_id: request_id.to_string(),
            existing_id,
            rejected,
        }),
    )
        .into_response();

    if let AppError::RateLimited { limit, remaining, reset_at } = err {
        let headers = response.headers_mut();
        headers.insert("X-RateLimit-Limit", (*limit).into());
        headers.insert("X-RateLimit-Remaining", (*remaining).into());
        headers.insert("X-RateLimit-Reset", (*reset_at).into());
    }

    response
}

/// Fallback `IntoResponse` for handlers that don't have access to the
/// request path/id (e.g. extractor rejections, `?`-propagated handler
/// errors) — the middleware-aware `render` above is preferred everywhere
/// a `Request` is in scope. Still recovers the request id from the
/// per-request task-local the `request_id` layer populates, so the
/// envelope's `request_id` field isn't empty just because this path
/// doesn't have the `Request` itself.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = crate::middleware::CURRENT_REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default();
        render(&self, "", &request_id)
    }
}

/// Pull the path back out of a request for error rendering in handlers
/// that receive the full `Request`.
pub fn path_of(req: &Request) -> String {
    req.uri().path().to_string()
}

pub type AppResult<T> = Result<T, AppError>;
