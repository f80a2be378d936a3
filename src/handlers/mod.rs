// ---------------------------------------------------------------------------
// handlers/: chat streaming, health, and the shared API error type
// ---------------------------------------------------------------------------

// Sub-modules are pub(crate) so utoipa __path_* types are accessible from lib.rs OpenApi derive.
pub(crate) mod chat;
pub(crate) mod system;

pub use chat::{chat, MODEL_HEADER, MODEL_NAME_HEADER};
pub use system::{health, readiness};

// ── utoipa __path_* re-exports ───────────────────────────────────────────────
// The #[utoipa::path] attribute macro generates private structs like __path_health.
// The OpenApi derive in lib.rs expects them at `handlers::__path_health`, so we
// re-export them here.
pub use chat::__path_chat;
pub use system::{__path_health, __path_readiness};

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Centralized API error type for all handlers.
/// Logs full details server-side, returns sanitized JSON to the client.
///
/// Response format:
/// ```json
/// {
///   "error": {
///     "code": "BAD_REQUEST",
///     "message": "Human-readable description",
///     "request_id": "uuid",
///     "details": { ... }       // null when absent
///   }
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    /// Machine-readable error code string for each variant.
    fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Internal(_) => "INTERNAL_ERROR",
            ApiError::Unavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Sanitized message safe to return to clients. Internal errors never
    /// leak their cause.
    fn sanitized_message(&self) -> String {
        match self {
            ApiError::BadRequest(m) => m.clone(),
            ApiError::Internal(_) => "Internal server error".to_string(),
            ApiError::Unavailable(m) => m.clone(),
        }
    }

    /// Attach structured details, e.g. `ApiError::Unavailable(..).with_details(json!({..}))`.
    pub fn with_details(self, details: Value) -> ApiErrorWithDetails {
        ApiErrorWithDetails {
            error: self,
            details: Some(details),
        }
    }

    fn render(&self, details: Option<Value>) -> axum::response::Response {
        use axum::response::IntoResponse;

        let status = self.status_code();
        let request_id = Uuid::new_v4().to_string();

        tracing::error!(
            request_id = %request_id,
            code = self.error_code(),
            "API error ({}): {}",
            status.as_u16(),
            self
        );

        let body = json!({
            "error": {
                "code": self.error_code(),
                "message": self.sanitized_message(),
                "request_id": request_id,
                "details": details,
            }
        });
        (status, Json(body)).into_response()
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        self.render(None)
    }
}

/// ApiError with optional structured details attached.
pub struct ApiErrorWithDetails {
    pub error: ApiError,
    pub details: Option<Value>,
}

impl From<ApiError> for ApiErrorWithDetails {
    fn from(error: ApiError) -> Self {
        Self { error, details: None }
    }
}

impl axum::response::IntoResponse for ApiErrorWithDetails {
    fn into_response(self) -> axum::response::Response {
        self.error.render(self.details)
    }
}
