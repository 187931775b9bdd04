//! Error taxonomy for the store gateway and the HTTP handlers.
//!
//! Validation errors are user-correctable and name the offending field.
//! Store errors are logged with their cause and reported generically.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field(s): {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("{field} {value} out of range {range}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        range: &'static str,
    },

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{op} failed: {source}")]
    Query {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("{op} timed out after {}ms", .after.as_millis())]
    Timeout { op: &'static str, after: Duration },
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Validation(e) => {
                warn!("rejected request: {e}");
                (StatusCode::BAD_REQUEST, "validation_error", e.to_string())
            }
            ApiError::Store(StoreError::Timeout { op, after }) => {
                error!(
                    op,
                    after_ms = after.as_millis() as u64,
                    kind = "timeout",
                    "store call timed out"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_error",
                    "storage unavailable, try again later".to_string(),
                )
            }
            ApiError::Store(StoreError::Query { op, source }) => {
                error!(op, kind = "query", "store call failed: {source}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_error",
                    "storage unavailable, try again later".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
