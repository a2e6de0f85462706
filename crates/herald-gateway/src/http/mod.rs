pub mod destinations;
pub mod health;
pub mod platforms;
pub mod posts;

use axum::{http::StatusCode, Json};
use herald_store::DbError;
use serde_json::{json, Value};
use tracing::error;

pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.into()})),
    )
}

pub(crate) fn not_found(message: impl Into<String>) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({"error": message.into()})))
}

/// Map a store error to a response; internals are logged, not returned.
pub(crate) fn db_error(err: DbError) -> ApiError {
    match err {
        DbError::NotFound { .. } => not_found(err.to_string()),
        DbError::Invalid(reason) => bad_request(reason),
        other => {
            error!(error = %other, "store request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
        }
    }
}
