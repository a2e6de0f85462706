use axum::{extract::State, http::StatusCode, Json};
use herald_core::types::NewPlatform;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::{
    app::AppState,
    http::{bad_request, db_error, ApiError},
};

/// POST /platforms: register a platform account and its channel credentials.
pub async fn create_platform(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewPlatform>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.user_id <= 0 {
        return Err(bad_request("user_id must be positive"));
    }
    if body.name.trim().is_empty() {
        return Err(bad_request("platform name is required"));
    }
    if body.credentials.keys().any(|channel| channel.trim().is_empty()) {
        return Err(bad_request("channel ids must not be empty"));
    }

    let platform = state.store.create_platform(&body).map_err(db_error)?;
    info!(platform_id = platform.id, user_id = platform.user_id, "platform created via http");
    // Tokens stay server-side; only channel ids are echoed back.
    let channels: Vec<&String> = platform.credentials.keys().collect();
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": platform.id,
            "user_id": platform.user_id,
            "name": platform.name,
            "channels": channels,
            "is_active": platform.is_active,
        })),
    ))
}
