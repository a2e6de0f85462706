use axum::{
    extract::{Path, State},
    Json,
};
use herald_core::types::DestinationId;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::{
    app::AppState,
    http::{db_error, not_found, ApiError},
};

/// GET /destinations/{id}: delivery status and per-channel attempts.
pub async fn get_destination(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DestinationId>,
) -> Result<Json<Value>, ApiError> {
    let destination = state
        .store
        .destination(id)
        .map_err(db_error)?
        .ok_or_else(|| not_found(format!("destination not found: {id}")))?;
    let attempts = state.store.attempts(id).map_err(db_error)?;
    Ok(Json(json!({ "destination": destination, "attempts": attempts })))
}
