use axum::{extract::State, http::StatusCode, Json};
use herald_core::types::NewPost;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::{
    app::AppState,
    http::{bad_request, db_error, ApiError},
};

const TITLE_MIN: usize = 3;
const TITLE_MAX: usize = 255;

fn validate(post: &NewPost) -> Result<(), ApiError> {
    let title_len = post.title.trim().chars().count();
    if !(TITLE_MIN..=TITLE_MAX).contains(&title_len) {
        return Err(bad_request(format!(
            "title must be between {TITLE_MIN} and {TITLE_MAX} characters"
        )));
    }
    if post.content.trim().is_empty() {
        return Err(bad_request("content is required"));
    }
    if post.user_id <= 0 {
        return Err(bad_request("user_id must be positive"));
    }
    Ok(())
}

/// POST /posts: create a post; with `scheduled_for` and `platform_ids` it is
/// scheduled on each platform, otherwise it is kept as a draft.
pub async fn create_post(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewPost>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    validate(&body)?;
    let (post, destinations) = state.store.create_post(&body).map_err(db_error)?;
    info!(post_id = post.id, destinations = destinations.len(), "post created via http");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "post": post, "destinations": destinations })),
    ))
}

/// GET /posts: every post grouped by status.
pub async fn list_posts(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let groups = state.store.list_posts().map_err(db_error)?;
    Ok(Json(json!(groups)))
}
