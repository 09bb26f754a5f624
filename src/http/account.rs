//! `POST /account/export` (spec §6) — out-of-scope per spec §1 as an
//! "import/export packaging" external collaborator, but the endpoint itself
//! is part of the public surface §6 names, so it is wired here as a thin
//! shell that hands back the caller's own rows (no media bundling, no
//! background export job).

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::db::models::Post;
use crate::error::NodeError;
use crate::http::session;
use crate::state::AppState;

pub async fn export(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, NodeError> {
    let user = session::authenticate(&state.pool, &headers).await?;
    let posts: Vec<Post> = sqlx::query_as("SELECT * FROM posts WHERE user_id = ? ORDER BY created_at ASC")
        .bind(&user.id)
        .fetch_all(&state.pool)
        .await?;
    Ok(Json(json!({
        "user": { "handle": user.handle, "did": user.did, "createdAt": user.created_at },
        "posts": posts,
    })))
}
