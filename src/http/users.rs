//! `GET /users/{handle}`, `POST`/`DELETE /users/{handle}/follow` (spec §6).
//! A `handle` containing `@` is routed through pull-federation (C9); a bare
//! handle is looked up locally.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::db::models::User;
use crate::error::NodeError;
use crate::pull;
use crate::signed_action::{self, SignedAction};
use crate::state::AppState;

pub async fn get_user(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, NodeError> {
    if let Some((local_part, domain)) = handle.split_once('@') {
        let user = pull::pull_profile(&state, local_part, domain, 20).await?;
        return Ok(Json(user));
    }
    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE handle = ?")
        .bind(&handle)
        .fetch_optional(&state.pool)
        .await?;
    let user = user.ok_or_else(|| NodeError::NotFound("user not found".into()))?;
    Ok(Json(user))
}

async fn resolve_followee_key(state: &AppState, handle: &str) -> Result<String, NodeError> {
    if let Some((local_part, domain)) = handle.split_once('@') {
        let user = pull::pull_profile(state, local_part, domain, 0).await?;
        Ok(user.did)
    } else {
        let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE handle = ?")
            .bind(handle)
            .fetch_optional(&state.pool)
            .await?;
        let user = user.ok_or_else(|| NodeError::NotFound("user not found".into()))?;
        Ok(user.did)
    }
}

pub async fn follow(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Json(envelope): Json<SignedAction>,
) -> Result<impl IntoResponse, NodeError> {
    let user = signed_action::verify_user_action(&state.pool, &state.rate_limiter, &envelope).await?;
    let followee_did = resolve_followee_key(&state, &handle).await?;

    sqlx::query("INSERT OR IGNORE INTO follows (id, follower_id, followee, created_at) VALUES (?, ?, ?, ?)")
        .bind(Uuid::new_v4().to_string())
        .bind(&user.id)
        .bind(&followee_did)
        .bind(Utc::now())
        .execute(&state.pool)
        .await?;

    if handle.contains('@') {
        sqlx::query("INSERT OR IGNORE INTO remote_follows (id, local_user_id, remote_handle, created_at) VALUES (?, ?, ?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(&user.id)
            .bind(&handle)
            .bind(Utc::now())
            .execute(&state.pool)
            .await?;
    }

    Ok(Json(json!({ "ok": true })))
}

pub async fn unfollow(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Json(envelope): Json<SignedAction>,
) -> Result<impl IntoResponse, NodeError> {
    let user = signed_action::verify_user_action(&state.pool, &state.rate_limiter, &envelope).await?;
    let followee_did = resolve_followee_key(&state, &handle).await?;

    sqlx::query("DELETE FROM follows WHERE follower_id = ? AND followee = ?")
        .bind(&user.id)
        .bind(&followee_did)
        .execute(&state.pool)
        .await?;
    sqlx::query("DELETE FROM remote_follows WHERE local_user_id = ? AND remote_handle = ?")
        .bind(&user.id)
        .bind(&handle)
        .execute(&state.pool)
        .await?;

    Ok(Json(json!({ "ok": true })))
}
