//! `GET /notifications`, `PATCH /notifications` (spec §6).

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::db::models::Notification;
use crate::error::NodeError;
use crate::http::session;
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, NodeError> {
    let user = session::authenticate(&state.pool, &headers).await?;
    let notifications: Vec<Notification> = sqlx::query_as(
        "SELECT * FROM notifications WHERE user_id = ? ORDER BY created_at DESC LIMIT 100",
    )
    .bind(&user.id)
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(json!({ "notifications": notifications })))
}

pub async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, NodeError> {
    let user = session::authenticate(&state.pool, &headers).await?;
    sqlx::query("UPDATE notifications SET is_read = 1 WHERE user_id = ? AND is_read = 0")
        .bind(&user.id)
        .execute(&state.pool)
        .await?;
    Ok(Json(json!({ "ok": true })))
}
