//! `POST /auth/register`, `POST /auth/login`, `POST /auth/logout` (spec §6).

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::error::NodeError;
use crate::http::session;
use crate::identity::{self, RegisterInput};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub handle: String,
    pub email: String,
    pub password: String,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, NodeError> {
    let user = identity::register(
        &state.pool,
        RegisterInput {
            handle: req.handle,
            email: req.email,
            password: req.password,
            display_name: req.display_name,
        },
    )
    .await?;
    let token = session::create_session(&state.pool, &user.id).await?;
    let (name, value) = session::set_cookie_header(&token);
    Ok((
        [(name, value)],
        Json(json!({ "user": { "id": user.id, "handle": user.handle, "did": user.did } })),
    ))
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, NodeError> {
    let user = identity::authenticate(&state.pool, &req.email, &req.password).await?;
    let token = session::create_session(&state.pool, &user.id).await?;
    let (name, value) = session::set_cookie_header(&token);
    Ok((
        [(name, value)],
        Json(json!({ "user": { "id": user.id, "handle": user.handle, "did": user.did } })),
    ))
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, NodeError> {
    if let Some(raw) = headers.get(axum::http::header::COOKIE).and_then(|v| v.to_str().ok()) {
        if let Some(token) = raw
            .split(';')
            .find_map(|p| p.trim().strip_prefix("session=").map(str::to_string))
        {
            session::destroy_session(&state.pool, &token).await?;
        }
    }
    Ok(Json(json!({ "ok": true })))
}
