//! Session cookie plumbing shared by every authenticated handler. Grounded
//! in the teacher's "opaque token bound to a connection" idiom
//! (`umbra-relay`'s per-socket session ids), here backed by the `sessions`
//! table (spec §3 Session) instead of an in-memory connection map since
//! sessions must survive across independent HTTP requests.

use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{Session, User};
use crate::error::NodeError;

const SESSION_COOKIE: &str = "session";
const SESSION_TTL: Duration = Duration::hours(24 * 30);

pub async fn create_session(pool: &SqlitePool, user_id: &str) -> Result<String, NodeError> {
    let token = Uuid::new_v4().to_string();
    let now = Utc::now();
    sqlx::query("INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(&token)
        .bind(user_id)
        .bind(now)
        .bind(now + SESSION_TTL)
        .execute(pool)
        .await?;
    Ok(token)
}

pub async fn destroy_session(pool: &SqlitePool, token: &str) -> Result<(), NodeError> {
    sqlx::query("DELETE FROM sessions WHERE token = ?")
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

pub fn set_cookie_header(token: &str) -> (axum::http::HeaderName, String) {
    (
        axum::http::header::SET_COOKIE,
        format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax"),
    )
}

/// Resolves the session cookie in `headers` to its owning user, rejecting
/// `AUTH_REQUIRED` when absent, malformed, or expired.
pub async fn authenticate(pool: &SqlitePool, headers: &HeaderMap) -> Result<User, NodeError> {
    let token = extract_token(headers).ok_or(NodeError::AuthRequired)?;
    let session: Option<Session> = sqlx::query_as("SELECT * FROM sessions WHERE token = ?")
        .bind(&token)
        .fetch_optional(pool)
        .await?;
    let session = session.ok_or(NodeError::AuthRequired)?;
    if session.expires_at < Utc::now() {
        return Err(NodeError::AuthRequired);
    }
    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&session.user_id)
        .fetch_optional(pool)
        .await?;
    user.ok_or(NodeError::AuthRequired)
}
