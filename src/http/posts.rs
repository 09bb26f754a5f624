//! `POST /posts`, `GET /posts`, and the like/repost interaction endpoints
//! (spec §6). Mutating routes accept a session cookie plus a `SignedAction`
//! body and flow through the C3 verifier before any side effect, per
//! spec §4.3/§5.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::db::models::Post;
use crate::delivery::{self, Verb};
use crate::error::NodeError;
use crate::http::feed;
use crate::http::session;
use crate::signed_action::{self, SignedAction};
use crate::state::AppState;

pub async fn create_post(
    State(state): State<AppState>,
    Json(envelope): Json<SignedAction>,
) -> Result<impl IntoResponse, NodeError> {
    let user = signed_action::verify_user_action(&state.pool, &state.rate_limiter, &envelope).await?;

    let content = envelope
        .data
        .get("content")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NodeError::Validation("missing content".into()))?;
    if content.is_empty() || content.chars().count() > 400 {
        return Err(NodeError::Validation("content must be 1-400 characters".into()));
    }
    let reply_to_id = envelope.data.get("replyToId").and_then(|v| v.as_str());
    let repost_of_id = envelope.data.get("repostOfId").and_then(|v| v.as_str());

    if let Some(repost_of) = repost_of_id {
        let target: Option<Post> = sqlx::query_as("SELECT * FROM posts WHERE id = ?")
            .bind(repost_of)
            .fetch_optional(&state.pool)
            .await?;
        let target = target.ok_or_else(|| NodeError::NotFound("repost target not found".into()))?;
        if target.repost_of_id.is_some() {
            return Err(NodeError::Validation(
                "cannot repost a repost".into(),
            ));
        }
    }

    let id = Uuid::new_v4().to_string();
    let ap_id = format!("https://{}/posts/{}", state.config.node_domain, id);
    let now = Utc::now();

    sqlx::query(
        r#"INSERT INTO posts (id, user_id, content, reply_to_id, repost_of_id, ap_id, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(&user.id)
    .bind(content)
    .bind(reply_to_id)
    .bind(repost_of_id)
    .bind(&ap_id)
    .bind(now)
    .execute(&state.pool)
    .await?;

    if let Some(parent_id) = reply_to_id {
        if let Some(parent) = sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE id = ?")
            .bind(parent_id)
            .fetch_optional(&state.pool)
            .await?
        {
            delivery::deliver_interaction(&state, &parent, Verb::Reply, &envelope).await?;
        }
    }

    let post: Post = sqlx::query_as("SELECT * FROM posts WHERE id = ?")
        .bind(&id)
        .fetch_one(&state.pool)
        .await?;
    Ok(Json(post))
}

#[derive(Deserialize)]
pub struct ListPostsQuery {
    #[serde(rename = "type")]
    pub feed_type: Option<String>,
    pub handle: Option<String>,
}

pub async fn list_posts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListPostsQuery>,
) -> Result<impl IntoResponse, NodeError> {
    let feed_type = query.feed_type.as_deref().unwrap_or("public");

    let posts = match feed_type {
        "public" => {
            sqlx::query_as::<_, Post>(
                "SELECT p.* FROM posts p JOIN users u ON u.id = p.user_id WHERE p.is_removed = 0 AND u.is_remote = 0 ORDER BY p.created_at DESC LIMIT 50",
            )
            .fetch_all(&state.pool)
            .await?
        }
        "swarm" => {
            sqlx::query_as::<_, Post>(
                "SELECT p.* FROM posts p JOIN users u ON u.id = p.user_id WHERE p.is_removed = 0 AND u.is_remote = 1 ORDER BY p.created_at DESC LIMIT 50",
            )
            .fetch_all(&state.pool)
            .await?
        }
        "user" => {
            let handle = query
                .handle
                .ok_or_else(|| NodeError::Validation("missing handle".into()))?;
            sqlx::query_as::<_, Post>(
                "SELECT p.* FROM posts p JOIN users u ON u.id = p.user_id WHERE p.is_removed = 0 AND u.handle = ? ORDER BY p.created_at DESC LIMIT 50",
            )
            .bind(&handle)
            .fetch_all(&state.pool)
            .await?
        }
        "home" => {
            let viewer = session::authenticate(&state.pool, &headers).await?;
            sqlx::query_as::<_, Post>(
                r#"SELECT p.* FROM posts p
                   JOIN users u ON u.id = p.user_id
                   WHERE p.is_removed = 0
                     AND (p.user_id = ?
                          OR EXISTS (SELECT 1 FROM follows f WHERE f.follower_id = ? AND f.followee = u.did))
                   ORDER BY p.created_at DESC LIMIT 50"#,
            )
            .bind(&viewer.id)
            .bind(&viewer.id)
            .fetch_all(&state.pool)
            .await?
        }
        "curated" => {
            let viewer = session::authenticate(&state.pool, &headers).await?;
            let cutoff = Utc::now() - chrono::Duration::hours(72);
            let candidates: Vec<Post> = sqlx::query_as(
                "SELECT * FROM posts WHERE is_removed = 0 AND created_at > ? ORDER BY created_at DESC LIMIT 200",
            )
            .bind(cutoff)
            .fetch_all(&state.pool)
            .await?;

            let mut tagged = Vec::with_capacity(candidates.len());
            for post in candidates {
                let is_self = post.user_id == viewer.id;
                let follow: Option<(String,)> = sqlx::query_as(
                    "SELECT f.id FROM follows f JOIN users u ON u.did = f.followee WHERE f.follower_id = ? AND u.id = ?",
                )
                .bind(&viewer.id)
                .bind(&post.user_id)
                .fetch_optional(&state.pool)
                .await?;
                tagged.push((post, follow.is_some(), is_self));
            }
            feed::rank(tagged).into_iter().take(50).collect()
        }
        other => return Err(NodeError::Validation(format!("unknown feed type {other}"))),
    };

    Ok(Json(json!({ "posts": posts })))
}

async fn load_post(state: &AppState, id: &str) -> Result<Post, NodeError> {
    sqlx::query_as("SELECT * FROM posts WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| NodeError::NotFound("post not found".into()))
}

async fn interact(
    state: AppState,
    post_id: String,
    verb: Verb,
    envelope: SignedAction,
) -> Result<impl IntoResponse, NodeError> {
    let user = signed_action::verify_user_action(&state.pool, &state.rate_limiter, &envelope).await?;
    let post = load_post(&state, &post_id).await?;

    match verb {
        Verb::Like => {
            sqlx::query("INSERT OR IGNORE INTO likes (id, user_id, post_id, created_at) VALUES (?, ?, ?, ?)")
                .bind(Uuid::new_v4().to_string())
                .bind(&user.id)
                .bind(&post.id)
                .bind(Utc::now())
                .execute(&state.pool)
                .await?;
        }
        Verb::Unlike => {
            sqlx::query("DELETE FROM likes WHERE user_id = ? AND post_id = ?")
                .bind(&user.id)
                .bind(&post.id)
                .execute(&state.pool)
                .await?;
        }
        Verb::Repost => {
            sqlx::query("INSERT OR IGNORE INTO reposts (id, user_id, post_id, created_at) VALUES (?, ?, ?, ?)")
                .bind(Uuid::new_v4().to_string())
                .bind(&user.id)
                .bind(&post.id)
                .bind(Utc::now())
                .execute(&state.pool)
                .await?;
        }
        Verb::Unrepost => {
            sqlx::query("DELETE FROM reposts WHERE user_id = ? AND post_id = ?")
                .bind(&user.id)
                .bind(&post.id)
                .execute(&state.pool)
                .await?;
        }
        Verb::Reply => {}
    }

    delivery::deliver_interaction(&state, &post, verb, &envelope).await?;
    let refreshed = load_post(&state, &post_id).await?;
    Ok(Json(refreshed))
}

pub async fn like(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(envelope): Json<SignedAction>,
) -> Result<impl IntoResponse, NodeError> {
    interact(state, id, Verb::Like, envelope).await
}

pub async fn unlike(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(envelope): Json<SignedAction>,
) -> Result<impl IntoResponse, NodeError> {
    interact(state, id, Verb::Unlike, envelope).await
}

pub async fn repost(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(envelope): Json<SignedAction>,
) -> Result<impl IntoResponse, NodeError> {
    interact(state, id, Verb::Repost, envelope).await
}

pub async fn unrepost(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(envelope): Json<SignedAction>,
) -> Result<impl IntoResponse, NodeError> {
    interact(state, id, Verb::Unrepost, envelope).await
}
