//! Pull federation (C9, spec §4.9): fetches remote user profiles and posts
//! on demand and caches them locally with synthetic DIDs/apIds, used to
//! hydrate the home timeline. Grounded in the teacher's `federation.rs`
//! request/response idiom, re-expressed as plain `reqwest` GETs against the
//! public `/swarm/users/{handle}` surface rather than a mesh RPC.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::User;
use crate::error::NodeError;
use crate::node_signature;
use crate::state::AppState;

#[derive(Serialize, Deserialize)]
pub struct RemoteProfile {
    pub handle: String,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
    pub bio: Option<String>,
    #[serde(rename = "avatarUrl")]
    pub avatar_url: Option<String>,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "chatPublicKey")]
    pub chat_public_key: Option<String>,
    #[serde(rename = "isBot")]
    pub is_bot: bool,
    #[serde(rename = "dmPrivacy")]
    pub dm_privacy: String,
    pub posts: Vec<RemotePost>,
}

#[derive(Serialize, Deserialize)]
pub struct RemotePost {
    pub id: String,
    pub content: String,
    #[serde(rename = "replyToId")]
    pub reply_to_id: Option<String>,
    #[serde(rename = "repostOfId")]
    pub repost_of_id: Option<String>,
    #[serde(rename = "likesCount")]
    pub likes_count: i64,
    #[serde(rename = "repostsCount")]
    pub reposts_count: i64,
    #[serde(rename = "repliesCount")]
    pub replies_count: i64,
    #[serde(rename = "createdAt")]
    pub created_at: chrono::DateTime<Utc>,
}

/// Splits `handle@domain` into its parts, rejecting malformed input.
pub fn split_remote_handle(full: &str) -> Result<(String, String), NodeError> {
    let (local, domain) = full
        .split_once('@')
        .ok_or_else(|| NodeError::Validation("expected handle@domain".into()))?;
    if local.is_empty() || domain.is_empty() {
        return Err(NodeError::Validation("expected handle@domain".into()));
    }
    Ok((local.to_string(), domain.to_string()))
}

pub fn synthetic_did(domain: &str, local_part: &str) -> String {
    format!("did:swarm:{domain}:{local_part}")
}

pub fn synthetic_ap_id(domain: &str, post_id: &str) -> String {
    format!("swarm:{domain}:{post_id}")
}

/// Pulls and caches a remote profile + recent posts (spec §4.9). Rejects
/// domains that are not in the local swarm registry — "non-swarm domains
/// are rejected."
pub async fn pull_profile(
    state: &AppState,
    local_part: &str,
    domain: &str,
    limit: u32,
) -> Result<User, NodeError> {
    if !node_signature::is_known_node(&state.pool, domain).await? {
        return Err(NodeError::Forbidden(format!("{domain} is not a known swarm node")));
    }

    let url = format!("https://{domain}/swarm/users/{local_part}?limit={limit}");
    let response = state
        .http_client
        .get(&url)
        .timeout(std::time::Duration::from_secs(
            state.config.profile_refresh_timeout_secs,
        ))
        .send()
        .await;

    let profile: RemoteProfile = match response {
        Ok(resp) if resp.status().is_success() => resp
            .json()
            .await
            .map_err(|e| NodeError::UpstreamUnreachable(e.to_string()))?,
        Ok(resp) => {
            node_signature::mark_node_failure(&state.pool, domain).await?;
            return Err(NodeError::UpstreamUnreachable(format!(
                "remote returned {}",
                resp.status()
            )));
        }
        Err(e) => {
            node_signature::mark_node_failure(&state.pool, domain).await?;
            return Err(NodeError::UpstreamUnreachable(e.to_string()));
        }
    };
    node_signature::mark_node_success(&state.pool, domain).await?;

    let cached = upsert_cached_user(&state.pool, domain, local_part, &profile).await?;
    for post in &profile.posts {
        upsert_cached_post(&state.pool, domain, &cached.id, post).await?;
    }
    Ok(cached)
}

async fn upsert_cached_user(
    pool: &SqlitePool,
    domain: &str,
    local_part: &str,
    profile: &RemoteProfile,
) -> Result<User, NodeError> {
    let did = synthetic_did(domain, local_part);
    let existing: Option<User> = sqlx::query_as("SELECT * FROM users WHERE did = ?")
        .bind(&did)
        .fetch_optional(pool)
        .await?;

    let id = existing
        .as_ref()
        .map(|u| u.id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = Utc::now();

    sqlx::query(
        r#"INSERT INTO users
           (id, did, handle, public_key, chat_public_key, display_name, bio, avatar_url,
            dm_privacy, is_bot, is_remote, node_domain, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
           ON CONFLICT (did) DO UPDATE SET
             public_key = excluded.public_key,
             chat_public_key = excluded.chat_public_key,
             display_name = excluded.display_name,
             bio = excluded.bio,
             avatar_url = excluded.avatar_url,
             dm_privacy = excluded.dm_privacy"#,
    )
    .bind(&id)
    .bind(&did)
    .bind(format!("{}@{}", profile.handle, domain))
    .bind(&profile.public_key)
    .bind(&profile.chat_public_key)
    .bind(&profile.display_name)
    .bind(&profile.bio)
    .bind(&profile.avatar_url)
    .bind(&profile.dm_privacy)
    .bind(profile.is_bot)
    .bind(domain)
    .bind(now)
    .execute(pool)
    .await?;

    sqlx::query(
        r#"INSERT INTO handle_registry (handle, node_domain, did, updated_at)
           VALUES (?, ?, ?, ?)
           ON CONFLICT (handle, node_domain) DO UPDATE SET did = excluded.did, updated_at = excluded.updated_at"#,
    )
    .bind(&profile.handle)
    .bind(domain)
    .bind(&did)
    .bind(now)
    .execute(pool)
    .await?;

    sqlx::query_as("SELECT * FROM users WHERE did = ?")
        .bind(&did)
        .fetch_one(pool)
        .await
        .map_err(NodeError::from)
}

async fn upsert_cached_post(
    pool: &SqlitePool,
    domain: &str,
    cached_user_id: &str,
    post: &RemotePost,
) -> Result<(), NodeError> {
    let ap_id = synthetic_ap_id(domain, &post.id);
    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM posts WHERE ap_id = ?")
        .bind(&ap_id)
        .fetch_optional(pool)
        .await?;
    let id = existing
        .map(|(id,)| id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    sqlx::query(
        r#"INSERT INTO posts (id, user_id, content, reply_to_id, repost_of_id, ap_id,
                               likes_count, reposts_count, replies_count, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT (ap_id) DO UPDATE SET
             content = excluded.content,
             likes_count = excluded.likes_count,
             reposts_count = excluded.reposts_count,
             replies_count = excluded.replies_count"#,
    )
    .bind(&id)
    .bind(cached_user_id)
    .bind(&post.content)
    .bind(&post.reply_to_id)
    .bind(&post.repost_of_id)
    .bind(&ap_id)
    .bind(post.likes_count)
    .bind(post.reposts_count)
    .bind(post.replies_count)
    .bind(post.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Background sweep (C11): refreshes every remote follow target at most
/// once per minute, keyed by `lastSyncTimes` in `AppState` (spec §4.9, §5).
pub async fn refresh_remote_follows(state: &AppState) -> Result<(), NodeError> {
    let targets: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT remote_handle FROM remote_follows")
            .fetch_all(&state.pool)
            .await?;

    for (full_handle,) in targets {
        let now = Utc::now();
        if let Some(last) = state.last_sync_times.get(&full_handle) {
            if now.signed_duration_since(*last.value()) < chrono::Duration::minutes(1) {
                continue;
            }
        }

        let Ok((local_part, domain)) = split_remote_handle(&full_handle) else {
            continue;
        };
        match pull_profile(state, &local_part, &domain, 20).await {
            Ok(_) => {
                state.last_sync_times.insert(full_handle.clone(), now);
            }
            Err(e) => {
                tracing::warn!(handle = %full_handle, error = %e, "remote follow sync failed");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_remote_handle() {
        let (local, domain) = split_remote_handle("alice@peer.example").unwrap();
        assert_eq!(local, "alice");
        assert_eq!(domain, "peer.example");
    }

    #[test]
    fn rejects_malformed_remote_handle() {
        assert!(split_remote_handle("alice").is_err());
        assert!(split_remote_handle("@peer.example").is_err());
        assert!(split_remote_handle("alice@").is_err());
    }

    #[test]
    fn synthesizes_stable_identifiers() {
        assert_eq!(synthetic_did("peer.example", "alice"), "did:swarm:peer.example:alice");
        assert_eq!(synthetic_ap_id("peer.example", "P1"), "swarm:peer.example:P1");
    }
}
