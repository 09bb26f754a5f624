//! The swarm protocol endpoints (C6/C7/C8/C9/C10 wire surface, spec §6):
//! `/swarm/*`, `/chat/receive`, and the well-known bootstrap directory.
//! Node-signed routes verify the `X-Swarm-Signature`/`X-Swarm-Source-Domain`
//! headers (C6) before touching any domain handler.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::db::models::{Post, User};
use crate::delivery::{self, Verb};
use crate::discovery::{self, AnnouncePayload, GossipPayload};
use crate::dm;
use crate::error::{NodeError, SignatureFailure};
use crate::node_signature::{
    self, NodeEnvelopeHeaders, SIGNATURE_HEADER, SOURCE_DOMAIN_HEADER, TIMESTAMP_HEADER,
};
use crate::pull;
use crate::remote_identity;
use crate::signed_action::SignedAction;
use crate::state::AppState;

fn node_headers_from(headers: &HeaderMap) -> Result<NodeEnvelopeHeaders, NodeError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(NodeError::AuthRequired)?
        .to_string();
    let source_domain = headers
        .get(SOURCE_DOMAIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(NodeError::AuthRequired)?
        .to_string();
    let ts = headers
        .get(TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or(NodeError::AuthRequired)?;
    Ok(NodeEnvelopeHeaders {
        signature,
        source_domain,
        ts,
    })
}

/// `GET /swarm/info` — public announce metadata (spec §6, §4.6).
pub async fn info(State(state): State<AppState>) -> Result<impl IntoResponse, NodeError> {
    let user_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE is_remote = 0")
        .fetch_one(&state.pool)
        .await?;
    let post_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE is_removed = 0")
        .fetch_one(&state.pool)
        .await?;
    Ok(Json(json!({
        "domain": state.config.node_domain,
        "publicKey": state.node_keypair.public_key().to_base64(),
        "softwareVersion": env!("CARGO_PKG_VERSION"),
        "capabilities": ["posts", "dm", "gossip"],
        "userCount": user_count.0,
        "postCount": post_count.0,
    })))
}

/// `GET /.well-known/synapsis-swarm` — directory bootstrap (spec §6).
pub async fn well_known(State(state): State<AppState>) -> Result<impl IntoResponse, NodeError> {
    Ok(Json(json!({
        "domain": state.config.node_domain,
        "protocol": "synapsis-swarm/1",
        "endpoints": {
            "info": "/swarm/info",
            "announce": "/swarm/announce",
            "gossip": "/swarm/gossip",
        },
    })))
}

/// `POST /swarm/announce` — signed peer-info exchange (spec §4.7). Reuses
/// the outbound payload shape from `discovery::announce_to_seeds`.
pub async fn announce(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, NodeError> {
    let node_headers = node_headers_from(&headers)?;

    // First announcement from a peer: no registry row yet to verify against,
    // so trust-on-first-contact the same way `/swarm/info` is fetched on
    // first contact (spec §4.6). Re-announcements from a known node are
    // signature-checked.
    let payload: AnnouncePayload =
        serde_json::from_value(body.clone()).map_err(|e| NodeError::Validation(e.to_string()))?;
    if node_signature::is_known_node(&state.pool, &node_headers.source_domain).await? {
        node_signature::verify_node_envelope(&state.pool, &body, &node_headers).await?;
    }

    node_signature::upsert_node(
        &state.pool,
        &payload.domain,
        Some(&payload.public_key),
        Some(&payload.software_version),
        payload.user_count,
        payload.post_count,
    )
    .await?;

    info(State(state)).await
}

/// `POST /swarm/gossip` — signed directory exchange (spec §4.7).
pub async fn gossip(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, NodeError> {
    let node_headers = node_headers_from(&headers)?;
    node_signature::verify_node_envelope(&state.pool, &body, &node_headers).await?;

    let payload: GossipPayload =
        serde_json::from_value(body).map_err(|e| NodeError::Validation(e.to_string()))?;
    discovery::apply_gossip(&state.pool, payload).await?;
    let sender_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM swarm_nodes")
        .fetch_one(&state.pool)
        .await?;
    Ok(Json(json!({ "sender": state.config.node_domain, "nodeCount": sender_count.0 })))
}

#[derive(Deserialize)]
pub struct ProfileQuery {
    pub limit: Option<i64>,
}

/// `GET /swarm/users/{handle}[?limit=]` — public profile + recent posts
/// (spec §6, §4.9).
pub async fn get_profile(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Query(query): Query<ProfileQuery>,
) -> Result<impl IntoResponse, NodeError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE handle = ? AND is_remote = 0")
        .bind(&handle)
        .fetch_optional(&state.pool)
        .await?;
    let user = user.ok_or_else(|| NodeError::NotFound("user not found".into()))?;

    let posts: Vec<Post> = sqlx::query_as(
        "SELECT * FROM posts WHERE user_id = ? AND is_removed = 0 ORDER BY created_at DESC LIMIT ?",
    )
    .bind(&user.id)
    .bind(limit)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(json!({
        "handle": user.handle,
        "displayName": user.display_name,
        "bio": user.bio,
        "avatarUrl": user.avatar_url,
        "publicKey": user.public_key,
        "chatPublicKey": user.chat_public_key,
        "isBot": user.is_bot,
        "dmPrivacy": user.dm_privacy,
        "posts": posts.into_iter().map(|p| json!({
            "id": p.id,
            "content": p.content,
            "replyToId": p.reply_to_id,
            "repostOfId": p.repost_of_id,
            "likesCount": p.likes_count,
            "repostsCount": p.reposts_count,
            "repliesCount": p.replies_count,
            "createdAt": p.created_at,
        })).collect::<Vec<_>>(),
    })))
}

/// `GET /swarm/users/{handle}/following` and `.../followers` (spec §6).
pub async fn following(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, NodeError> {
    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE handle = ? AND is_remote = 0")
        .bind(&handle)
        .fetch_optional(&state.pool)
        .await?;
    let user = user.ok_or_else(|| NodeError::NotFound("user not found".into()))?;
    let rows: Vec<(String,)> = sqlx::query_as("SELECT followee FROM follows WHERE follower_id = ?")
        .bind(&user.id)
        .fetch_all(&state.pool)
        .await?;
    Ok(Json(json!({ "following": rows.into_iter().map(|(d,)| d).collect::<Vec<_>>() })))
}

pub async fn followers(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, NodeError> {
    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE handle = ? AND is_remote = 0")
        .bind(&handle)
        .fetch_optional(&state.pool)
        .await?;
    let user = user.ok_or_else(|| NodeError::NotFound("user not found".into()))?;
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT id FROM users WHERE id IN (SELECT follower_id FROM follows WHERE followee = ?)")
            .bind(&user.did)
            .fetch_all(&state.pool)
            .await?;
    Ok(Json(json!({ "followers": rows.into_iter().map(|(d,)| d).collect::<Vec<_>>() })))
}

/// `GET /swarm/posts/{id}` — public, post with replies (spec §6).
pub async fn get_post(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, NodeError> {
    let post: Option<Post> = sqlx::query_as("SELECT * FROM posts WHERE id = ?")
        .bind(&id)
        .fetch_optional(&state.pool)
        .await?;
    let post = post.ok_or_else(|| NodeError::NotFound("post not found".into()))?;
    let replies: Vec<Post> = sqlx::query_as(
        "SELECT * FROM posts WHERE reply_to_id = ? AND is_removed = 0 ORDER BY created_at ASC",
    )
    .bind(&post.id)
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(json!({ "post": post, "replies": replies })))
}

#[derive(Deserialize)]
pub struct InboundInteraction {
    #[serde(rename = "postId")]
    pub post_id: String,
    #[serde(flatten)]
    pub actor: serde_json::Value,
    /// The acting user's original signed envelope (spec §4.8 step 2):
    /// verified against the actor's TOFU-resolved key instead of a second
    /// signature over the actor tuple, since the delivering node never
    /// holds the acting user's private key.
    pub envelope: SignedAction,
}

/// Resolves an inbound interaction's actor key through the TOFU cache (C5),
/// rejecting a detected key rotation under default policy — mirrors
/// `dm::resolve_sender_public_key`.
async fn resolve_interaction_actor_key(
    state: &AppState,
    did: &str,
    actor_handle: &str,
    actor_node_domain: &str,
) -> Result<String, NodeError> {
    let domain = actor_node_domain.to_string();
    let handle = actor_handle.to_string();
    let client = state.http_client.clone();
    let timeout = state.config.profile_refresh_timeout_secs;

    let outcome = remote_identity::resolve_remote_key(
        &state.pool,
        did,
        move || {
            Box::pin(async move {
                let url = format!("https://{domain}/swarm/users/{handle}");
                let resp = client
                    .get(&url)
                    .timeout(std::time::Duration::from_secs(timeout))
                    .send()
                    .await
                    .map_err(|e| NodeError::UpstreamUnreachable(e.to_string()))?;
                let profile: pull::RemoteProfile = resp
                    .json()
                    .await
                    .map_err(|e| NodeError::UpstreamUnreachable(e.to_string()))?;
                Ok(profile.public_key)
            })
        },
        state.config.allow_key_rotation,
    )
    .await?;

    if outcome.key_changed && !state.config.allow_key_rotation {
        return Err(NodeError::InvalidSignature(SignatureFailure::KeyChanged));
    }
    Ok(outcome.public_key)
}

/// `POST /swarm/interactions/{verb}` (spec §4.8 receiving side, §6, §9):
/// verifies both the node envelope (C6) and the acting user's signature via
/// TOFU (C5), then applies the effect idempotently on `interactionId`.
pub async fn interaction(
    State(state): State<AppState>,
    Path(verb_str): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, NodeError> {
    let verb = match verb_str.as_str() {
        "like" => Verb::Like,
        "unlike" => Verb::Unlike,
        "repost" => Verb::Repost,
        "unrepost" => Verb::Unrepost,
        "reply" => Verb::Reply,
        other => return Err(NodeError::NotFound(format!("unknown verb {other}"))),
    };

    let node_headers = node_headers_from(&headers)?;
    node_signature::verify_node_envelope(&state.pool, &body, &node_headers).await?;

    let payload: InboundInteraction =
        serde_json::from_value(body).map_err(|e| NodeError::Validation(e.to_string()))?;

    let actor_key = verb_str.as_str();
    let actor = payload
        .actor
        .get(actor_key)
        .ok_or_else(|| NodeError::Validation(format!("missing {actor_key} field")))?;
    let actor_handle = actor
        .get("actorHandle")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NodeError::Validation("missing actorHandle".into()))?
        .to_string();
    let actor_node_domain = actor
        .get("actorNodeDomain")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NodeError::Validation("missing actorNodeDomain".into()))?
        .to_string();
    let interaction_id = actor
        .get("interactionId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NodeError::Validation("missing interactionId".into()))?
        .to_string();

    if payload.envelope.handle != actor_handle {
        return Err(NodeError::InvalidSignature(SignatureFailure::HandleMismatch));
    }

    let public_key_b64 =
        resolve_interaction_actor_key(&state, &payload.envelope.did, &actor_handle, &actor_node_domain).await?;
    let public_key = crate::crypto::keys::PublicKey::from_spki_base64(&public_key_b64)?;
    let envelope_value =
        serde_json::to_value(&payload.envelope).map_err(|e| NodeError::Internal(e.to_string()))?;
    let canonical = crate::crypto::canonical::canonical_without_sig(&envelope_value)?;
    public_key.verify(canonical.as_bytes(), &payload.envelope.sig)?;

    let post: Option<Post> = sqlx::query_as("SELECT * FROM posts WHERE ap_id = ?")
        .bind(format!("swarm:{}:{}", state.config.node_domain, payload.post_id))
        .fetch_optional(&state.pool)
        .await?;
    let post = match post {
        Some(p) => p,
        None => sqlx::query_as("SELECT * FROM posts WHERE id = ?")
            .bind(&payload.post_id)
            .fetch_optional(&state.pool)
            .await?
            .ok_or_else(|| NodeError::NotFound("post not found".into()))?,
    };

    delivery::receive_interaction(
        &state.pool,
        &post.id,
        verb,
        &interaction_id,
        &actor_handle,
        &actor_node_domain,
    )
    .await?;
    Ok(Json(json!({ "ok": true })))
}

/// `POST /chat/receive` — signed outer + user-signed inner (spec §4.6,
/// §4.10 "Receive operation").
pub async fn chat_receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, NodeError> {
    let node_headers = if headers.contains_key(SIGNATURE_HEADER) {
        Some(node_headers_from(&headers)?)
    } else {
        None
    };

    let inner = body.get("userAction").cloned().unwrap_or_else(|| body.clone());
    let envelope: SignedAction =
        serde_json::from_value(inner).map_err(|e| NodeError::Validation(e.to_string()))?;
    let sender_domain = node_headers.as_ref().map(|h| h.source_domain.clone());

    let message = dm::receive_message(
        &state,
        node_headers.as_ref(),
        &body,
        &envelope,
        sender_domain.as_deref(),
    )
    .await?;
    Ok(Json(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn node_headers_from_reads_the_signed_timestamp_header() {
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("sig"));
        headers.insert(SOURCE_DOMAIN_HEADER, HeaderValue::from_static("peer.example"));
        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_static("1700000000000"));

        let parsed = node_headers_from(&headers).unwrap();
        assert_eq!(parsed.ts, 1_700_000_000_000);
        assert_eq!(parsed.source_domain, "peer.example");
    }

    #[test]
    fn node_headers_from_rejects_a_missing_timestamp_header() {
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("sig"));
        headers.insert(SOURCE_DOMAIN_HEADER, HeaderValue::from_static("peer.example"));
        assert!(node_headers_from(&headers).is_err());
    }
}
