//! Interaction delivery (C8, spec §4.8) — the outgoing queue of swarm
//! interactions (like/unlike/repost/unrepost/reply) to origin nodes.
//! Grounded in the teacher's three-tier local/federation/queue routing
//! idiom in `umbra-relay/src/handler.rs` (classify the target, try the
//! in-process path, fall back to an outbound call with retry/backoff).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::Post;
use crate::error::NodeError;
use crate::node_signature::{
    self, NodeEnvelopeHeaders, SIGNATURE_HEADER, SOURCE_DOMAIN_HEADER, TIMESTAMP_HEADER,
};
use crate::signed_action::SignedAction;
use crate::state::AppState;

const SWARM_PREFIX: &str = "swarm:";
const MAX_ATTEMPTS: u32 = 4;
const INTERACTION_DEADLINE_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Like,
    Unlike,
    Repost,
    Unrepost,
    Reply,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Like => "like",
            Verb::Unlike => "unlike",
            Verb::Repost => "repost",
            Verb::Unrepost => "unrepost",
            Verb::Reply => "reply",
        }
    }
}

/// Where an `apId` places its origin (spec §4.8 step 1).
pub enum Origin {
    /// `swarm:<domain>:<originId>` — the post mirrors a remote origin.
    Remote { domain: String, origin_id: String },
    /// No `swarm:` prefix — local-origin or legacy; apply in-process.
    Local,
}

pub fn classify_ap_id(ap_id: &str) -> Origin {
    match ap_id.strip_prefix(SWARM_PREFIX) {
        Some(rest) => match rest.split_once(':') {
            Some((domain, origin_id)) => Origin::Remote {
                domain: domain.to_string(),
                origin_id: origin_id.to_string(),
            },
            None => Origin::Local,
        },
        None => Origin::Local,
    }
}

#[derive(Serialize, Deserialize)]
pub struct ActorInfo {
    #[serde(rename = "actorHandle")]
    pub actor_handle: String,
    #[serde(rename = "actorNodeDomain")]
    pub actor_node_domain: String,
    #[serde(rename = "interactionId")]
    pub interaction_id: String,
    pub timestamp: i64,
}

#[derive(Serialize, Deserialize)]
pub struct InteractionPayload {
    #[serde(rename = "postId")]
    pub post_id: String,
    #[serde(flatten)]
    pub actor: VerbActor,
    /// The acting user's original signed envelope (spec §4.8 step 2). The
    /// receiver verifies `envelope.sig` against the envelope's own
    /// canonical form, since this node never holds the acting user's
    /// private key and so cannot produce a fresh signature over the actor
    /// tuple itself.
    pub envelope: SignedAction,
}

/// Tags the `actor` field with its verb key, matching the `{postId,
/// <verb>: {...}}` shape of spec §4.8.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
pub enum VerbActor {
    Like { like: ActorInfo },
    Unlike { unlike: ActorInfo },
    Repost { repost: ActorInfo },
    Unrepost { unrepost: ActorInfo },
    Reply { reply: ActorInfo },
}

fn wrap_actor(verb: Verb, actor: ActorInfo) -> VerbActor {
    match verb {
        Verb::Like => VerbActor::Like { like: actor },
        Verb::Unlike => VerbActor::Unlike { unlike: actor },
        Verb::Repost => VerbActor::Repost { repost: actor },
        Verb::Unrepost => VerbActor::Unrepost { unrepost: actor },
        Verb::Reply => VerbActor::Reply { reply: actor },
    }
}

/// Applies the effect of an interaction locally: counter bump plus a
/// notification carrying inline actor info (spec §4.8, §9 "counters").
async fn apply_local_effect(
    pool: &SqlitePool,
    post_id: &str,
    verb: Verb,
    actor_handle: &str,
    actor_node_domain: Option<&str>,
) -> Result<(), NodeError> {
    let post: Option<Post> = sqlx::query_as("SELECT * FROM posts WHERE id = ?")
        .bind(post_id)
        .fetch_optional(pool)
        .await?;
    let post = post.ok_or_else(|| NodeError::NotFound("post not found".into()))?;

    match verb {
        Verb::Like => {
            sqlx::query("UPDATE posts SET likes_count = likes_count + 1 WHERE id = ?")
                .bind(&post.id)
                .execute(pool)
                .await?;
        }
        Verb::Unlike => {
            sqlx::query("UPDATE posts SET likes_count = MAX(likes_count - 1, 0) WHERE id = ?")
                .bind(&post.id)
                .execute(pool)
                .await?;
        }
        Verb::Repost => {
            sqlx::query("UPDATE posts SET reposts_count = reposts_count + 1 WHERE id = ?")
                .bind(&post.id)
                .execute(pool)
                .await?;
        }
        Verb::Unrepost => {
            sqlx::query("UPDATE posts SET reposts_count = MAX(reposts_count - 1, 0) WHERE id = ?")
                .bind(&post.id)
                .execute(pool)
                .await?;
        }
        Verb::Reply => {
            sqlx::query("UPDATE posts SET replies_count = replies_count + 1 WHERE id = ?")
                .bind(&post.id)
                .execute(pool)
                .await?;
        }
    }

    let notification_id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"INSERT INTO notifications (id, user_id, kind, post_id, actor_handle, actor_node_domain, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&notification_id)
    .bind(&post.user_id)
    .bind(verb.as_str())
    .bind(&post.id)
    .bind(actor_handle)
    .bind(actor_node_domain)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Delivers an interaction to its target's origin (spec §4.8). Local-origin
/// targets are applied in-process; `swarm:` targets are POSTed to the
/// origin with retry/backoff up to `MAX_ATTEMPTS`, then dropped and logged.
pub async fn deliver_interaction(
    state: &AppState,
    post: &Post,
    verb: Verb,
    envelope: &SignedAction,
) -> Result<(), NodeError> {
    let interaction_id = Uuid::new_v4().to_string();
    let timestamp = Utc::now().timestamp_millis();

    match classify_ap_id(&post.ap_id) {
        Origin::Local => {
            apply_local_effect(&state.pool, &post.id, verb, &envelope.handle, None).await
        }
        Origin::Remote { domain, origin_id } => {
            let actor = ActorInfo {
                actor_handle: envelope.handle.clone(),
                actor_node_domain: state.config.node_domain.clone(),
                interaction_id,
                timestamp,
            };
            let payload = InteractionPayload {
                post_id: origin_id,
                actor: wrap_actor(verb, actor),
                envelope: envelope.clone(),
            };
            let body = serde_json::to_value(&payload)
                .map_err(|e| NodeError::Internal(e.to_string()))?;

            let url = format!("https://{domain}/swarm/interactions/{}", verb.as_str());
            send_with_retry(state, &domain, &url, body).await
        }
    }
}

async fn send_with_retry(
    state: &AppState,
    domain: &str,
    url: &str,
    body: serde_json::Value,
) -> Result<(), NodeError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let headers = node_signature::sign_node_envelope(&state.node_keypair, &state.config.node_domain, &body)?;
        let result = state
            .http_client
            .post(url)
            .timeout(std::time::Duration::from_secs(INTERACTION_DELIVERY_DEADLINE_SECS))
            .header(SIGNATURE_HEADER, &headers.signature)
            .header(SOURCE_DOMAIN_HEADER, &headers.source_domain)
            .header(TIMESTAMP_HEADER, headers.ts.to_string())
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                node_signature::mark_node_success(&state.pool, domain).await?;
                return Ok(());
            }
            Ok(resp) if resp.status().as_u16() == 429 => {
                // Rate limited by the peer: treat like a transient failure, retry.
            }
            Ok(resp) if resp.status().is_client_error() => {
                // Semantic rejection; give up without marking the node as failing.
                tracing::warn!(domain, status = %resp.status(), "interaction rejected by origin");
                return Ok(());
            }
            _ => {}
        }

        node_signature::mark_node_failure(&state.pool, domain).await?;
        if attempt >= MAX_ATTEMPTS {
            tracing::warn!(domain, attempt, "interaction delivery dropped after max attempts");
            return Ok(());
        }
        let backoff = std::time::Duration::from_millis(200 * 2u64.pow(attempt));
        tokio::time::sleep(backoff).await;
    }
}

const INTERACTION_DELIVERY_DEADLINE_SECS: u64 = INTERACTION_DEADLINE_SECS;

/// Idempotent receive-side application for an inbound swarm interaction
/// (spec §4.8): duplicates by `interactionId` are ack'd without re-applying.
pub async fn receive_interaction(
    pool: &SqlitePool,
    post_id: &str,
    verb: Verb,
    interaction_id: &str,
    actor_handle: &str,
    actor_node_domain: &str,
) -> Result<(), NodeError> {
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO delivered_interactions (interaction_id, verb, post_id, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(interaction_id)
    .bind(verb.as_str())
    .bind(post_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    if inserted.rows_affected() == 0 {
        // Already delivered; ack without reapplying (P6).
        return Ok(());
    }

    apply_local_effect(pool, post_id, verb, actor_handle, Some(actor_node_domain)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn seed_post(pool: &SqlitePool, ap_id: &str) -> Post {
        let user_id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO users (id, did, handle, public_key, dm_privacy, created_at) VALUES (?, 'did:key:x', 'author', 'pk', 'everyone', ?)")
            .bind(&user_id)
            .bind(Utc::now())
            .execute(pool)
            .await
            .unwrap();
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO posts (id, user_id, content, ap_id, created_at) VALUES (?, ?, 'hi', ?, ?)")
            .bind(&id)
            .bind(&user_id)
            .bind(ap_id)
            .bind(Utc::now())
            .execute(pool)
            .await
            .unwrap();
        sqlx::query_as("SELECT * FROM posts WHERE id = ?")
            .bind(&id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[test]
    fn classifies_swarm_prefixed_ap_id() {
        match classify_ap_id("swarm:peer.example:P1") {
            Origin::Remote { domain, origin_id } => {
                assert_eq!(domain, "peer.example");
                assert_eq!(origin_id, "P1");
            }
            Origin::Local => panic!("expected remote"),
        }
    }

    #[test]
    fn classifies_local_ap_id() {
        assert!(matches!(classify_ap_id("https://node/posts/1"), Origin::Local));
    }

    #[tokio::test]
    async fn local_like_increments_counter_once() {
        let pool = test_pool().await;
        let post = seed_post(&pool, "https://local/posts/1").await;
        apply_local_effect(&pool, &post.id, Verb::Like, "bob", None).await.unwrap();
        let updated: Post = sqlx::query_as("SELECT * FROM posts WHERE id = ?")
            .bind(&post.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(updated.likes_count, 1);
    }

    #[tokio::test]
    async fn unlike_never_goes_negative() {
        let pool = test_pool().await;
        let post = seed_post(&pool, "https://local/posts/1").await;
        apply_local_effect(&pool, &post.id, Verb::Unlike, "bob", None).await.unwrap();
        let updated: Post = sqlx::query_as("SELECT * FROM posts WHERE id = ?")
            .bind(&post.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(updated.likes_count, 0);
    }

    #[test]
    fn interaction_payload_carries_a_verifiably_signed_envelope() {
        use crate::crypto::canonical::canonical_without_sig;
        use crate::crypto::keys::KeyPair;

        let kp = KeyPair::generate();
        let mut envelope = SignedAction {
            action: "like".into(),
            data: serde_json::json!({"postId": "P1"}),
            did: kp.public_key().to_did_key(),
            handle: "bob".into(),
            ts: Utc::now().timestamp_millis(),
            nonce: Uuid::new_v4().to_string(),
            sig: String::new(),
        };
        let canonical = canonical_without_sig(&serde_json::to_value(&envelope).unwrap()).unwrap();
        envelope.sig = kp.sign(canonical.as_bytes());

        let payload = InteractionPayload {
            post_id: "P1".into(),
            actor: wrap_actor(
                Verb::Like,
                ActorInfo {
                    actor_handle: envelope.handle.clone(),
                    actor_node_domain: "origin.example".into(),
                    interaction_id: Uuid::new_v4().to_string(),
                    timestamp: Utc::now().timestamp_millis(),
                },
            ),
            envelope: envelope.clone(),
        };

        let wire = serde_json::to_value(&payload).unwrap();
        let round_tripped: InteractionPayload = serde_json::from_value(wire).unwrap();

        let recomputed = canonical_without_sig(&serde_json::to_value(&round_tripped.envelope).unwrap()).unwrap();
        kp.public_key()
            .verify(recomputed.as_bytes(), &round_tripped.envelope.sig)
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_interaction_id_applies_once() {
        let pool = test_pool().await;
        let post = seed_post(&pool, "swarm:origin.example:P1").await;
        for _ in 0..3 {
            receive_interaction(&pool, &post.id, Verb::Like, "fixed-id", "bob", "b.example")
                .await
                .unwrap();
        }
        let updated: Post = sqlx::query_as("SELECT * FROM posts WHERE id = ?")
            .bind(&post.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(updated.likes_count, 1);
    }
}
