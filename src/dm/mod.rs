//! Direct-message engine (C10, spec §4.10): E2E-encrypted DM send/receive,
//! conversation state, privacy gating, and cross-node forwarding. Grounded
//! in the teacher's message-handling idiom in `umbra-relay/src/handler.rs`
//! (resolve recipient → apply policy → persist → forward), generalized from
//! a relay-stored offline queue to a pair of per-participant conversation
//! rows (spec §3 ChatConversation/ChatMessage).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::crypto::canonical::canonical_without_sig;
use crate::crypto::keys::PublicKey;
use crate::db::models::{ChatConversation, ChatMessage, User};
use crate::error::NodeError;
use crate::node_signature::{
    self, NodeEnvelopeHeaders, SIGNATURE_HEADER, SOURCE_DOMAIN_HEADER, TIMESTAMP_HEADER,
};
use crate::pull;
use crate::remote_identity;
use crate::signed_action::SignedAction;
use crate::state::AppState;

const MESSAGE_PAGE_SIZE: i64 = 100;

/// Either plaintext (legacy/local, spec §4.10 server-aided mode) or a
/// client-encrypted blob (E2E mode). Never both on the wire at once.
#[derive(Debug, Clone)]
pub enum MessageBody {
    Plain(String),
    Encrypted {
        ciphertext: String,
        sender_chat_public_key: String,
    },
}

pub struct SendInput {
    pub recipient: String, // local handle, or `handle@domain`
    pub body: MessageBody,
    /// Required for cross-node sends: the outer payload must be a
    /// user-SignedAction (spec §4.10 step 1).
    pub cross_node_envelope: Option<SignedAction>,
}

/// A resolved recipient, local or cached-remote (spec §4.10 step 2).
enum Recipient {
    Local(User),
    Remote { user: User, domain: String },
}

async fn resolve_recipient(state: &AppState, recipient: &str) -> Result<Recipient, NodeError> {
    if let Some((local_part, domain)) = recipient.split_once('@') {
        if !node_signature::is_known_node(&state.pool, &domain.to_string()).await? {
            return Err(NodeError::Forbidden(format!("{domain} is not a known swarm node")));
        }
        let did = pull::synthetic_did(domain, local_part);
        let cached: Option<User> = sqlx::query_as("SELECT * FROM users WHERE did = ?")
            .bind(&did)
            .fetch_optional(&state.pool)
            .await?;

        let user = match cached {
            Some(u) if u.chat_public_key.is_some() => u,
            _ => pull::pull_profile(state, local_part, domain, 0).await?,
        };
        Ok(Recipient::Remote {
            user,
            domain: domain.to_string(),
        })
    } else {
        let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE handle = ? AND is_remote = 0")
            .bind(recipient)
            .fetch_optional(&state.pool)
            .await?;
        let user = user.ok_or_else(|| NodeError::NotFound("user not found".into()))?;
        Ok(Recipient::Local(user))
    }
}

/// Privacy gate (spec §4.10 step 3): bots never receive DMs; `none` rejects
/// everyone; `following` requires the recipient to follow the sender;
/// `everyone` permits.
async fn check_privacy(pool: &SqlitePool, sender: &User, recipient: &User) -> Result<(), NodeError> {
    if recipient.is_bot {
        return Err(NodeError::Forbidden("recipient is a bot".into()));
    }
    match recipient.dm_privacy.as_str() {
        "none" => Err(NodeError::Forbidden("recipient does not accept DMs".into())),
        "following" => {
            let follows: Option<(String,)> = sqlx::query_as(
                "SELECT id FROM follows WHERE follower_id = ? AND followee = ?",
            )
            .bind(&recipient.id)
            .bind(&sender.did)
            .fetch_optional(pool)
            .await?;
            if follows.is_some() {
                Ok(())
            } else {
                Err(NodeError::Forbidden(
                    "recipient only accepts DMs from accounts they follow".into(),
                ))
            }
        }
        _ => Ok(()),
    }
}

fn preview_of(body: &MessageBody) -> String {
    match body {
        MessageBody::Plain(text) => text.chars().take(80).collect(),
        MessageBody::Encrypted { .. } => "[encrypted message]".to_string(),
    }
}

async fn upsert_conversation(
    pool: &SqlitePool,
    participant1_id: &str,
    participant2_handle: &str,
    preview: &str,
    at: chrono::DateTime<Utc>,
) -> Result<ChatConversation, NodeError> {
    let existing: Option<ChatConversation> = sqlx::query_as(
        "SELECT * FROM chat_conversations WHERE participant1_id = ? AND participant2_handle = ?",
    )
    .bind(participant1_id)
    .bind(participant2_handle)
    .fetch_optional(pool)
    .await?;

    let id = existing
        .as_ref()
        .map(|c| c.id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    sqlx::query(
        r#"INSERT INTO chat_conversations (id, participant1_id, participant2_handle, last_message_at, last_message_preview)
           VALUES (?, ?, ?, ?, ?)
           ON CONFLICT (participant1_id, participant2_handle) DO UPDATE SET
             last_message_at = excluded.last_message_at,
             last_message_preview = excluded.last_message_preview"#,
    )
    .bind(&id)
    .bind(participant1_id)
    .bind(participant2_handle)
    .bind(at)
    .bind(preview)
    .execute(pool)
    .await?;

    sqlx::query_as("SELECT * FROM chat_conversations WHERE id = ?")
        .bind(&id)
        .fetch_one(pool)
        .await
        .map_err(NodeError::from)
}

async fn insert_message(
    pool: &SqlitePool,
    conversation_id: &str,
    sender_handle: &str,
    sender_did: &str,
    sender_node_domain: Option<&str>,
    body: &MessageBody,
) -> Result<ChatMessage, NodeError> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let (content, encrypted_content, sender_chat_public_key) = match body {
        MessageBody::Plain(text) => (Some(text.clone()), None, None),
        MessageBody::Encrypted {
            ciphertext,
            sender_chat_public_key,
        } => (None, Some(ciphertext.clone()), Some(sender_chat_public_key.clone())),
    };

    sqlx::query(
        r#"INSERT INTO chat_messages
           (id, conversation_id, sender_handle, sender_did, sender_node_domain,
            content, encrypted_content, sender_chat_public_key, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(conversation_id)
    .bind(sender_handle)
    .bind(sender_did)
    .bind(sender_node_domain)
    .bind(&content)
    .bind(&encrypted_content)
    .bind(&sender_chat_public_key)
    .bind(now)
    .execute(pool)
    .await?;

    sqlx::query_as("SELECT * FROM chat_messages WHERE id = ?")
        .bind(&id)
        .fetch_one(pool)
        .await
        .map_err(NodeError::from)
}

/// DM send (spec §4.10 "Send operation"). `sender` must already be an
/// authenticated local user (session cookie, checked by the HTTP layer).
pub async fn send_message(state: &AppState, sender: &User, input: SendInput) -> Result<ChatMessage, NodeError> {
    let recipient = resolve_recipient(state, &input.recipient).await?;

    let recipient_user = match &recipient {
        Recipient::Local(u) => u,
        Recipient::Remote { user, .. } => user,
    };
    check_privacy(&state.pool, sender, recipient_user).await?;

    let preview = preview_of(&input.body);
    let now = Utc::now();

    let sender_conv = upsert_conversation(&state.pool, &sender.id, &input.recipient, &preview, now).await?;
    let sent = insert_message(
        &state.pool,
        &sender_conv.id,
        &sender.handle,
        &sender.did,
        None,
        &input.body,
    )
    .await?;

    match recipient {
        Recipient::Local(recipient_user) => {
            let recipient_conv = upsert_conversation(&state.pool, &recipient_user.id, &sender.handle, &preview, now).await?;
            insert_message(
                &state.pool,
                &recipient_conv.id,
                &sender.handle,
                &sender.did,
                None,
                &input.body,
            )
            .await?;
            mark_delivered(&state.pool, &sent.id).await?;
        }
        Recipient::Remote { domain, .. } => {
            let envelope = input
                .cross_node_envelope
                .ok_or_else(|| NodeError::AuthRequired)?;
            deliver_to_remote(state, &domain, &envelope).await?;
            mark_delivered(&state.pool, &sent.id).await?;
        }
    }

    Ok(sent)
}

async fn mark_delivered(pool: &SqlitePool, message_id: &str) -> Result<(), NodeError> {
    sqlx::query("UPDATE chat_messages SET delivered_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Wraps the user-signed `SignedAction` in a node-signed envelope and POSTs
/// it to the recipient node's `/chat/receive` (spec §4.6 "Federated DM
/// envelopes are a special nesting", §4.10 step 5).
async fn deliver_to_remote(state: &AppState, domain: &str, envelope: &SignedAction) -> Result<(), NodeError> {
    let inner = serde_json::to_value(envelope).map_err(|e| NodeError::Internal(e.to_string()))?;
    let body = serde_json::json!({ "userAction": inner });
    let headers: NodeEnvelopeHeaders =
        node_signature::sign_node_envelope(&state.node_keypair, &state.config.node_domain, &body)?;

    let url = format!("https://{domain}/chat/receive");
    let result = state
        .http_client
        .post(&url)
        .timeout(std::time::Duration::from_secs(state.config.http_client_timeout_secs))
        .header(SIGNATURE_HEADER, &headers.signature)
        .header(SOURCE_DOMAIN_HEADER, &headers.source_domain)
        .header(TIMESTAMP_HEADER, headers.ts.to_string())
        .json(&body)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => {
            node_signature::mark_node_success(&state.pool, domain).await?;
            Ok(())
        }
        _ => {
            // Leave deliveredAt null; background redelivery retries later
            // (spec §4.10 step 5). Not a hard failure for the API caller.
            node_signature::mark_node_failure(&state.pool, domain).await?;
            Ok(())
        }
    }
}

/// DM receive (spec §4.10 "Receive operation"). Accepts either a bare
/// user-SignedAction (legacy, any known sender) or a node-signed envelope
/// wrapping one.
pub async fn receive_message(
    state: &AppState,
    node_headers: Option<&NodeEnvelopeHeaders>,
    body: &serde_json::Value,
    envelope: &SignedAction,
    sender_node_domain: Option<&str>,
) -> Result<ChatMessage, NodeError> {
    if let Some(headers) = node_headers {
        node_signature::verify_node_envelope(&state.pool, body, headers).await?;
    }

    let public_key_hex = resolve_sender_public_key(state, envelope, sender_node_domain).await?;
    let public_key = PublicKey::from_spki_base64(&public_key_hex)?;
    let canonical = canonical_without_sig(&envelope_json(envelope))?;
    public_key.verify(canonical.as_bytes(), &envelope.sig)?;

    let recipient_did = envelope
        .data
        .get("recipientDid")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NodeError::Validation("missing recipientDid".into()))?;
    let recipient: Option<User> = sqlx::query_as("SELECT * FROM users WHERE did = ? AND is_remote = 0")
        .bind(recipient_did)
        .fetch_optional(&state.pool)
        .await?;
    let recipient = recipient.ok_or_else(|| NodeError::NotFound("unknown recipient".into()))?;

    let body_content = message_body_from_data(&envelope.data)?;
    let preview = preview_of(&body_content);
    let now = Utc::now();

    let sender_full_handle = match sender_node_domain {
        Some(domain) => format!("{}@{}", envelope.handle, domain),
        None => envelope.handle.clone(),
    };

    let conv = upsert_conversation(&state.pool, &recipient.id, &sender_full_handle, &preview, now).await?;
    let message = insert_message(
        &state.pool,
        &conv.id,
        &sender_full_handle,
        &envelope.did,
        sender_node_domain,
        &body_content,
    )
    .await?;

    if let Some(domain) = sender_node_domain {
        sqlx::query(
            r#"INSERT INTO handle_registry (handle, node_domain, did, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (handle, node_domain) DO UPDATE SET did = excluded.did, updated_at = excluded.updated_at"#,
        )
        .bind(&envelope.handle)
        .bind(domain)
        .bind(&envelope.did)
        .bind(now)
        .execute(&state.pool)
        .await?;
    }

    Ok(message)
}

fn envelope_json(envelope: &SignedAction) -> serde_json::Value {
    serde_json::to_value(envelope).expect("SignedAction always serializes")
}

fn message_body_from_data(data: &serde_json::Value) -> Result<MessageBody, NodeError> {
    if let Some(ciphertext) = data.get("encryptedContent").and_then(|v| v.as_str()) {
        let key = data
            .get("senderChatPublicKey")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NodeError::Validation("missing senderChatPublicKey".into()))?;
        Ok(MessageBody::Encrypted {
            ciphertext: ciphertext.to_string(),
            sender_chat_public_key: key.to_string(),
        })
    } else if let Some(content) = data.get("content").and_then(|v| v.as_str()) {
        Ok(MessageBody::Plain(content.to_string()))
    } else {
        Err(NodeError::Validation(
            "message data must carry content or encryptedContent".into(),
        ))
    }
}

/// Resolves the sender's public key via the TOFU cache (C5), fetching from
/// the sender's node on a cache miss (spec §4.10 step 2).
async fn resolve_sender_public_key(
    state: &AppState,
    envelope: &SignedAction,
    sender_node_domain: Option<&str>,
) -> Result<String, NodeError> {
    let Some(domain) = sender_node_domain else {
        let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE did = ?")
            .bind(&envelope.did)
            .fetch_optional(&state.pool)
            .await?;
        let user = user.ok_or_else(|| NodeError::NotFound("unknown local sender".into()))?;
        return Ok(user.public_key);
    };
    let domain = domain.to_string();
    let handle = envelope.handle.clone();
    let client = state.http_client.clone();
    let timeout = state.config.profile_refresh_timeout_secs;

    let outcome = remote_identity::resolve_remote_key(
        &state.pool,
        &envelope.did,
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
        return Err(NodeError::InvalidSignature(
            crate::error::SignatureFailure::KeyChanged,
        ));
    }
    Ok(outcome.public_key)
}

/// `GET /chat/messages?conversationId=&cursor=` (spec §4.10 "Read and
/// history"): up to 100 messages older than `cursor`, oldest-first in the
/// response.
pub async fn list_messages(
    pool: &SqlitePool,
    conversation_id: &str,
    cursor: Option<chrono::DateTime<Utc>>,
) -> Result<Vec<ChatMessage>, NodeError> {
    let mut rows: Vec<ChatMessage> = match cursor {
        Some(ts) => {
            sqlx::query_as(
                "SELECT * FROM chat_messages WHERE conversation_id = ? AND created_at < ? ORDER BY created_at DESC LIMIT ?",
            )
            .bind(conversation_id)
            .bind(ts)
            .bind(MESSAGE_PAGE_SIZE)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT * FROM chat_messages WHERE conversation_id = ? ORDER BY created_at DESC LIMIT ?",
            )
            .bind(conversation_id)
            .bind(MESSAGE_PAGE_SIZE)
            .fetch_all(pool)
            .await?
        }
    };
    rows.reverse(); // oldest-first in the response
    Ok(rows)
}

/// `PATCH /chat/messages {conversationId}`: marks all unread messages in
/// that conversation as read.
pub async fn mark_conversation_read(pool: &SqlitePool, conversation_id: &str) -> Result<(), NodeError> {
    sqlx::query("UPDATE chat_messages SET read_at = ? WHERE conversation_id = ? AND read_at IS NULL")
        .bind(Utc::now())
        .bind(conversation_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn test_state(pool: SqlitePool) -> AppState {
        use clap::Parser;
        let mut config = crate::config::NodeConfig::parse_from(["synapsis-node"]);
        config.node_domain = "a.example".into();
        AppState::new(pool, config, crate::crypto::KeyPair::generate()).unwrap()
    }

    async fn seed_local_user(pool: &SqlitePool, handle: &str, dm_privacy: &str, is_bot: bool) -> User {
        let kp = KeyPair::generate();
        let did = kp.public_key().to_did_key();
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO users (id, did, handle, public_key, dm_privacy, is_bot, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&did)
        .bind(handle)
        .bind(kp.public_key().to_base64())
        .bind(dm_privacy)
        .bind(is_bot)
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();
        sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(&id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn local_send_creates_message_in_both_conversations() {
        let pool = test_pool().await;
        let alice = seed_local_user(&pool, "alice", "everyone", false).await;
        let bob = seed_local_user(&pool, "bob", "everyone", false).await;
        let state = test_state(pool.clone()).await;

        send_message(
            &state,
            &alice,
            SendInput {
                recipient: "bob".into(),
                body: MessageBody::Plain("hi bob".into()),
                cross_node_envelope: None,
            },
        )
        .await
        .unwrap();

        let alice_conv: ChatConversation = sqlx::query_as(
            "SELECT * FROM chat_conversations WHERE participant1_id = ? AND participant2_handle = 'bob'",
        )
        .bind(&alice.id)
        .fetch_one(&pool)
        .await
        .unwrap();
        let bob_conv: ChatConversation = sqlx::query_as(
            "SELECT * FROM chat_conversations WHERE participant1_id = ? AND participant2_handle = 'alice'",
        )
        .bind(&bob.id)
        .fetch_one(&pool)
        .await
        .unwrap();

        let alice_messages = list_messages(&pool, &alice_conv.id, None).await.unwrap();
        let bob_messages = list_messages(&pool, &bob_conv.id, None).await.unwrap();
        assert_eq!(alice_messages.len(), 1);
        assert_eq!(bob_messages.len(), 1);
    }

    #[tokio::test]
    async fn dm_privacy_none_rejects_send() {
        let pool = test_pool().await;
        let alice = seed_local_user(&pool, "alice", "everyone", false).await;
        let _carol = seed_local_user(&pool, "carol", "none", false).await;
        let state = test_state(pool).await;

        let err = send_message(
            &state,
            &alice,
            SendInput {
                recipient: "carol".into(),
                body: MessageBody::Plain("hi".into()),
                cross_node_envelope: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NodeError::Forbidden(_)));
    }

    #[tokio::test]
    async fn dm_privacy_following_requires_follow() {
        let pool = test_pool().await;
        let dave = seed_local_user(&pool, "dave", "everyone", false).await;
        let carol = seed_local_user(&pool, "carol", "following", false).await;
        let state = test_state(pool.clone()).await;

        let err = send_message(
            &state,
            &dave,
            SendInput {
                recipient: "carol".into(),
                body: MessageBody::Plain("hi carol".into()),
                cross_node_envelope: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NodeError::Forbidden(_)));

        sqlx::query("INSERT INTO follows (id, follower_id, followee, created_at) VALUES (?, ?, ?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(&carol.id)
            .bind(&dave.did)
            .bind(Utc::now())
            .execute(&pool)
            .await
            .unwrap();

        send_message(
            &state,
            &dave,
            SendInput {
                recipient: "carol".into(),
                body: MessageBody::Plain("hi carol".into()),
                cross_node_envelope: None,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn bot_recipient_always_rejected() {
        let pool = test_pool().await;
        let alice = seed_local_user(&pool, "alice", "everyone", false).await;
        let _bot = seed_local_user(&pool, "helper_bot", "everyone", true).await;
        let state = test_state(pool).await;

        let err = send_message(
            &state,
            &alice,
            SendInput {
                recipient: "helper_bot".into(),
                body: MessageBody::Plain("hi".into()),
                cross_node_envelope: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NodeError::Forbidden(_)));
    }
}
