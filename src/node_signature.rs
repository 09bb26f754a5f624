//! Node-signature layer (C6, spec §4.6): signs and verifies node-to-node
//! HTTP envelopes, and owns the `SwarmNode` registry. Grounded in the
//! teacher's `federation::PeerInfo`/`Federation` registry idiom
//! (`umbra-relay/src/federation.rs`), re-expressed over HTTP headers instead
//! of a persistent WebSocket mesh connection per peer.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::crypto::canonical::canonical_json;
use crate::crypto::keys::{KeyPair, PublicKey};
use crate::db::models::SwarmNode;
use crate::error::{NodeError, SignatureFailure};

pub const SIGNATURE_HEADER: &str = "X-Swarm-Signature";
pub const SOURCE_DOMAIN_HEADER: &str = "X-Swarm-Source-Domain";
pub const TIMESTAMP_HEADER: &str = "X-Swarm-Timestamp";
const FRESHNESS_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Builds the bytes that get node-signed: the canonical body plus a
/// `(ts, sourceDomain)` tuple, per spec §4.6.
fn signable_bytes(body: &serde_json::Value, ts: i64, source_domain: &str) -> Result<Vec<u8>, NodeError> {
    let wrapper = serde_json::json!({
        "body": body,
        "ts": ts,
        "sourceDomain": source_domain,
    });
    Ok(canonical_json(&wrapper)?.into_bytes())
}

pub struct NodeEnvelopeHeaders {
    pub signature: String,
    pub source_domain: String,
    pub ts: i64,
}

/// Signs an outbound node-to-node request body with this node's long-term
/// keypair (spec §4.6).
pub fn sign_node_envelope(
    keypair: &KeyPair,
    domain: &str,
    body: &serde_json::Value,
) -> Result<NodeEnvelopeHeaders, NodeError> {
    let ts = Utc::now().timestamp_millis();
    let bytes = signable_bytes(body, ts, domain)?;
    let signature = keypair.sign(&bytes);
    Ok(NodeEnvelopeHeaders {
        signature,
        source_domain: domain.to_string(),
        ts,
    })
}

/// Verifies an inbound node envelope against the sender's registered public
/// key, rejecting on mismatch, stale timestamp, or unknown node (spec §4.6).
pub async fn verify_node_envelope(
    pool: &SqlitePool,
    body: &serde_json::Value,
    headers: &NodeEnvelopeHeaders,
) -> Result<(), NodeError> {
    let now_ms = Utc::now().timestamp_millis();
    if (now_ms - headers.ts).abs() > FRESHNESS_WINDOW_MS {
        return Err(NodeError::InvalidSignature(SignatureFailure::StaleTimestamp));
    }

    let node: Option<SwarmNode> = sqlx::query_as("SELECT * FROM swarm_nodes WHERE domain = ?")
        .bind(&headers.source_domain)
        .fetch_optional(pool)
        .await?;
    let node = node.ok_or(NodeError::InvalidSignature(SignatureFailure::UnknownSigner))?;
    let public_key_b64 = node
        .public_key
        .ok_or(NodeError::InvalidSignature(SignatureFailure::UnknownSigner))?;
    let public_key = PublicKey::from_spki_base64(&public_key_b64)?;

    let bytes = signable_bytes(body, headers.ts, &headers.source_domain)?;
    public_key.verify(&bytes, &headers.signature)?;
    Ok(())
}

/// Loads this node's long-term keypair from `node_identity`, generating and
/// persisting one on first boot (spec §4.6: "each node has its own
/// long-term keypair" — it must survive restarts since peers pin it via
/// TOFU).
pub async fn load_or_create_node_keypair(pool: &SqlitePool) -> Result<KeyPair, NodeError> {
    let existing: Option<(Vec<u8>,)> =
        sqlx::query_as("SELECT private_key_der FROM node_identity WHERE id = 1")
            .fetch_optional(pool)
            .await?;
    if let Some((der,)) = existing {
        return KeyPair::from_pkcs8_der(&der);
    }

    let keypair = KeyPair::generate();
    let der = keypair.to_pkcs8_der()?;
    sqlx::query("INSERT INTO node_identity (id, private_key_der, created_at) VALUES (1, ?, ?)")
        .bind(&der)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(keypair)
}

/// Inserts or refreshes a node in the swarm registry (spec §3 SwarmNode,
/// §4.7). Nodes are never deleted, only marked dead via `failure_count`.
pub async fn upsert_node(
    pool: &SqlitePool,
    domain: &str,
    public_key: Option<&str>,
    software_version: Option<&str>,
    user_count: i64,
    post_count: i64,
) -> Result<(), NodeError> {
    let now = Utc::now();
    sqlx::query(
        r#"INSERT INTO swarm_nodes (domain, public_key, software_version, user_count, post_count, last_seen_at, failure_count)
           VALUES (?, ?, ?, ?, ?, ?, 0)
           ON CONFLICT (domain) DO UPDATE SET
             public_key = COALESCE(excluded.public_key, swarm_nodes.public_key),
             software_version = COALESCE(excluded.software_version, swarm_nodes.software_version),
             user_count = excluded.user_count,
             post_count = excluded.post_count,
             last_seen_at = excluded.last_seen_at,
             failure_count = 0"#,
    )
    .bind(domain)
    .bind(public_key)
    .bind(software_version)
    .bind(user_count)
    .bind(post_count)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub const DEAD_NODE_FAILURE_THRESHOLD: i64 = 5;

pub async fn mark_node_failure(pool: &SqlitePool, domain: &str) -> Result<(), NodeError> {
    sqlx::query("UPDATE swarm_nodes SET failure_count = failure_count + 1 WHERE domain = ?")
        .bind(domain)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_node_success(pool: &SqlitePool, domain: &str) -> Result<(), NodeError> {
    let now: DateTime<Utc> = Utc::now();
    sqlx::query("UPDATE swarm_nodes SET failure_count = 0, last_seen_at = ? WHERE domain = ?")
        .bind(now)
        .bind(domain)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn is_known_node(pool: &SqlitePool, domain: &str) -> Result<bool, NodeError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT domain FROM swarm_nodes WHERE domain = ?")
        .bind(domain)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

pub async fn is_node_alive(pool: &SqlitePool, domain: &str) -> Result<bool, NodeError> {
    let node: Option<SwarmNode> = sqlx::query_as("SELECT * FROM swarm_nodes WHERE domain = ?")
        .bind(domain)
        .fetch_optional(pool)
        .await?;
    Ok(match node {
        Some(n) => n.failure_count < DEAD_NODE_FAILURE_THRESHOLD,
        None => false,
    })
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

    #[tokio::test]
    async fn node_keypair_persists_across_loads() {
        let pool = test_pool().await;
        let first = load_or_create_node_keypair(&pool).await.unwrap();
        let second = load_or_create_node_keypair(&pool).await.unwrap();
        assert_eq!(first.public_key().to_base64(), second.public_key().to_base64());
    }

    #[tokio::test]
    async fn sign_then_verify_round_trips() {
        let pool = test_pool().await;
        let kp = KeyPair::generate();
        upsert_node(
            &pool,
            "peer.example",
            Some(&kp.public_key().to_base64()),
            Some("1.0"),
            10,
            20,
        )
        .await
        .unwrap();

        let body = serde_json::json!({"hello": "world"});
        let headers = sign_node_envelope(&kp, "peer.example", &body).unwrap();
        verify_node_envelope(&pool, &body, &headers).await.unwrap();
    }

    #[tokio::test]
    async fn verify_rejects_unknown_node() {
        let pool = test_pool().await;
        let kp = KeyPair::generate();
        let body = serde_json::json!({"hello": "world"});
        let headers = sign_node_envelope(&kp, "unregistered.example", &body).unwrap();
        let err = verify_node_envelope(&pool, &body, &headers).await.unwrap_err();
        assert!(matches!(
            err,
            NodeError::InvalidSignature(SignatureFailure::UnknownSigner)
        ));
    }

    #[tokio::test]
    async fn repeated_failures_mark_node_dead() {
        let pool = test_pool().await;
        upsert_node(&pool, "flaky.example", None, None, 0, 0).await.unwrap();
        for _ in 0..DEAD_NODE_FAILURE_THRESHOLD {
            mark_node_failure(&pool, "flaky.example").await.unwrap();
        }
        assert!(!is_node_alive(&pool, "flaky.example").await.unwrap());
    }
}
