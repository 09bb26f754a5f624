//! Discovery & Gossip engine (C7, spec §4.7). Grounded in the teacher's
//! `federation::peer_connection_loop` backoff/retry idiom
//! (`umbra-relay/src/federation.rs`), re-expressed as periodic HTTP
//! POSTs instead of a persistent WebSocket mesh connection per peer, since
//! the swarm protocol here is request/response JSON over HTTPS (spec §6).

use chrono::Utc;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::models::{HandleRegistryRow, SwarmNode};
use crate::error::NodeError;
use crate::node_signature::{
    self, NodeEnvelopeHeaders, SIGNATURE_HEADER, SOURCE_DOMAIN_HEADER, TIMESTAMP_HEADER,
};
use crate::state::AppState;

const GOSSIP_SAMPLE_SIZE: usize = 3;
const GOSSIP_DELTA_CAP: i64 = 200;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncePayload {
    pub domain: String,
    pub public_key: String,
    pub software_version: String,
    pub capabilities: Vec<String>,
    pub user_count: i64,
    pub post_count: i64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDirectoryEntry {
    pub domain: String,
    pub public_key: Option<String>,
    pub software_version: Option<String>,
    pub user_count: i64,
    pub post_count: i64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleDirectoryEntry {
    pub handle: String,
    pub node_domain: String,
    pub did: String,
    pub updated_at: chrono::DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
pub struct GossipPayload {
    pub sender: String,
    pub nodes: Vec<NodeDirectoryEntry>,
    pub handles: Vec<HandleDirectoryEntry>,
    pub since: Option<chrono::DateTime<Utc>>,
    /// Echoes the round's timestamp per spec §6's gossip wire shape. The
    /// authoritative freshness/signature check still runs on the node
    /// envelope headers (C6); this field is informational only.
    pub ts: i64,
}

async fn local_announce_payload(state: &AppState) -> Result<AnnouncePayload, NodeError> {
    let user_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE is_remote = 0")
        .fetch_one(&state.pool)
        .await?;
    let post_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE is_removed = 0")
        .fetch_one(&state.pool)
        .await?;
    Ok(AnnouncePayload {
        domain: state.config.node_domain.clone(),
        public_key: state.node_keypair.public_key().to_base64(),
        software_version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: vec!["posts".into(), "dm".into(), "gossip".into()],
        user_count: user_count.0,
        post_count: post_count.0,
    })
}

fn node_signed_request(
    client: &reqwest::Client,
    url: &str,
    domain: &str,
    headers: &NodeEnvelopeHeaders,
) -> reqwest::RequestBuilder {
    client
        .post(url)
        .header(SIGNATURE_HEADER, &headers.signature)
        .header(SOURCE_DOMAIN_HEADER, domain)
        .header(TIMESTAMP_HEADER, headers.ts.to_string())
}

/// Announces this node's info to every configured seed (spec §4.7), run once
/// at startup by the scheduler after a 10s delay.
pub async fn announce_to_seeds(state: &AppState) -> Result<(), NodeError> {
    let payload = local_announce_payload(state).await?;
    let body = serde_json::to_value(&payload).map_err(|e| NodeError::Internal(e.to_string()))?;

    for seed in state.config.seed_node_list() {
        let headers = node_signature::sign_node_envelope(&state.node_keypair, &state.config.node_domain, &body)?;
        let url = format!("https://{seed}/swarm/announce");
        let result = node_signed_request(&state.http_client, &url, &state.config.node_domain, &headers)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                if let Ok(peer_info) = resp.json::<AnnouncePayload>().await {
                    node_signature::upsert_node(
                        &state.pool,
                        &peer_info.domain,
                        Some(&peer_info.public_key),
                        Some(&peer_info.software_version),
                        peer_info.user_count,
                        peer_info.post_count,
                    )
                    .await?;
                }
                node_signature::mark_node_success(&state.pool, &seed).await?;
            }
            _ => {
                tracing::warn!(seed, "announce to seed failed");
                node_signature::mark_node_failure(&state.pool, &seed).await?;
            }
        }
    }
    Ok(())
}

/// One gossip round (spec §4.7): exchange node/handle directory deltas with
/// a random sample of known-alive peers. Ordering guarantees: none.
pub async fn gossip_round(state: &AppState) -> Result<(), NodeError> {
    let alive: Vec<SwarmNode> = sqlx::query_as(
        "SELECT * FROM swarm_nodes WHERE failure_count < ? AND domain != ?",
    )
    .bind(node_signature::DEAD_NODE_FAILURE_THRESHOLD)
    .bind(&state.config.node_domain)
    .fetch_all(&state.pool)
    .await?;

    let mut rng = rand::thread_rng();
    let sample: Vec<&SwarmNode> = alive
        .choose_multiple(&mut rng, GOSSIP_SAMPLE_SIZE.min(alive.len()))
        .collect();

    for peer in sample {
        let since = state
            .last_sync_times
            .get(&peer.domain)
            .map(|entry| *entry.value());

        let nodes = delta_nodes(&state.pool, since).await?;
        let handles = delta_handles(&state.pool, since).await?;
        let payload = GossipPayload {
            sender: state.config.node_domain.clone(),
            nodes,
            handles,
            since,
            ts: Utc::now().timestamp_millis(),
        };
        let body = serde_json::to_value(&payload).map_err(|e| NodeError::Internal(e.to_string()))?;
        let headers = node_signature::sign_node_envelope(&state.node_keypair, &state.config.node_domain, &body)?;
        let url = format!("https://{}/swarm/gossip", peer.domain);

        let result = node_signed_request(&state.http_client, &url, &state.config.node_domain, &headers)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                if let Ok(reply) = resp.json::<GossipPayload>().await {
                    apply_gossip(&state.pool, reply).await?;
                }
                node_signature::mark_node_success(&state.pool, &peer.domain).await?;
                state.last_sync_times.insert(peer.domain.clone(), Utc::now());
            }
            _ => {
                tracing::warn!(peer = %peer.domain, "gossip round failed");
                node_signature::mark_node_failure(&state.pool, &peer.domain).await?;
            }
        }
    }
    Ok(())
}

async fn delta_nodes(
    pool: &SqlitePool,
    since: Option<chrono::DateTime<Utc>>,
) -> Result<Vec<NodeDirectoryEntry>, NodeError> {
    let rows: Vec<SwarmNode> = match since {
        Some(ts) => {
            sqlx::query_as("SELECT * FROM swarm_nodes WHERE last_seen_at > ? ORDER BY last_seen_at DESC LIMIT ?")
                .bind(ts)
                .bind(GOSSIP_DELTA_CAP)
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query_as("SELECT * FROM swarm_nodes ORDER BY last_seen_at DESC LIMIT ?")
                .bind(GOSSIP_DELTA_CAP)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(rows
        .into_iter()
        .map(|n| NodeDirectoryEntry {
            domain: n.domain,
            public_key: n.public_key,
            software_version: n.software_version,
            user_count: n.user_count,
            post_count: n.post_count,
        })
        .collect())
}

async fn delta_handles(
    pool: &SqlitePool,
    since: Option<chrono::DateTime<Utc>>,
) -> Result<Vec<HandleDirectoryEntry>, NodeError> {
    let rows: Vec<HandleRegistryRow> = match since {
        Some(ts) => {
            sqlx::query_as("SELECT * FROM handle_registry WHERE updated_at > ? ORDER BY updated_at DESC LIMIT ?")
                .bind(ts)
                .bind(GOSSIP_DELTA_CAP)
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query_as("SELECT * FROM handle_registry ORDER BY updated_at DESC LIMIT ?")
                .bind(GOSSIP_DELTA_CAP)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(rows
        .into_iter()
        .map(|h| HandleDirectoryEntry {
            handle: h.handle,
            node_domain: h.node_domain,
            did: h.did,
            updated_at: h.updated_at,
        })
        .collect())
}

/// Merges an inbound gossip payload: node entries are upserted, handle
/// entries merge by taking the most recent `updatedAt` per `(handle,
/// nodeDomain)` (spec §4.7, P7 commutative/associative merge).
pub async fn apply_gossip(pool: &SqlitePool, payload: GossipPayload) -> Result<(), NodeError> {
    for node in payload.nodes {
        node_signature::upsert_node(
            pool,
            &node.domain,
            node.public_key.as_deref(),
            node.software_version.as_deref(),
            node.user_count,
            node.post_count,
        )
        .await?;
    }

    for handle in payload.handles {
        let existing: Option<HandleRegistryRow> = sqlx::query_as(
            "SELECT * FROM handle_registry WHERE handle = ? AND node_domain = ?",
        )
        .bind(&handle.handle)
        .bind(&handle.node_domain)
        .fetch_optional(pool)
        .await?;

        if existing.as_ref().map(|e| e.updated_at) < Some(handle.updated_at) {
            sqlx::query(
                r#"INSERT INTO handle_registry (handle, node_domain, did, updated_at)
                   VALUES (?, ?, ?, ?)
                   ON CONFLICT (handle, node_domain) DO UPDATE SET
                     did = excluded.did, updated_at = excluded.updated_at"#,
            )
            .bind(&handle.handle)
            .bind(&handle.node_domain)
            .bind(&handle.did)
            .bind(handle.updated_at)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
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
    async fn gossip_merge_keeps_most_recent_update() {
        let pool = test_pool().await;
        let older = Utc::now() - chrono::Duration::minutes(10);
        let newer = Utc::now();

        apply_gossip(
            &pool,
            GossipPayload {
                sender: "a.example".into(),
                nodes: vec![],
                handles: vec![HandleDirectoryEntry {
                    handle: "alice".into(),
                    node_domain: "a.example".into(),
                    did: "did:key:old".into(),
                    updated_at: older,
                }],
                since: None,
                ts: 0,
            },
        )
        .await
        .unwrap();

        apply_gossip(
            &pool,
            GossipPayload {
                sender: "b.example".into(),
                nodes: vec![],
                handles: vec![HandleDirectoryEntry {
                    handle: "alice".into(),
                    node_domain: "a.example".into(),
                    did: "did:key:new".into(),
                    updated_at: newer,
                }],
                since: None,
                ts: 0,
            },
        )
        .await
        .unwrap();

        let row: HandleRegistryRow = sqlx::query_as(
            "SELECT * FROM handle_registry WHERE handle = ? AND node_domain = ?",
        )
        .bind("alice")
        .bind("a.example")
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(row.did, "did:key:new");
    }

    #[tokio::test]
    async fn stale_handle_update_does_not_overwrite_newer() {
        let pool = test_pool().await;
        let older = Utc::now() - chrono::Duration::minutes(10);
        let newer = Utc::now();

        apply_gossip(
            &pool,
            GossipPayload {
                sender: "b.example".into(),
                nodes: vec![],
                handles: vec![HandleDirectoryEntry {
                    handle: "alice".into(),
                    node_domain: "a.example".into(),
                    did: "did:key:new".into(),
                    updated_at: newer,
                }],
                since: None,
                ts: 0,
            },
        )
        .await
        .unwrap();

        apply_gossip(
            &pool,
            GossipPayload {
                sender: "a.example".into(),
                nodes: vec![],
                handles: vec![HandleDirectoryEntry {
                    handle: "alice".into(),
                    node_domain: "a.example".into(),
                    did: "did:key:old".into(),
                    updated_at: older,
                }],
                since: None,
                ts: 0,
            },
        )
        .await
        .unwrap();

        let row: HandleRegistryRow = sqlx::query_as(
            "SELECT * FROM handle_registry WHERE handle = ? AND node_domain = ?",
        )
        .bind("alice")
        .bind("a.example")
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(row.did, "did:key:new");
    }
}
