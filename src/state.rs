//! Shared application state, the same role `RelayState` plays in the
//! teacher: one `Clone`-able struct threaded through every handler via
//! `axum::extract::State`, holding the DB pool, this node's long-term
//! keypair, and the in-process caches spec §5 calls out as needing
//! concurrency-safe guarding.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sqlx::SqlitePool;

use crate::config::NodeConfig;
use crate::crypto::KeyPair;
use crate::error::NodeError;
use crate::rate_limit::RateLimiter;

/// One entry of the 1-minute-TTL curated-timeline cache (spec §5).
pub struct TimelineCacheEntry {
    pub posts_json: String,
    pub cached_at: std::time::Instant,
}

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<NodeConfig>,
    pub node_keypair: Arc<KeyPair>,
    pub rate_limiter: Arc<RateLimiter>,
    pub http_client: reqwest::Client,
    /// `lastSyncTimes` for remote-follow-sync (spec §5), keyed by `handle@domain`.
    pub last_sync_times: Arc<DashMap<String, chrono::DateTime<chrono::Utc>>>,
    /// Swarm-timeline cache, 1-minute TTL (spec §5), keyed by cache key (e.g. `curated:{user_id}`).
    pub timeline_cache: Arc<DashMap<String, TimelineCacheEntry>>,
    /// Guards `BackgroundScheduler::start()` idempotency (spec §4.11, §5).
    pub scheduler_started: Arc<std::sync::atomic::AtomicBool>,
}

impl AppState {
    /// Builds application state around an already-loaded node keypair. The
    /// keypair is loaded once at startup via
    /// `node_signature::load_or_create_node_keypair` rather than generated
    /// here, since it must stay stable across restarts (spec §4.6).
    pub fn new(pool: SqlitePool, config: NodeConfig, node_keypair: KeyPair) -> Result<Self, NodeError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_client_timeout_secs))
            .build()
            .map_err(|e| NodeError::Internal(format!("failed to build http client: {e}")))?;

        Ok(AppState {
            pool,
            config: Arc::new(config),
            node_keypair: Arc::new(node_keypair),
            rate_limiter: Arc::new(RateLimiter::new()),
            http_client,
            last_sync_times: Arc::new(DashMap::new()),
            timeline_cache: Arc::new(DashMap::new()),
            scheduler_started: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[tokio::test]
    async fn state_creation_succeeds() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let config = NodeConfig::parse_from(["synapsis-node"]);
        let state = AppState::new(pool, config, KeyPair::generate()).unwrap();
        assert!(state.rate_limiter.check("did:key:test"));
    }
}
