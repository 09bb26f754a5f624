//! synapsis-node — a federated social-network node.
//!
//! Owns a set of local user identities, stores their posts and direct
//! messages, and coordinates with peer nodes over HTTP to form a swarm:
//! content produced locally is delivered to the nodes of interested users,
//! and content originating elsewhere is mirrored locally on demand. See
//! `DESIGN.md` for the grounding ledger and `SPEC_FULL.md` for the full
//! requirements this binary implements.

mod config;
mod crypto;
mod db;
mod delivery;
mod discovery;
mod dm;
mod error;
mod http;
mod identity;
mod node_signature;
mod pull;
mod rate_limit;
mod remote_identity;
mod scheduler;
mod signed_action;
mod state;

use clap::Parser;

use config::NodeConfig;
use state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "synapsis_node=info,tower_http=info".into()),
        )
        .init();

    let config = NodeConfig::parse();
    if config.node_domain.trim().is_empty() {
        tracing::error!("NEXT_PUBLIC_NODE_DOMAIN must not be empty");
        std::process::exit(1);
    }

    let pool = db::connect(&config.database_url)
        .await
        .expect("failed to open database / run migrations");
    let node_keypair = node_signature::load_or_create_node_keypair(&pool)
        .await
        .expect("failed to load or create node keypair");

    let bind_port = config.port;
    let seeds = config.seed_node_list();
    let state =
        AppState::new(pool, config, node_keypair).expect("failed to build application state");

    tracing::info!(
        domain = %state.config.node_domain,
        seeds = seeds.len(),
        did = %state.node_keypair.public_key().to_did_key(),
        "synapsis-node starting"
    );

    scheduler::start(state.clone());

    let app = http::router(state);
    let addr = format!("0.0.0.0:{bind_port}");
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app).await.expect("server error");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_defaults() {
        let config = NodeConfig::parse_from(["synapsis-node"]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.node_domain, "localhost");
    }
}
