//! HTTP surface (C12, spec §6): the public client API and the swarm
//! protocol, wrapping every other component. Grounded in the teacher's
//! router-merge idiom in `main.rs` (one `Router` per concern, `.merge`d
//! together under a shared `CorsLayer`/`TraceLayer`).

mod account;
mod auth;
mod chat;
mod feed;
mod notifications;
mod posts;
mod session;
mod swarm;
mod users;

use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Builds the full application router: the public client-facing surface
/// plus the node-to-node swarm protocol, both against the same `AppState`.
pub fn router(state: AppState) -> Router {
    let public_api = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/posts", post(posts::create_post).get(posts::list_posts))
        .route("/posts/:id/like", post(posts::like).delete(posts::unlike))
        .route("/posts/:id/repost", post(posts::repost).delete(posts::unrepost))
        .route("/users/:handle", get(users::get_user))
        .route("/users/:handle/follow", post(users::follow).delete(users::unfollow))
        .route("/notifications", get(notifications::list).patch(notifications::mark_read))
        .route("/chat/send", post(chat::send))
        .route("/chat/messages", get(chat::list_messages).patch(chat::mark_read))
        .route("/account/export", post(account::export));

    let swarm_api = Router::new()
        .route("/swarm/info", get(swarm::info))
        .route("/swarm/announce", post(swarm::announce))
        .route("/swarm/gossip", post(swarm::gossip))
        .route("/swarm/users/:handle", get(swarm::get_profile))
        .route("/swarm/users/:handle/following", get(swarm::following))
        .route("/swarm/users/:handle/followers", get(swarm::followers))
        .route("/swarm/posts/:id", get(swarm::get_post))
        .route("/swarm/interactions/:verb", post(swarm::interaction))
        .route("/chat/receive", post(swarm::chat_receive))
        .route("/.well-known/synapsis-swarm", get(swarm::well_known));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .merge(public_api)
        .merge(swarm_api)
        .route("/health", get(health))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "service": "synapsis-node",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
