//! Background scheduler (C11, spec §4.11): a single-process periodic task
//! runner that drives discovery/gossip (C7) and remote-follow sync (C9).
//! Grounded in the teacher's `tokio::spawn` + `tokio::time::interval`
//! periodic-task idiom in `main.rs` (presence heartbeat, cleanup sweep),
//! generalized to the four independent tasks spec §4.11 names, each inside
//! its own recover-and-log boundary so one failing task cannot halt the
//! others.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::discovery;
use crate::pull;
use crate::state::AppState;

/// Starts the scheduler's periodic tasks. Idempotent: a second call is a
/// no-op, guarded by `AppState::scheduler_started` (spec §4.11, §5).
pub fn start(state: AppState) {
    if state
        .scheduler_started
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        tracing::debug!("scheduler already started, ignoring duplicate start()");
        return;
    }

    spawn_after_delay(state.clone(), Duration::from_secs(10), Duration::ZERO, "announce-to-seeds", |state| {
        Box::pin(async move {
            discovery::announce_to_seeds(&state).await
        })
    });

    spawn_after_delay(
        state.clone(),
        Duration::from_secs(30),
        Duration::from_secs(300),
        "gossip-round",
        |state| Box::pin(async move { discovery::gossip_round(&state).await }),
    );

    spawn_after_delay(
        state,
        Duration::from_secs(15),
        Duration::from_secs(60),
        "remote-follow-sync",
        |state| Box::pin(async move { pull::refresh_remote_follows(&state).await }),
    );
}

/// Runs `task` once after `initial_delay`, then every `period` after that
/// (or just once if `period` is zero). Each tick is wrapped in a
/// recover-and-log boundary: an `Err` is logged and the loop continues
/// (spec §4.11 "Tasks are independent ... one failure cannot halt the
/// scheduler").
fn spawn_after_delay<F>(state: AppState, initial_delay: Duration, period: Duration, name: &'static str, task: F)
where
    F: Fn(AppState) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), crate::error::NodeError>> + Send>>
        + Send
        + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(initial_delay).await;
        loop {
            match task(state.clone()).await {
                Ok(()) => tracing::debug!(task = name, "scheduled task completed"),
                Err(e) => tracing::warn!(task = name, error = %e, "scheduled task failed"),
            }
            if period.is_zero() {
                break;
            }
            tokio::time::sleep(period).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_state() -> AppState {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let config = crate::config::NodeConfig::parse_from(["synapsis-node"]);
        AppState::new(pool, config, crate::crypto::KeyPair::generate()).unwrap()
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let state = test_state().await;
        start(state.clone());
        assert!(state.scheduler_started.load(Ordering::SeqCst));
        // A second call must not panic or spawn duplicate tasks.
        start(state.clone());
        assert!(state.scheduler_started.load(Ordering::SeqCst));
    }
}
