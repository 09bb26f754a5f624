//! TOFU (Trust-On-First-Use) cache of remote public keys (C5, spec §4.5).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use sqlx::SqlitePool;

use crate::db::models::RemoteIdentityCacheRow;
use crate::error::NodeError;

const TTL: ChronoDuration = ChronoDuration::hours(1);

pub struct ResolveOutcome {
    pub public_key: String,
    pub from_cache: bool,
    pub key_changed: bool,
}

/// Resolves `did`'s current public key, consulting the TTL'd cache first and
/// falling back to `fetcher` (expected to hit the owning node's well-known
/// endpoint) on a miss or expiry (spec §4.5).
pub async fn resolve_remote_key<'a>(
    pool: &SqlitePool,
    did: &str,
    fetcher: impl FnOnce() -> BoxFuture<'a, Result<String, NodeError>>,
    allow_key_rotation: bool,
) -> Result<ResolveOutcome, NodeError> {
    let now = Utc::now();
    let cached: Option<RemoteIdentityCacheRow> =
        sqlx::query_as("SELECT * FROM remote_identity_cache WHERE did = ?")
            .bind(did)
            .fetch_optional(pool)
            .await?;

    if let Some(row) = &cached {
        if row.expires_at > now {
            return Ok(ResolveOutcome {
                public_key: row.public_key.clone(),
                from_cache: true,
                key_changed: false,
            });
        }
    }

    let fetched = match fetcher().await {
        Ok(key) => key,
        Err(err) => {
            return match cached {
                Some(row) => Ok(ResolveOutcome {
                    public_key: row.public_key,
                    from_cache: true,
                    key_changed: false,
                }),
                None => Err(NodeError::UpstreamUnreachable(err.to_string())),
            };
        }
    };

    match cached {
        None => {
            store(pool, did, &fetched, now).await?;
            Ok(ResolveOutcome {
                public_key: fetched,
                from_cache: false,
                key_changed: false,
            })
        }
        Some(row) if row.public_key == fetched => {
            store(pool, did, &fetched, now).await?;
            Ok(ResolveOutcome {
                public_key: fetched,
                from_cache: false,
                key_changed: false,
            })
        }
        Some(row) => {
            if allow_key_rotation {
                store(pool, did, &fetched, now).await?;
                Ok(ResolveOutcome {
                    public_key: fetched,
                    from_cache: false,
                    key_changed: true,
                })
            } else {
                // Default policy: reject the rotation, keep serving the pinned key.
                Ok(ResolveOutcome {
                    public_key: row.public_key,
                    from_cache: true,
                    key_changed: true,
                })
            }
        }
    }
}

async fn store(
    pool: &SqlitePool,
    did: &str,
    public_key: &str,
    fetched_at: DateTime<Utc>,
) -> Result<(), NodeError> {
    let expires_at = fetched_at + TTL;
    sqlx::query(
        r#"INSERT INTO remote_identity_cache (did, public_key, fetched_at, expires_at)
           VALUES (?, ?, ?, ?)
           ON CONFLICT (did) DO UPDATE SET
             public_key = excluded.public_key,
             fetched_at = excluded.fetched_at,
             expires_at = excluded.expires_at"#,
    )
    .bind(did)
    .bind(public_key)
    .bind(fetched_at)
    .bind(expires_at)
    .execute(pool)
    .await?;
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
    async fn first_call_is_not_from_cache_second_call_is() {
        let pool = test_pool().await;
        let did = "did:key:remote-alice";

        let outcome1 = resolve_remote_key(
            &pool,
            did,
            || Box::pin(async { Ok("pubkey-v1".to_string()) }),
            false,
        )
        .await
        .unwrap();
        assert!(!outcome1.from_cache);
        assert!(!outcome1.key_changed);

        let outcome2 = resolve_remote_key(
            &pool,
            did,
            || Box::pin(async { Ok("pubkey-v1".to_string()) }),
            false,
        )
        .await
        .unwrap();
        assert!(outcome2.from_cache);
    }

    #[tokio::test]
    async fn key_change_is_rejected_by_default() {
        let pool = test_pool().await;
        let did = "did:key:remote-bob";
        resolve_remote_key(&pool, did, || Box::pin(async { Ok("old-key".to_string()) }), false)
            .await
            .unwrap();

        // Force expiry so the next call re-fetches.
        sqlx::query("UPDATE remote_identity_cache SET expires_at = datetime('now', '-1 hour')")
            .execute(&pool)
            .await
            .unwrap();

        let outcome = resolve_remote_key(
            &pool,
            did,
            || Box::pin(async { Ok("new-key".to_string()) }),
            false,
        )
        .await
        .unwrap();
        assert!(outcome.key_changed);
        assert_eq!(outcome.public_key, "old-key");
    }

    #[tokio::test]
    async fn key_change_is_accepted_when_rotation_allowed() {
        let pool = test_pool().await;
        let did = "did:key:remote-carol";
        resolve_remote_key(&pool, did, || Box::pin(async { Ok("old-key".to_string()) }), true)
            .await
            .unwrap();
        sqlx::query("UPDATE remote_identity_cache SET expires_at = datetime('now', '-1 hour')")
            .execute(&pool)
            .await
            .unwrap();

        let outcome = resolve_remote_key(
            &pool,
            did,
            || Box::pin(async { Ok("new-key".to_string()) }),
            true,
        )
        .await
        .unwrap();
        assert!(outcome.key_changed);
        assert_eq!(outcome.public_key, "new-key");
    }
}
