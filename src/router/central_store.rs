//! Central database access for the router: `collection` and `node` tables
//! guarded by the "supervised DB interaction" pattern --
//! one connection, one mutex, unbounded retry on transient errors.

use std::time::Duration;

use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection, PgConnection, Row};
use tokio::sync::Mutex;

use crate::error::RouterError;
use crate::model::{ClusterHosts, NodeHost};

use super::cache::{ClusterCache, CollectionCache};

/// Central-DB lookups needed by the router. Each method is handed the cache
/// it backs so the check-and-populate can happen on the far side of the
/// connection mutex -- see [`CentralDb::run`].
pub trait ClusterDirectory: Send + Sync {
    fn cluster_id_for_collection(
        &self,
        collection: &str,
        cache: &CollectionCache,
    ) -> impl std::future::Future<Output = Result<Option<i64>, RouterError>> + Send;

    fn hosts_for_cluster(
        &self,
        cluster_id: i64,
        cache: &ClusterCache,
    ) -> impl std::future::Future<Output = Result<ClusterHosts, RouterError>> + Send;
}

struct ConnSlot {
    conn: PgConnection,
    generation: u64,
}

/// A single Postgres connection guarded by a mutex, reconnecting with
/// unbounded retry on transient errors. Mirrors
/// `_supervise_db_interaction` in the reference `web_director_main.py`,
/// including a fix for a reconnect race: the generation observed
/// right after a failed query is compared against the generation seen
/// after re-acquiring the lock post-sleep, so a waiter whose connection was
/// already replaced by someone else doesn't reconnect a second time.
pub struct CentralDb {
    database_url: String,
    slot: Mutex<Option<ConnSlot>>,
}

/// Classify a `sqlx::Error` as transient (worth an unbounded retry) versus
/// a real query/programming error that should propagate immediately.
fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
    )
}

impl CentralDb {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            slot: Mutex::new(None),
        }
    }

    /// Establish the initial connection. The router blocks all routing
    /// decisions on this completing.
    pub async fn connect(&self) {
        let conn = retry_connect(&self.database_url).await;
        *self.slot.lock().await = Some(ConnSlot {
            conn,
            generation: 0,
        });
    }

    /// Run `query_fn` against the live connection, retrying forever on a
    /// transient error.
    ///
    /// `cache_check` is polled once before even trying for the mutex (the
    /// fast path for an already-warm key) and again right after the mutex is
    /// acquired. That second check is what actually suppresses a thundering
    /// herd: if N callers race on the same cold key, the first one through
    /// the mutex runs `query_fn` and calls `cache_store` -- still holding the
    /// guard -- before returning, so every waiter queued behind it sees a
    /// cache hit the instant it gets the lock instead of repeating the
    /// query. Mirrors `_supervise_db_interaction` in the reference
    /// `web_director_main.py`, which performs the same cache-then-query dance
    /// under its single connection lock.
    async fn run<T, Q>(
        &self,
        mut query_fn: Q,
        cache_check: impl Fn() -> Option<T>,
        cache_store: impl Fn(&T),
    ) -> Result<T, RouterError>
    where
        Q: for<'c> FnMut(
            &'c mut PgConnection,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<T, sqlx::Error>> + Send + 'c>,
        >,
    {
        let mut observed_generation: Option<u64> = None;

        loop {
            if let Some(pre_sleep_generation) = observed_generation {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let guard = self.slot.lock().await;
                let current_generation = guard
                    .as_ref()
                    .map(|s| s.generation)
                    .unwrap_or(pre_sleep_generation);
                if current_generation != pre_sleep_generation {
                    // Someone else already reconnected while we slept;
                    // don't reconnect again, just retry the query below.
                    drop(guard);
                } else {
                    drop(guard);
                    let mut guard = self.slot.lock().await;
                    if let Some(slot) = guard.as_mut() {
                        tracing::warn!(generation = slot.generation, "replacing central db connection");
                        slot.conn = retry_connect(&self.database_url).await;
                        slot.generation += 1;
                    }
                    drop(guard);
                }
            }

            if let Some(hit) = cache_check() {
                return Ok(hit);
            }

            let mut guard = self.slot.lock().await;

            // Re-check now that we hold the connection mutex: a waiter that
            // queued behind the first caller to resolve this key may find it
            // already cached and skip the query entirely.
            if let Some(hit) = cache_check() {
                return Ok(hit);
            }

            let slot = guard.as_mut().expect("connect() must run before queries");
            match query_fn(&mut slot.conn).await {
                Ok(value) => {
                    cache_store(&value);
                    return Ok(value);
                }
                Err(err) if is_transient(&err) => {
                    observed_generation = Some(slot.generation);
                }
                Err(err) => return Err(RouterError::DbTransient(err)),
            }
        }
    }
}

async fn retry_connect(database_url: &str) -> PgConnection {
    let opts: PgConnectOptions = database_url.parse().expect("valid postgres url");
    loop {
        match opts.clone().connect().await {
            Ok(conn) => return conn,
            Err(err) => {
                tracing::warn!(error = %err, "central db connect failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

impl ClusterDirectory for CentralDb {
    async fn cluster_id_for_collection(
        &self,
        collection: &str,
        cache: &CollectionCache,
    ) -> Result<Option<i64>, RouterError> {
        let collection = collection.to_owned();
        let cache_key = collection.clone();
        self.run(
            move |conn| {
                let collection = collection.clone();
                Box::pin(async move {
                    let row = sqlx::query(
                        "SELECT cluster_id FROM collection WHERE name = $1 AND deletion_time IS NULL",
                    )
                    .bind(collection)
                    .fetch_optional(conn)
                    .await?;
                    Ok(row.map(|r| r.get::<i64, _>("cluster_id")))
                })
            },
            || cache.get(&cache_key),
            |value| cache.put(cache_key.clone(), *value),
        )
        .await
    }

    async fn hosts_for_cluster(
        &self,
        cluster_id: i64,
        cache: &ClusterCache,
    ) -> Result<ClusterHosts, RouterError> {
        self.run(
            move |conn| {
                Box::pin(async move {
                    let rows = sqlx::query(
                        "SELECT name, hostname, node_number_in_cluster FROM node \
                         WHERE cluster_id = $1 ORDER BY node_number_in_cluster",
                    )
                    .bind(cluster_id)
                    .fetch_all(conn)
                    .await?;
                    Ok(rows
                        .into_iter()
                        .map(|r| NodeHost {
                            node_name: r.get("name"),
                            hostname: r.get("hostname"),
                            node_number_in_cluster: r.get("node_number_in_cluster"),
                        })
                        .collect::<Vec<_>>())
                })
            },
            || cache.get(cluster_id).map(|hosts| hosts.hosts),
            |hosts: &Vec<NodeHost>| {
                cache.put(ClusterHosts {
                    cluster_id,
                    hosts: hosts.clone(),
                })
            },
        )
        .await
        .map(|hosts| ClusterHosts { cluster_id, hosts })
    }
}
