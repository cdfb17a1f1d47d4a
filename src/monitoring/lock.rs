//! Monitor-scoped try-locks.
//!
//! Acquisition never waits: a caller that loses the race gets `None` and skips
//! its cycle. Guards release on every exit path; [`LockGuard::release`] does it
//! eagerly and `Drop` covers early returns and panics.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait MonitorLock: Send + Sync {
    async fn try_acquire(&self, monitor_id: i32) -> Result<Option<LockGuard>, LockError>;
}

enum Held {
    Local(Arc<DashMap<i32, ()>>),
    Advisory {
        conn: PoolConnection<Postgres>,
        namespace: i32,
    },
}

/// Proof of exclusive ownership of one monitor.
pub struct LockGuard {
    monitor_id: i32,
    held: Option<Held>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("monitor_id", &self.monitor_id).finish()
    }
}

impl LockGuard {
    pub fn monitor_id(&self) -> i32 {
        self.monitor_id
    }

    pub async fn release(mut self) {
        match self.held.take() {
            Some(Held::Local(map)) => {
                map.remove(&self.monitor_id);
            }
            Some(Held::Advisory { conn, namespace }) => {
                advisory_unlock(conn, namespace, self.monitor_id).await;
            }
            None => {}
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match self.held.take() {
            Some(Held::Local(map)) => {
                map.remove(&self.monitor_id);
            }
            Some(Held::Advisory { conn, namespace }) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(advisory_unlock(conn, namespace, self.monitor_id));
                }
                Err(_) => {
                    // Closing the session releases every advisory lock it holds.
                    drop(conn.detach());
                }
            },
            None => {}
        }
    }
}

async fn advisory_unlock(mut conn: PoolConnection<Postgres>, namespace: i32, monitor_id: i32) {
    let result: Result<bool, sqlx::Error> = sqlx::query_scalar("SELECT pg_advisory_unlock($1, $2)")
        .bind(namespace)
        .bind(monitor_id)
        .fetch_one(&mut *conn)
        .await;
    match result {
        Ok(true) => {}
        Ok(false) => warn!(monitor_id, "Advisory lock was not held at release."),
        Err(e) => {
            warn!(monitor_id, error = %e, "Failed to release advisory lock; closing the session instead.");
            drop(conn.detach());
        }
    }
}

/// In-process lock map. Correct for a single process only.
#[derive(Default, Clone)]
pub struct LocalLockMap {
    held: Arc<DashMap<i32, ()>>,
}

impl LocalLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_lock(&self, monitor_id: i32) -> Option<LockGuard> {
        match self.held.entry(monitor_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Some(LockGuard {
                    monitor_id,
                    held: Some(Held::Local(self.held.clone())),
                })
            }
        }
    }

    pub fn is_locked(&self, monitor_id: i32) -> bool {
        self.held.contains_key(&monitor_id)
    }
}

#[async_trait]
impl MonitorLock for LocalLockMap {
    async fn try_acquire(&self, monitor_id: i32) -> Result<Option<LockGuard>, LockError> {
        Ok(self.try_lock(monitor_id))
    }
}

/// Session-level PostgreSQL advisory lock keyed by `(namespace, monitor_id)`.
///
/// If the database cannot provide advisory locks the lock degrades to the
/// in-process map rather than failing the check.
pub struct PgAdvisoryLock {
    pool: PgPool,
    namespace: i32,
    fallback: LocalLockMap,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool, namespace: i32) -> Self {
        Self {
            pool,
            namespace,
            fallback: LocalLockMap::new(),
        }
    }
}

#[async_trait]
impl MonitorLock for PgAdvisoryLock {
    async fn try_acquire(&self, monitor_id: i32) -> Result<Option<LockGuard>, LockError> {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(monitor_id, error = %e, "No connection for advisory lock; using in-process lock.");
                return Ok(self.fallback.try_lock(monitor_id));
            }
        };

        let acquired: Result<bool, sqlx::Error> = sqlx::query_scalar("SELECT pg_try_advisory_lock($1, $2)")
            .bind(self.namespace)
            .bind(monitor_id)
            .fetch_one(&mut *conn)
            .await;

        match acquired {
            Ok(true) => Ok(Some(LockGuard {
                monitor_id,
                held: Some(Held::Advisory {
                    conn,
                    namespace: self.namespace,
                }),
            })),
            Ok(false) => {
                debug!(monitor_id, "Advisory lock held elsewhere.");
                Ok(None)
            }
            Err(e) => {
                warn!(monitor_id, error = %e, "Advisory locks unavailable; using in-process lock.");
                Ok(self.fallback.try_lock(monitor_id))
            }
        }
    }
}
