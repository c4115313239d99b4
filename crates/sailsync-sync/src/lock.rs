use std::sync::Arc;

use chrono::{Duration, Utc};
use sailsync_core::{LineId, LockStatus, Progress, SyncLock};
use sailsync_storage::BackoffPolicy;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{with_retry, CatalogStore, StoreError};

/// Per-scope lock lifecycle: acquire never waits, heartbeats extend the TTL,
/// every holder ends in a terminal status.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn CatalogStore>,
    ttl: Duration,
    retry: BackoffPolicy,
}

/// Proof of holding a scope lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockLease {
    pub scope_id: LineId,
    pub holder_id: Uuid,
}

impl LockManager {
    pub fn new(store: Arc<dyn CatalogStore>, ttl: Duration, retry: BackoffPolicy) -> Self {
        Self { store, ttl, retry }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// `None` when another holder's lock is active.
    pub async fn try_acquire(
        &self,
        scope_id: LineId,
        holder_id: Uuid,
    ) -> Result<Option<LockLease>, StoreError> {
        let now = Utc::now();
        let acquired = with_retry(&self.retry, "acquire lock", || {
            self.store
                .try_acquire_lock(scope_id, holder_id, now, now + self.ttl)
        })
        .await?;
        match acquired {
            Some(lock) => {
                debug!(scope = scope_id, holder = %holder_id, expires_at = %lock.expires_at, "scope lock acquired");
                Ok(Some(LockLease {
                    scope_id,
                    holder_id,
                }))
            }
            None => {
                info!(scope = scope_id, "scope lock held elsewhere; deferring");
                Ok(None)
            }
        }
    }

    /// Extends the TTL and publishes progress. `false` means the lease is gone
    /// and the caller must stop.
    pub async fn heartbeat(&self, lease: LockLease, progress: Progress) -> Result<bool, StoreError> {
        let now = Utc::now();
        let held = with_retry(&self.retry, "heartbeat lock", || {
            self.store.heartbeat_lock(
                lease.scope_id,
                lease.holder_id,
                now,
                now + self.ttl,
                progress,
            )
        })
        .await?;
        if !held {
            warn!(scope = lease.scope_id, holder = %lease.holder_id, "scope lock lost");
        }
        Ok(held)
    }

    /// Read-only check between files; the TTL is only extended by [`heartbeat`](Self::heartbeat).
    pub async fn still_held(&self, lease: LockLease) -> Result<bool, StoreError> {
        let current = with_retry(&self.retry, "check lock", || {
            self.store.get_lock(lease.scope_id)
        })
        .await?;
        let held = current
            .is_some_and(|lock| lock.holder_id == lease.holder_id && lock.is_active(Utc::now()));
        if !held {
            warn!(scope = lease.scope_id, holder = %lease.holder_id, "scope lock lost");
        }
        Ok(held)
    }

    pub async fn release(
        &self,
        lease: LockLease,
        status: LockStatus,
        progress: Progress,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        debug_assert!(status.is_terminal());
        let now = Utc::now();
        let released = with_retry(&self.retry, "release lock", || {
            self.store.release_lock(
                lease.scope_id,
                lease.holder_id,
                status,
                progress,
                error,
                now,
            )
        })
        .await?;
        if released {
            info!(scope = lease.scope_id, status = %status, processed = progress.processed, "scope lock released");
        } else {
            warn!(scope = lease.scope_id, holder = %lease.holder_id, "release found the lock already taken over");
        }
        Ok(released)
    }

    pub async fn status(&self, scope_id: LineId) -> Result<Option<SyncLock>, StoreError> {
        self.store.get_lock(scope_id).await
    }

    /// Fails locks stuck in `processing` past their TTL.
    pub async fn reap(&self) -> Result<Vec<LineId>, StoreError> {
        let reaped = self.store.reap_expired_locks(Utc::now()).await?;
        if !reaped.is_empty() {
            warn!(scopes = ?reaped, "reaped expired scope locks");
        }
        Ok(reaped)
    }
}
