//! Canonical store contract. Postgres in production, an in-process store with
//! the same constraint semantics for dry runs and tests.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sailsync_core::{
    EventStatus, LineId, LockStatus, NaturalKey, PriceSnapshot, Progress, Sailing, SailingWrite,
    ShipContent, SyncLock, WebhookEvent, WriteOutcome,
};
use sailsync_storage::{BackoffPolicy, RetryDisposition};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("constraint violation: {0}")]
    Conflict(String),
    #[error("store failure: {0}")]
    Other(String),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Transient(_) => RetryDisposition::Retryable,
            StoreError::Conflict(_) | StoreError::Other(_) => RetryDisposition::NonRetryable,
        }
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    // sailings
    async fn find_sailing(&self, key: &NaturalKey) -> Result<Option<Sailing>, StoreError>;

    /// Insert-or-update keyed on the natural key, in one statement. A
    /// concurrent insert of the same tuple resolves to an update.
    async fn upsert_sailing(&self, write: &SailingWrite) -> Result<WriteOutcome, StoreError>;

    async fn upsert_ship(&self, line_id: LineId, ship: &ShipContent) -> Result<(), StoreError>;

    /// Fails with [`StoreError::Conflict`] when (batch id, phase) already exists.
    async fn insert_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), StoreError>;

    async fn snapshots_for(&self, sailing_id: Uuid) -> Result<Vec<PriceSnapshot>, StoreError>;

    // locks
    /// Takes the scope lock unless another holder's lock is active. Never waits.
    async fn try_acquire_lock(
        &self,
        scope_id: LineId,
        holder_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<SyncLock>, StoreError>;

    /// Extends the TTL and publishes progress. `false` once the holder lost the lock.
    async fn heartbeat_lock(
        &self,
        scope_id: LineId,
        holder_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        progress: Progress,
    ) -> Result<bool, StoreError>;

    async fn release_lock(
        &self,
        scope_id: LineId,
        holder_id: Uuid,
        status: LockStatus,
        progress: Progress,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn get_lock(&self, scope_id: LineId) -> Result<Option<SyncLock>, StoreError>;

    /// Forces locks stuck in `processing` past their TTL to `failed`.
    async fn reap_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<LineId>, StoreError>;

    // webhook events
    async fn insert_event(&self, event: &WebhookEvent) -> Result<(), StoreError>;

    /// Pending and dispatched events of one scope.
    async fn open_events(&self, scope_id: LineId) -> Result<Vec<WebhookEvent>, StoreError>;

    /// Scopes with pending events, oldest first.
    async fn pending_scopes(&self, limit: usize) -> Result<Vec<LineId>, StoreError>;

    /// Moves every pending event of the scope to `dispatched` and returns them.
    async fn claim_events(
        &self,
        scope_id: LineId,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookEvent>, StoreError>;

    async fn finish_events(&self, ids: &[Uuid], status: EventStatus) -> Result<(), StoreError>;

    async fn requeue_events(&self, ids: &[Uuid], consume_attempt: bool)
        -> Result<(), StoreError>;

    /// Returns dispatched events whose worker vanished to the queue.
    async fn requeue_stale_dispatched(
        &self,
        dispatched_before: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn events_for_scope(&self, scope_id: LineId) -> Result<Vec<WebhookEvent>, StoreError>;

    // retention
    /// Deletes sailings departed before `departed_before` that no dependent
    /// table references.
    async fn delete_stale_sailings(&self, departed_before: NaiveDate) -> Result<u64, StoreError>;

    /// Snapshots captured before `cutoff`, plus every snapshot of a sailing
    /// that [`delete_stale_sailings`](Self::delete_stale_sailings) would remove.
    async fn snapshots_to_archive(
        &self,
        cutoff: DateTime<Utc>,
        departed_before: NaiveDate,
    ) -> Result<Vec<PriceSnapshot>, StoreError>;

    async fn delete_snapshots_captured_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Only events in a terminal status are removed.
    async fn delete_events_received_before(&self, cutoff: DateTime<Utc>)
        -> Result<u64, StoreError>;
}

/// Runs a store operation, retrying transient failures with backoff.
pub async fn with_retry<T, F, Fut>(
    policy: &BackoffPolicy,
    what: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = policy.attempts();
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err)
                if err.disposition() == RetryDisposition::Retryable && attempt + 1 < attempts =>
            {
                let delay = policy.delay_for_attempt(attempt);
                warn!(what, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying store operation");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_the_budget_runs_out() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), StoreError> = with_retry(&fast(), "test", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Transient("connection reset".into()))
        })
        .await;
        assert!(matches!(result, Err(StoreError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn conflicts_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), StoreError> = with_retry(&fast(), "test", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Conflict("duplicate".into()))
        })
        .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
