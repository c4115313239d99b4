//! Trigger admission and job claiming over the durable `webhook_events` queue.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use sailsync_core::{EventKind, EventStatus, LockStatus, ScopeJob, WebhookEvent};
use sailsync_storage::BackoffPolicy;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::intake::Trigger;
use crate::store::{with_retry, CatalogStore, StoreError};

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub dedup_window: Duration,
    pub max_scopes_per_tick: usize,
    pub max_attempts: i32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            dedup_window: Duration::seconds(300),
            max_scopes_per_tick: 3,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Queued { event_id: Uuid },
    Deduplicated { event_id: Uuid, reason: &'static str },
}

impl Admission {
    pub fn event_id(&self) -> Uuid {
        match self {
            Admission::Queued { event_id } | Admission::Deduplicated { event_id, .. } => *event_id,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Admission::Queued { .. })
    }
}

/// How a claimed job ended, from the queue's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResolution {
    Completed,
    Failed,
    /// Another holder had the scope lock. Not an attempt.
    Contended,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn CatalogStore>,
    settings: DispatchSettings,
    retry: BackoffPolicy,
}

fn covers(open: &WebhookEvent, trigger: &Trigger) -> bool {
    match (open.kind, trigger.kind) {
        (EventKind::LineUpdate, _) => true,
        (EventKind::ItemUpdate, EventKind::ItemUpdate) => open.status == EventStatus::Dispatched
            && trigger.item_paths.iter().all(|p| open.item_paths.contains(p)),
        (EventKind::ItemUpdate, EventKind::LineUpdate) => false,
    }
}

impl Dispatcher {
    pub fn new(store: Arc<dyn CatalogStore>, settings: DispatchSettings, retry: BackoffPolicy) -> Self {
        Self {
            store,
            settings,
            retry,
        }
    }

    pub fn settings(&self) -> DispatchSettings {
        self.settings
    }

    /// Logs the trigger and decides whether it adds work.
    ///
    /// A trigger collapses when an open event already covers it, when the scope
    /// is being processed, or (unless forced) when the scope completed inside
    /// the dedup window. Otherwise it becomes a pending event; pending events
    /// of one scope are merged into a single job at claim time.
    pub async fn admit(&self, trigger: &Trigger) -> Result<Admission, StoreError> {
        let now = Utc::now();
        let open = with_retry(&self.retry, "load open events", || {
            self.store.open_events(trigger.scope_id)
        })
        .await?;
        let lock = with_retry(&self.retry, "load scope lock", || {
            self.store.get_lock(trigger.scope_id)
        })
        .await?;

        let reason = if open.iter().any(|event| covers(event, trigger)) {
            Some("covered by an open event")
        } else if trigger.kind == EventKind::LineUpdate
            && lock.as_ref().is_some_and(|l| l.is_active(now))
        {
            Some("scope is being processed")
        } else if !trigger.force
            && lock.as_ref().is_some_and(|l| {
                l.status == LockStatus::Completed
                    && l.finished_at
                        .is_some_and(|at| at > now - self.settings.dedup_window)
            })
        {
            Some("scope completed recently")
        } else {
            None
        };

        let event = WebhookEvent {
            id: Uuid::new_v4(),
            scope_id: trigger.scope_id,
            supplier_line_id: trigger.supplier_line_id,
            kind: trigger.kind,
            source: trigger.source,
            item_paths: trigger.item_paths.clone(),
            received_at: trigger.received_at,
            status: if reason.is_some() {
                EventStatus::Deduplicated
            } else {
                EventStatus::Pending
            },
            attempts: 0,
            dispatched_at: None,
        };
        with_retry(&self.retry, "log webhook event", || self.store.insert_event(&event)).await?;

        Ok(match reason {
            Some(reason) => {
                debug!(scope = trigger.scope_id, kind = %trigger.kind, reason, "trigger collapsed");
                Admission::Deduplicated {
                    event_id: event.id,
                    reason,
                }
            }
            None => {
                info!(
                    scope = trigger.scope_id,
                    kind = %trigger.kind,
                    source = %trigger.source,
                    items = trigger.item_paths.len(),
                    "trigger queued"
                );
                Admission::Queued { event_id: event.id }
            }
        })
    }

    /// Claims up to `min(max_scopes_per_tick, capacity)` scopes, oldest first.
    /// Scopes beyond the cap stay pending for the next tick.
    pub async fn claim(&self, capacity: usize) -> Result<Vec<ScopeJob>, StoreError> {
        let limit = self.settings.max_scopes_per_tick.min(capacity);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let scopes = with_retry(&self.retry, "list pending scopes", || {
            self.store.pending_scopes(limit)
        })
        .await?;

        let mut jobs = Vec::with_capacity(scopes.len());
        for scope_id in scopes {
            let now = Utc::now();
            let events = self.store.claim_events(scope_id, now).await?;
            if let Some(job) = collapse(&events, now) {
                debug!(scope = scope_id, events = job.event_ids.len(), kind = %job.kind, "scope claimed");
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub async fn resolve(&self, job: &ScopeJob, resolution: JobResolution) -> Result<(), StoreError> {
        let ids = &job.event_ids;
        match resolution {
            JobResolution::Completed => {
                with_retry(&self.retry, "finish events", || {
                    self.store.finish_events(ids, EventStatus::Done)
                })
                .await
            }
            JobResolution::Contended => {
                with_retry(&self.retry, "requeue events", || {
                    self.store.requeue_events(ids, false)
                })
                .await
            }
            JobResolution::Failed if job.attempts + 1 >= self.settings.max_attempts => {
                warn!(scope = job.scope_id, attempts = job.attempts + 1, "scope gave up after repeated failures");
                with_retry(&self.retry, "fail events", || {
                    self.store.finish_events(ids, EventStatus::Failed)
                })
                .await
            }
            JobResolution::Failed => {
                with_retry(&self.retry, "requeue events", || {
                    self.store.requeue_events(ids, true)
                })
                .await
            }
        }
    }

    /// Returns events whose worker disappeared to the queue.
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<u64, StoreError> {
        let requeued = self
            .store
            .requeue_stale_dispatched(Utc::now() - older_than)
            .await?;
        if requeued > 0 {
            warn!(requeued, "requeued events abandoned by a worker");
        }
        Ok(requeued)
    }
}

/// Merges a scope's claimed events: any line-level event makes a line update,
/// otherwise the item paths are unioned.
pub fn collapse(events: &[WebhookEvent], claimed_at: chrono::DateTime<Utc>) -> Option<ScopeJob> {
    let first = events.first()?;
    let kind = if events.iter().any(|e| e.kind == EventKind::LineUpdate) {
        EventKind::LineUpdate
    } else {
        EventKind::ItemUpdate
    };
    let item_paths = match kind {
        EventKind::LineUpdate => Vec::new(),
        EventKind::ItemUpdate => events
            .iter()
            .flat_map(|e| e.item_paths.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
    };
    Some(ScopeJob {
        scope_id: first.scope_id,
        supplier_line_id: first.supplier_line_id,
        kind,
        item_paths,
        event_ids: events.iter().map(|e| e.id).collect(),
        attempts: events.iter().map(|e| e.attempts).max().unwrap_or(0),
        claimed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use sailsync_core::{Progress, TriggerSource};

    fn dispatcher(store: &Arc<MemoryStore>) -> Dispatcher {
        Dispatcher::new(store.clone(), DispatchSettings::default(), BackoffPolicy::default())
    }

    fn line(scope: i32) -> Trigger {
        Trigger {
            scope_id: scope,
            supplier_line_id: scope,
            kind: EventKind::LineUpdate,
            item_paths: vec![],
            source: TriggerSource::Webhook,
            force: false,
            received_at: Utc::now(),
        }
    }

    fn items(scope: i32, paths: &[&str]) -> Trigger {
        Trigger {
            kind: EventKind::ItemUpdate,
            item_paths: paths.iter().map(ToString::to_string).collect(),
            ..line(scope)
        }
    }

    #[tokio::test]
    async fn repeated_line_trigger_collapses_into_one_job() {
        let store = Arc::new(MemoryStore::new());
        let dispatch = dispatcher(&store);

        assert!(dispatch.admit(&line(7)).await.unwrap().is_queued());
        let second = dispatch.admit(&line(7)).await.unwrap();
        assert!(matches!(second, Admission::Deduplicated { .. }));

        let jobs = dispatch.claim(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].event_ids.len(), 1);
        assert_eq!(store.events_for_scope(7).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn item_triggers_merge_and_widen_to_line() {
        let store = Arc::new(MemoryStore::new());
        let dispatch = dispatcher(&store);

        dispatch.admit(&items(7, &["a.json"])).await.unwrap();
        dispatch.admit(&items(7, &["b.json", "a.json"])).await.unwrap();
        let job = dispatch.claim(10).await.unwrap().remove(0);
        assert_eq!(job.kind, EventKind::ItemUpdate);
        assert_eq!(job.item_paths, vec!["a.json", "b.json"]);
        dispatch.resolve(&job, JobResolution::Completed).await.unwrap();

        dispatch.admit(&items(9, &["c.json"])).await.unwrap();
        dispatch.admit(&line(9)).await.unwrap();
        let job = dispatch.claim(10).await.unwrap().remove(0);
        assert_eq!(job.kind, EventKind::LineUpdate);
        assert!(job.item_paths.is_empty());
        assert_eq!(job.event_ids.len(), 2);
    }

    #[tokio::test]
    async fn claim_respects_the_per_tick_cap() {
        let store = Arc::new(MemoryStore::new());
        let dispatch = dispatcher(&store);
        for scope in 1..=5 {
            dispatch.admit(&line(scope)).await.unwrap();
        }
        assert_eq!(dispatch.claim(10).await.unwrap().len(), 3);
        assert_eq!(dispatch.claim(1).await.unwrap().len(), 1);
        assert_eq!(dispatch.claim(10).await.unwrap().len(), 1);
        assert!(dispatch.claim(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recently_completed_scope_needs_force() {
        let store = Arc::new(MemoryStore::new());
        let dispatch = dispatcher(&store);
        let holder = Uuid::new_v4();
        let now = Utc::now();
        store
            .try_acquire_lock(7, holder, now, now + Duration::seconds(60))
            .await
            .unwrap();
        store
            .release_lock(7, holder, LockStatus::Completed, Progress::default(), None, now)
            .await
            .unwrap();

        let plain = dispatch.admit(&line(7)).await.unwrap();
        assert_eq!(
            plain,
            Admission::Deduplicated {
                event_id: plain.event_id(),
                reason: "scope completed recently"
            }
        );
        let forced = Trigger {
            force: true,
            source: TriggerSource::Admin,
            ..line(7)
        };
        assert!(dispatch.admit(&forced).await.unwrap().is_queued());
    }

    #[tokio::test]
    async fn failures_requeue_until_attempts_run_out() {
        let store = Arc::new(MemoryStore::new());
        let dispatch = dispatcher(&store);
        dispatch.admit(&line(7)).await.unwrap();

        for _ in 0..2 {
            let job = dispatch.claim(10).await.unwrap().remove(0);
            dispatch.resolve(&job, JobResolution::Contended).await.unwrap();
        }
        for expected_attempts in 0..3 {
            let job = dispatch.claim(10).await.unwrap().remove(0);
            assert_eq!(job.attempts, expected_attempts);
            dispatch.resolve(&job, JobResolution::Failed).await.unwrap();
        }
        assert!(dispatch.claim(10).await.unwrap().is_empty());
        let events = store.events_for_scope(7).await.unwrap();
        assert_eq!(events[0].status, EventStatus::Failed);
    }
}
