//! In-process [`CatalogStore`] for dry runs and tests. Enforces the same
//! uniqueness rules as the Postgres schema: one sailing per natural key, one
//! snapshot per (batch id, phase), one lock row per scope.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sailsync_core::{
    EventStatus, LineId, LockStatus, NaturalKey, PriceSnapshot, Progress, Sailing, SailingWrite,
    ShipContent, SyncLock, WebhookEvent, WriteOutcome,
};
use uuid::Uuid;

use super::{CatalogStore, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct ShipRow {
    pub ship_id: i32,
    pub line_id: LineId,
    pub name: Option<String>,
    pub content: serde_json::Value,
}

#[derive(Debug, Default)]
struct State {
    sailings: HashMap<Uuid, Sailing>,
    by_key: HashMap<NaturalKey, Uuid>,
    ships: HashMap<i32, ShipRow>,
    snapshots: Vec<PriceSnapshot>,
    locks: HashMap<LineId, SyncLock>,
    events: Vec<WebhookEvent>,
    quote_refs: Vec<Uuid>,
    booking_refs: Vec<Uuid>,
    /// (scope, sailing upserts left) before the scope lock changes hands.
    lock_handover: Option<(LineId, usize)>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    writes: AtomicUsize,
    fail_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog writes so far: sailing upserts, ship upserts and snapshot inserts.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// The next `n` catalog writes fail with a transient error.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    pub fn sailings(&self) -> Vec<Sailing> {
        let mut rows: Vec<Sailing> = self.lock_state().sailings.values().cloned().collect();
        rows.sort_by(|a, b| a.natural_key().cmp(&b.natural_key()));
        rows
    }

    pub fn ships(&self) -> Vec<ShipRow> {
        let mut rows: Vec<ShipRow> = self.lock_state().ships.values().cloned().collect();
        rows.sort_by_key(|ship| ship.ship_id);
        rows
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock_state().snapshots.len()
    }

    /// Simulates a quote request owned by the quoting collaborator.
    pub fn add_quote_request(&self, sailing_id: Uuid) {
        self.lock_state().quote_refs.push(sailing_id);
    }

    /// Simulates a live booking session owned by the booking collaborator.
    pub fn add_booking_session(&self, sailing_id: Uuid) {
        self.lock_state().booking_refs.push(sailing_id);
    }

    /// After `upserts` more sailing writes in the scope, its lock is taken by
    /// a new holder, as if it had been reaped and reclaimed mid-pass.
    pub fn hand_over_lock_after(&self, scope_id: LineId, upserts: usize) {
        self.lock_state().lock_handover = Some((scope_id, upserts));
    }

    pub fn remove_quote_request(&self, sailing_id: Uuid) {
        self.lock_state().quote_refs.retain(|id| *id != sailing_id);
    }

    pub fn remove_booking_session(&self, sailing_id: Uuid) {
        self.lock_state().booking_refs.retain(|id| *id != sailing_id);
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_write(&self) -> Result<(), StoreError> {
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Transient("injected write failure".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn update_events(
    events: &mut [WebhookEvent],
    ids: &[Uuid],
    mut apply: impl FnMut(&mut WebhookEvent),
) {
    for event in events.iter_mut().filter(|event| ids.contains(&event.id)) {
        apply(event);
    }
}

impl State {
    fn count_toward_handover(&mut self, scope_id: LineId) {
        let Some((scope, left)) = self.lock_handover.as_mut() else {
            return;
        };
        if *scope != scope_id {
            return;
        }
        *left = left.saturating_sub(1);
        if *left > 0 {
            return;
        }
        self.lock_handover = None;
        if let Some(lock) = self.locks.get_mut(&scope_id) {
            let now = Utc::now();
            lock.holder_id = Uuid::new_v4();
            lock.status = LockStatus::Processing;
            lock.acquired_at = now;
            lock.heartbeat_at = now;
            lock.expires_at = now + chrono::Duration::minutes(10);
        }
    }

    fn stale_sailings(&self, departed_before: NaiveDate) -> Vec<Uuid> {
        self.sailings
            .values()
            .filter(|s| s.sailing_date < departed_before)
            .filter(|s| !self.quote_refs.contains(&s.id) && !self.booking_refs.contains(&s.id))
            .map(|s| s.id)
            .collect()
    }
}

fn is_open(event: &WebhookEvent) -> bool {
    matches!(event.status, EventStatus::Pending | EventStatus::Dispatched)
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn find_sailing(&self, key: &NaturalKey) -> Result<Option<Sailing>, StoreError> {
        let state = self.lock_state();
        Ok(state
            .by_key
            .get(key)
            .and_then(|id| state.sailings.get(id))
            .cloned())
    }

    async fn upsert_sailing(&self, write: &SailingWrite) -> Result<WriteOutcome, StoreError> {
        self.begin_write()?;
        let mut state = self.lock_state();
        state.count_toward_handover(write.key.cruise_line_id);
        if let Some(id) = state.by_key.get(&write.key).copied() {
            if let Some(row) = state.sailings.get_mut(&id) {
                row.supplier_item_id = write.supplier_item_id.clone();
                row.name = write.name.clone();
                row.nights = write.nights;
                row.prices = write.prices;
                row.cheapest_price = write.cheapest_price;
                row.is_available = write.is_available;
                row.pricing = write.pricing.clone();
                row.content_path = write.content_path.clone();
                row.checksum = write.checksum.clone();
                row.updated_at = write.seen_at;
                row.last_seen_at = write.seen_at;
                return Ok(WriteOutcome::Updated(id));
            }
        }

        let id = Uuid::new_v4();
        let row = Sailing {
            id,
            cruise_line_id: write.key.cruise_line_id,
            ship_id: write.key.ship_id,
            sailing_date: write.key.sailing_date,
            voyage_code: write.key.voyage_code.clone(),
            supplier_item_id: write.supplier_item_id.clone(),
            name: write.name.clone(),
            nights: write.nights,
            prices: write.prices,
            cheapest_price: write.cheapest_price,
            is_available: write.is_available,
            pricing: write.pricing.clone(),
            content_path: write.content_path.clone(),
            checksum: write.checksum.clone(),
            created_at: write.seen_at,
            updated_at: write.seen_at,
            last_seen_at: write.seen_at,
        };
        state.by_key.insert(write.key.clone(), id);
        state.sailings.insert(id, row);
        Ok(WriteOutcome::Inserted(id))
    }

    async fn upsert_ship(&self, line_id: LineId, ship: &ShipContent) -> Result<(), StoreError> {
        self.begin_write()?;
        self.lock_state().ships.insert(
            ship.ship_id,
            ShipRow {
                ship_id: ship.ship_id,
                line_id,
                name: ship.name.clone(),
                content: ship.content.clone(),
            },
        );
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), StoreError> {
        self.begin_write()?;
        let mut state = self.lock_state();
        if !state.sailings.contains_key(&snapshot.sailing_id) {
            return Err(StoreError::Conflict(format!(
                "sailing {} does not exist",
                snapshot.sailing_id
            )));
        }
        let duplicate = state
            .snapshots
            .iter()
            .any(|s| s.batch_id == snapshot.batch_id && s.phase == snapshot.phase);
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "snapshot {}/{} already recorded",
                snapshot.batch_id, snapshot.phase
            )));
        }
        state.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn snapshots_for(&self, sailing_id: Uuid) -> Result<Vec<PriceSnapshot>, StoreError> {
        let mut rows: Vec<PriceSnapshot> = self
            .lock_state()
            .snapshots
            .iter()
            .filter(|s| s.sailing_id == sailing_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| (s.captured_at, s.phase == sailsync_core::SnapshotPhase::After));
        Ok(rows)
    }

    async fn try_acquire_lock(
        &self,
        scope_id: LineId,
        holder_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<SyncLock>, StoreError> {
        let mut state = self.lock_state();
        if let Some(current) = state.locks.get(&scope_id) {
            if current.is_active(now) && current.holder_id != holder_id {
                return Ok(None);
            }
        }
        let lock = SyncLock {
            scope_id,
            holder_id,
            status: LockStatus::Processing,
            acquired_at: now,
            heartbeat_at: now,
            expires_at,
            progress: Progress::default(),
            error: None,
            finished_at: None,
        };
        state.locks.insert(scope_id, lock.clone());
        Ok(Some(lock))
    }

    async fn heartbeat_lock(
        &self,
        scope_id: LineId,
        holder_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        progress: Progress,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock_state();
        match state.locks.get_mut(&scope_id) {
            Some(lock) if lock.holder_id == holder_id && lock.status == LockStatus::Processing => {
                lock.heartbeat_at = now;
                lock.expires_at = expires_at;
                lock.progress = progress;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(
        &self,
        scope_id: LineId,
        holder_id: Uuid,
        status: LockStatus,
        progress: Progress,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock_state();
        match state.locks.get_mut(&scope_id) {
            Some(lock) if lock.holder_id == holder_id && lock.status == LockStatus::Processing => {
                lock.status = status;
                lock.progress = progress;
                lock.error = error.map(ToString::to_string);
                lock.heartbeat_at = now;
                lock.finished_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_lock(&self, scope_id: LineId) -> Result<Option<SyncLock>, StoreError> {
        Ok(self.lock_state().locks.get(&scope_id).cloned())
    }

    async fn reap_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<LineId>, StoreError> {
        let mut state = self.lock_state();
        let mut reaped = Vec::new();
        for lock in state.locks.values_mut() {
            if lock.status == LockStatus::Processing && lock.expires_at <= now {
                lock.status = LockStatus::Failed;
                lock.error = Some("lock expired without release".to_string());
                lock.finished_at = Some(now);
                reaped.push(lock.scope_id);
            }
        }
        reaped.sort_unstable();
        Ok(reaped)
    }

    async fn insert_event(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        if state.events.iter().any(|e| e.id == event.id) {
            return Err(StoreError::Conflict(format!("event {} already logged", event.id)));
        }
        state.events.push(event.clone());
        Ok(())
    }

    async fn open_events(&self, scope_id: LineId) -> Result<Vec<WebhookEvent>, StoreError> {
        Ok(self
            .lock_state()
            .events
            .iter()
            .filter(|e| e.scope_id == scope_id && is_open(e))
            .cloned()
            .collect())
    }

    async fn pending_scopes(&self, limit: usize) -> Result<Vec<LineId>, StoreError> {
        let state = self.lock_state();
        let mut oldest: HashMap<LineId, DateTime<Utc>> = HashMap::new();
        for event in state.events.iter().filter(|e| e.status == EventStatus::Pending) {
            oldest
                .entry(event.scope_id)
                .and_modify(|at| *at = (*at).min(event.received_at))
                .or_insert(event.received_at);
        }
        let mut scopes: Vec<(DateTime<Utc>, LineId)> =
            oldest.into_iter().map(|(scope, at)| (at, scope)).collect();
        scopes.sort();
        Ok(scopes.into_iter().take(limit).map(|(_, scope)| scope).collect())
    }

    async fn claim_events(
        &self,
        scope_id: LineId,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let mut state = self.lock_state();
        let mut claimed = Vec::new();
        for event in state
            .events
            .iter_mut()
            .filter(|e| e.scope_id == scope_id && e.status == EventStatus::Pending)
        {
            event.status = EventStatus::Dispatched;
            event.dispatched_at = Some(now);
            claimed.push(event.clone());
        }
        claimed.sort_by_key(|e| e.received_at);
        Ok(claimed)
    }

    async fn finish_events(&self, ids: &[Uuid], status: EventStatus) -> Result<(), StoreError> {
        update_events(&mut self.lock_state().events, ids, |event| {
            event.status = status;
        });
        Ok(())
    }

    async fn requeue_events(
        &self,
        ids: &[Uuid],
        consume_attempt: bool,
    ) -> Result<(), StoreError> {
        update_events(&mut self.lock_state().events, ids, |event| {
            event.status = EventStatus::Pending;
            event.dispatched_at = None;
            if consume_attempt {
                event.attempts += 1;
            }
        });
        Ok(())
    }

    async fn requeue_stale_dispatched(
        &self,
        dispatched_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut requeued = 0;
        for event in self.lock_state().events.iter_mut() {
            let stale = event.status == EventStatus::Dispatched
                && event.dispatched_at.is_some_and(|at| at < dispatched_before);
            if stale {
                event.status = EventStatus::Pending;
                event.dispatched_at = None;
                event.attempts += 1;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn events_for_scope(&self, scope_id: LineId) -> Result<Vec<WebhookEvent>, StoreError> {
        let mut rows: Vec<WebhookEvent> = self
            .lock_state()
            .events
            .iter()
            .filter(|e| e.scope_id == scope_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.received_at);
        Ok(rows)
    }

    async fn delete_stale_sailings(&self, departed_before: NaiveDate) -> Result<u64, StoreError> {
        let mut state = self.lock_state();
        let doomed = state.stale_sailings(departed_before);
        for id in &doomed {
            if let Some(row) = state.sailings.remove(id) {
                state.by_key.remove(&row.natural_key());
            }
        }
        // snapshots follow their sailing (ON DELETE CASCADE)
        state.snapshots.retain(|s| !doomed.contains(&s.sailing_id));
        Ok(doomed.len() as u64)
    }

    async fn snapshots_to_archive(
        &self,
        cutoff: DateTime<Utc>,
        departed_before: NaiveDate,
    ) -> Result<Vec<PriceSnapshot>, StoreError> {
        let state = self.lock_state();
        let doomed = state.stale_sailings(departed_before);
        let mut rows: Vec<PriceSnapshot> = state
            .snapshots
            .iter()
            .filter(|s| s.captured_at < cutoff || doomed.contains(&s.sailing_id))
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.captured_at);
        Ok(rows)
    }

    async fn delete_snapshots_captured_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock_state();
        let before = state.snapshots.len();
        state.snapshots.retain(|s| s.captured_at >= cutoff);
        Ok((before - state.snapshots.len()) as u64)
    }

    async fn delete_events_received_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock_state();
        let before = state.events.len();
        state
            .events
            .retain(|e| e.received_at >= cutoff || is_open(e));
        Ok((before - state.events.len()) as u64)
    }
}
