use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Utc};
use sailsync_adapters::{parse_payload, ParseOptions};
use sailsync_core::{EventKind, LineId, LockStatus, Progress, ScopeJob, SyncSummary};
use sailsync_storage::{ConnectionPool, FeedPath, PoolError, QuarantineStore};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::detect::PassMemory;
use crate::intake::LineMapping;
use crate::lock::{LockLease, LockManager};
use crate::store::StoreError;
use crate::upsert::{Applied, UpsertEngine};

const MAX_ERROR_SAMPLES: usize = 5;

/// The current month plus `months_ahead` following months.
pub fn listing_months(now: DateTime<Utc>, months_ahead: u32) -> Vec<(i32, u32)> {
    let (mut year, mut month) = (now.year(), now.month());
    let mut months = Vec::with_capacity(months_ahead as usize + 1);
    for _ in 0..=months_ahead {
        months.push((year, month));
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    months
}

#[derive(Debug, Clone)]
pub enum ScopeOutcome {
    Finished(SyncSummary),
    /// Another holder had the lock; nothing ran.
    Contended,
}

#[derive(Debug, Error)]
enum PassAbort {
    #[error("listing failed: {0}")]
    Listing(#[source] PoolError),
    #[error("scope lock lost")]
    LockLost,
    #[error("lock heartbeat failed: {0}")]
    Heartbeat(#[source] StoreError),
}

#[derive(Debug, Default)]
struct Tally {
    found: u32,
    processed: u32,
    created: u32,
    updated: u32,
    skipped: u32,
    failed: u32,
    corrupt: u32,
    errors: Vec<String>,
}

impl Tally {
    fn progress(&self) -> Progress {
        Progress {
            planned: self.found,
            processed: self.processed,
            succeeded: self.created + self.updated,
            skipped: self.skipped,
            failed: self.failed,
        }
    }

    fn fail(&mut self, message: String) {
        self.failed += 1;
        if self.errors.len() < MAX_ERROR_SAMPLES {
            self.errors.push(message);
        }
    }
}

#[derive(Clone)]
pub struct ScopeWorker {
    pub pool: Arc<ConnectionPool>,
    pub locks: LockManager,
    pub upserts: UpsertEngine,
    pub mapping: Arc<LineMapping>,
    pub quarantine: Option<QuarantineStore>,
    pub parse_options: ParseOptions,
    pub months_ahead: u32,
    pub budget: Duration,
}

impl ScopeWorker {
    /// Runs one scope pass under its lock. Per-file problems are counted,
    /// never raised; the pass itself fails only on listing errors, a lost
    /// lock, or an exhausted budget.
    pub async fn run(&self, job: &ScopeJob) -> Result<ScopeOutcome, StoreError> {
        let holder_id = Uuid::new_v4();
        let Some(lease) = self.locks.try_acquire(job.scope_id, holder_id).await? else {
            return Ok(ScopeOutcome::Contended);
        };

        let started_at = Utc::now();
        let clock = Instant::now();
        let mut tally = Tally::default();
        let span = info_span!("scope_sync", scope = job.scope_id, holder = %holder_id, kind = %job.kind);

        let pass = tokio::time::timeout(
            self.budget,
            self.pass(job, lease, &mut tally).instrument(span.clone()),
        )
        .await;

        let lock_lost = matches!(pass, Ok(Err(PassAbort::LockLost)));
        let (status, error) = match pass {
            Ok(Ok(())) => (LockStatus::Completed, None),
            Ok(Err(abort)) => (LockStatus::Failed, Some(abort.to_string())),
            Err(_) => (
                LockStatus::Failed,
                Some(format!("job budget of {}s exceeded", self.budget.as_secs())),
            ),
        };

        if !lock_lost {
            let released = self
                .locks
                .release(lease, status, tally.progress(), error.as_deref())
                .await;
            if let Err(err) = released {
                warn!(parent: &span, error = %err, "could not release scope lock; the reaper will expire it");
            }
        }

        let mut errors = tally.errors;
        if let Some(error) = error {
            errors.insert(0, error);
            errors.truncate(MAX_ERROR_SAMPLES);
        }
        let summary = SyncSummary {
            scope_id: job.scope_id,
            supplier_line_id: job.supplier_line_id,
            holder_id,
            kind: job.kind,
            status,
            files_found: tally.found,
            files_processed: tally.processed,
            created: tally.created,
            updated: tally.updated,
            skipped: tally.skipped,
            failed: tally.failed,
            corrupt: tally.corrupt,
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            errors,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            parent: &span,
            status = %summary.status,
            found = summary.files_found,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            failed = summary.failed,
            "scope pass finished"
        );
        Ok(ScopeOutcome::Finished(summary))
    }

    fn suppliers(&self, job: &ScopeJob) -> Vec<i32> {
        let mut suppliers = self.mapping.suppliers_for(job.scope_id);
        if !suppliers.contains(&job.supplier_line_id) {
            suppliers.push(job.supplier_line_id);
        }
        suppliers
    }

    async fn plan(&self, job: &ScopeJob, suppliers: &[i32]) -> Result<Vec<FeedPath>, PassAbort> {
        match job.kind {
            EventKind::ItemUpdate => Ok(job
                .item_paths
                .iter()
                .filter_map(|p| FeedPath::parse(p))
                .filter(|p| suppliers.contains(&p.supplier_line_id))
                .collect()),
            EventKind::LineUpdate => {
                let months = listing_months(Utc::now(), self.months_ahead);
                let mut paths = Vec::new();
                for supplier in suppliers {
                    let listed = self
                        .pool
                        .list_scope(*supplier, &months)
                        .await
                        .map_err(PassAbort::Listing)?;
                    paths.extend(listed);
                }
                Ok(paths)
            }
        }
    }

    async fn pass(
        &self,
        job: &ScopeJob,
        lease: LockLease,
        tally: &mut Tally,
    ) -> Result<(), PassAbort> {
        let suppliers = self.suppliers(job);
        let paths = self.plan(job, &suppliers).await?;
        tally.found = u32::try_from(paths.len()).unwrap_or(u32::MAX);
        info!(files = paths.len(), "scope planned");
        self.beat(lease, tally).await?;

        let mut memory = PassMemory::default();
        for batch in paths.chunks(self.pool.batch_size()) {
            for (path, fetched) in self.pool.fetch_batch(batch).await {
                self.ensure_held(lease).await?;
                self.handle_file(job.scope_id, &suppliers, lease.holder_id, &path, fetched, &mut memory, tally)
                    .await;
            }
            self.beat(lease, tally).await?;
        }
        debug!(ships = memory.ships_written(), "ship content refreshed");
        Ok(())
    }

    async fn ensure_held(&self, lease: LockLease) -> Result<(), PassAbort> {
        match self.locks.still_held(lease).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(PassAbort::LockLost),
            Err(err) => Err(PassAbort::Heartbeat(err)),
        }
    }

    async fn beat(&self, lease: LockLease, tally: &Tally) -> Result<(), PassAbort> {
        match self.locks.heartbeat(lease, tally.progress()).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(PassAbort::LockLost),
            Err(err) => Err(PassAbort::Heartbeat(err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_file(
        &self,
        scope_id: LineId,
        suppliers: &[i32],
        pass_id: Uuid,
        path: &FeedPath,
        fetched: Result<Vec<u8>, PoolError>,
        memory: &mut PassMemory,
        tally: &mut Tally,
    ) {
        tally.processed += 1;
        let file = path.to_path();

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(file = %file, error = %err, "fetch failed for this pass");
                tally.fail(format!("{file}: {err}"));
                return;
            }
        };

        let parsed = match parse_payload(&bytes, &file, self.parse_options) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(file = %file, error = %err, "corrupt payload skipped");
                tally.corrupt += 1;
                tally.fail(format!("{file}: {err}"));
                self.quarantine(path, &err.to_string(), &bytes).await;
                return;
            }
        };
        if parsed.char_indexed() {
            info!(file = %file, "repaired char-indexed payload");
        }

        let record = parsed.record;
        if !suppliers.contains(&record.supplier_line_id) {
            tally.fail(format!(
                "{file}: belongs to supplier line {}",
                record.supplier_line_id
            ));
            return;
        }

        match self.upserts.apply(&record, scope_id, pass_id, memory).await {
            Ok(outcome) => match outcome.applied {
                Applied::Created => tally.created += 1,
                Applied::Updated => tally.updated += 1,
                Applied::Skipped => tally.skipped += 1,
            },
            Err(err) => {
                warn!(file = %file, error = %err, "sailing not written");
                tally.fail(format!("{file}: {err}"));
            }
        }
    }

    async fn quarantine(&self, path: &FeedPath, reason: &str, bytes: &[u8]) {
        let Some(store) = &self.quarantine else {
            return;
        };
        match store
            .store(Utc::now(), path.supplier_line_id, &path.to_path(), reason, bytes)
            .await
        {
            Ok(saved) => debug!(file = %path, quarantined = %saved.relative_path.display(), "payload quarantined"),
            Err(err) => warn!(file = %path, error = %err, "could not quarantine payload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn listing_months_roll_over_the_year() {
        let now = Utc.with_ymd_and_hms(2025, 11, 20, 12, 0, 0).unwrap();
        assert_eq!(
            listing_months(now, 2),
            vec![(2025, 11), (2025, 12), (2026, 1)]
        );
        assert_eq!(listing_months(now, 0), vec![(2025, 11)]);
    }

    #[test]
    fn error_samples_are_capped() {
        let mut tally = Tally::default();
        for i in 0..8 {
            tally.fail(format!("file {i}"));
        }
        assert_eq!(tally.failed, 8);
        assert_eq!(tally.errors.len(), MAX_ERROR_SAMPLES);
    }
}
