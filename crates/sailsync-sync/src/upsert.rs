use std::sync::Arc;

use chrono::{DateTime, Utc};
use sailsync_core::{ChangeType, LineId, SailingWrite, SourceRecord, WriteOutcome};
use sailsync_storage::BackoffPolicy;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::detect::{classify, price_checksum, Change, PassMemory};
use crate::snapshot::{batch_id, compute_deltas, SnapshotCounts, SnapshotRecorder};
use crate::store::{with_retry, CatalogStore, StoreError};

/// Every derived column of a sailing, ready for one upsert statement.
pub fn sailing_write(
    record: &SourceRecord,
    cruise_line_id: LineId,
    checksum: String,
    seen_at: DateTime<Utc>,
) -> SailingWrite {
    SailingWrite {
        key: record.natural_key(cruise_line_id),
        supplier_item_id: record.supplier_item_id.clone(),
        name: record.name.clone(),
        nights: record.nights,
        prices: record.prices,
        cheapest_price: record.cheapest_price,
        is_available: record.is_available(),
        pricing: record.pricing.clone(),
        content_path: record.file_path.clone(),
        checksum,
        seen_at,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub applied: Applied,
    pub sailing_id: Option<Uuid>,
    pub snapshots: SnapshotCounts,
}

/// Applies one parsed record to the catalog: detect, snapshot, upsert.
#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn CatalogStore>,
    snapshots: SnapshotRecorder,
    retry: BackoffPolicy,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn CatalogStore>, retry: BackoffPolicy) -> Self {
        let snapshots = SnapshotRecorder::new(Arc::clone(&store), retry);
        Self {
            store,
            snapshots,
            retry,
        }
    }

    /// Resolves the sailing by natural key and writes it when its price
    /// checksum moved. Errors are fatal for this record only.
    pub async fn apply(
        &self,
        record: &SourceRecord,
        scope_id: LineId,
        pass_id: Uuid,
        memory: &mut PassMemory,
    ) -> Result<RecordOutcome, StoreError> {
        let key = record.natural_key(scope_id);
        let checksum = price_checksum(record)
            .map_err(|err| StoreError::Other(format!("{}: {err}", record.file_path)))?;
        let existing = with_retry(&self.retry, "find sailing", || self.store.find_sailing(&key)).await?;

        let previous = match classify(existing, &checksum) {
            Change::Unchanged => {
                debug!(key = %key, item = %record.supplier_item_id, "unchanged; skipping");
                return Ok(RecordOutcome {
                    applied: Applied::Skipped,
                    sailing_id: None,
                    snapshots: SnapshotCounts::default(),
                });
            }
            Change::New => None,
            Change::Changed { previous } => Some(previous),
        };

        let now = Utc::now();
        let batch = batch_id(pass_id, &key);
        let mut snapshots = SnapshotCounts::default();
        let price_moved = previous.as_ref().is_some_and(|prev| {
            prev.prices != record.prices || prev.cheapest_price != record.cheapest_price
        });

        if let Some(prev) = previous.as_ref().filter(|_| price_moved) {
            let counts = self
                .snapshots
                .record_before(prev.id, batch, &prev.prices, prev.cheapest_price, now)
                .await;
            snapshots = add(snapshots, counts);
        }

        let write = sailing_write(record, scope_id, checksum, now);
        let outcome =
            with_retry(&self.retry, "upsert sailing", || self.store.upsert_sailing(&write)).await?;

        if let Some(ship) = record.ship.as_ref() {
            if memory.first_sight_of_ship(ship.ship_id) {
                let written =
                    with_retry(&self.retry, "upsert ship", || self.store.upsert_ship(scope_id, ship))
                        .await;
                if let Err(err) = written {
                    warn!(ship = ship.ship_id, error = %err, "ship content not written");
                }
            }
        }

        let applied = match outcome {
            WriteOutcome::Inserted(sailing_id) => {
                let counts = self
                    .snapshots
                    .record_after(
                        sailing_id,
                        batch,
                        ChangeType::Insert,
                        &record.prices,
                        record.cheapest_price,
                        Vec::new(),
                        now,
                    )
                    .await;
                snapshots = add(snapshots, counts);
                Applied::Created
            }
            WriteOutcome::Updated(sailing_id) => {
                match previous.as_ref() {
                    Some(prev) if price_moved => {
                        let deltas = compute_deltas(
                            &prev.prices,
                            prev.cheapest_price,
                            &record.prices,
                            record.cheapest_price,
                        );
                        for delta in &deltas {
                            debug!(key = %key, %delta, "price moved");
                        }
                        let counts = self
                            .snapshots
                            .record_after(
                                sailing_id,
                                batch,
                                ChangeType::Update,
                                &record.prices,
                                record.cheapest_price,
                                deltas,
                                now,
                            )
                            .await;
                        snapshots = add(snapshots, counts);
                    }
                    Some(_) => {}
                    None => {
                        // Lost an insert race to another writer of the same tuple.
                        debug!(key = %key, "insert resolved to update");
                    }
                }
                Applied::Updated
            }
        };

        Ok(RecordOutcome {
            applied,
            sailing_id: Some(outcome.sailing_id()),
            snapshots,
        })
    }
}

fn add(a: SnapshotCounts, b: SnapshotCounts) -> SnapshotCounts {
    SnapshotCounts {
        written: a.written + b.written,
        failed: a.failed + b.failed,
    }
}
