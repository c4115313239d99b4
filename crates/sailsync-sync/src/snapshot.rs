use std::sync::Arc;

use chrono::{DateTime, Utc};
use sailsync_core::{
    CabinClass, CabinPrices, ChangeType, NaturalKey, PriceDelta, PriceSnapshot, SnapshotPhase,
};
use sailsync_storage::BackoffPolicy;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{with_retry, CatalogStore, StoreError};

/// Per-field movement for every price field that changed.
pub fn compute_deltas(
    before: &CabinPrices,
    before_cheapest: Option<f64>,
    after: &CabinPrices,
    after_cheapest: Option<f64>,
) -> Vec<PriceDelta> {
    let fields = CabinClass::ALL
        .iter()
        .map(|class| (class.as_str(), before.get(*class), after.get(*class)))
        .chain(std::iter::once(("cheapest", before_cheapest, after_cheapest)));

    fields
        .filter(|(_, b, a)| b != a)
        .map(|(field, b, a)| {
            let absolute = match (b, a) {
                (Some(b), Some(a)) => Some(a - b),
                _ => None,
            };
            let percent = match (b, absolute) {
                (Some(b), Some(abs)) if b != 0.0 => Some(abs / b * 100.0),
                _ => None,
            };
            PriceDelta {
                field: field.to_string(),
                before: b,
                after: a,
                absolute,
                percent,
            }
        })
        .collect()
}

/// Batch id shared by the before/after pair of one sailing within one pass.
/// Deterministic, so a retried write collides on (batch id, phase) instead of
/// duplicating history.
pub fn batch_id(pass_id: Uuid, key: &NaturalKey) -> Uuid {
    Uuid::new_v5(&pass_id, key.to_string().as_bytes())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotCounts {
    pub written: u32,
    pub failed: u32,
}

/// Writes price history. Failures are logged and never surface to the caller.
#[derive(Clone)]
pub struct SnapshotRecorder {
    store: Arc<dyn CatalogStore>,
    retry: BackoffPolicy,
}

impl SnapshotRecorder {
    pub fn new(store: Arc<dyn CatalogStore>, retry: BackoffPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn record_before(
        &self,
        sailing_id: Uuid,
        batch_id: Uuid,
        prices: &CabinPrices,
        cheapest_price: Option<f64>,
        captured_at: DateTime<Utc>,
    ) -> SnapshotCounts {
        let snapshot = PriceSnapshot {
            id: Uuid::new_v4(),
            sailing_id,
            batch_id,
            phase: SnapshotPhase::Before,
            change_type: ChangeType::Update,
            prices: *prices,
            cheapest_price,
            deltas: Vec::new(),
            captured_at,
        };
        self.write(snapshot).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_after(
        &self,
        sailing_id: Uuid,
        batch_id: Uuid,
        change_type: ChangeType,
        prices: &CabinPrices,
        cheapest_price: Option<f64>,
        deltas: Vec<PriceDelta>,
        captured_at: DateTime<Utc>,
    ) -> SnapshotCounts {
        let snapshot = PriceSnapshot {
            id: Uuid::new_v4(),
            sailing_id,
            batch_id,
            phase: SnapshotPhase::After,
            change_type,
            prices: *prices,
            cheapest_price,
            deltas,
            captured_at,
        };
        self.write(snapshot).await
    }

    async fn write(&self, snapshot: PriceSnapshot) -> SnapshotCounts {
        let result = with_retry(&self.retry, "insert snapshot", || {
            self.store.insert_snapshot(&snapshot)
        })
        .await;
        match result {
            Ok(()) => SnapshotCounts {
                written: 1,
                failed: 0,
            },
            // A retry after an unacknowledged commit lands here; the row exists.
            Err(StoreError::Conflict(reason)) => {
                debug!(batch = %snapshot.batch_id, phase = %snapshot.phase, %reason, "snapshot already recorded");
                SnapshotCounts::default()
            }
            Err(err) => {
                warn!(
                    sailing = %snapshot.sailing_id,
                    batch = %snapshot.batch_id,
                    phase = %snapshot.phase,
                    error = %err,
                    "price snapshot not recorded"
                );
                SnapshotCounts {
                    written: 0,
                    failed: 1,
                }
            }
        }
    }
}
