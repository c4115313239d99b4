//! Core domain model for the sailing inventory sync.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sailsync-core";

/// Canonical cruise-line id. Also the unit of ingestion work (the scope).
pub type LineId = i32;

/// Composite natural key of a real-world sailing.
///
/// Supplier item ids alias one sailing under several rate/cabin variants, so
/// this tuple is the only identity used for de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub cruise_line_id: LineId,
    pub ship_id: i32,
    pub sailing_date: NaiveDate,
    pub voyage_code: String,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.cruise_line_id, self.ship_id, self.sailing_date, self.voyage_code
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CabinClass {
    Interior,
    Oceanview,
    Balcony,
    Suite,
}

impl CabinClass {
    pub const ALL: [CabinClass; 4] = [
        CabinClass::Interior,
        CabinClass::Oceanview,
        CabinClass::Balcony,
        CabinClass::Suite,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CabinClass::Interior => "interior",
            CabinClass::Oceanview => "oceanview",
            CabinClass::Balcony => "balcony",
            CabinClass::Suite => "suite",
        }
    }
}

/// Cheapest current price per cabin class. `None` means not sold / unknown.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CabinPrices {
    pub interior: Option<f64>,
    pub oceanview: Option<f64>,
    pub balcony: Option<f64>,
    pub suite: Option<f64>,
}

impl CabinPrices {
    pub fn get(&self, class: CabinClass) -> Option<f64> {
        match class {
            CabinClass::Interior => self.interior,
            CabinClass::Oceanview => self.oceanview,
            CabinClass::Balcony => self.balcony,
            CabinClass::Suite => self.suite,
        }
    }

    pub fn set(&mut self, class: CabinClass, price: Option<f64>) {
        let slot = match class {
            CabinClass::Interior => &mut self.interior,
            CabinClass::Oceanview => &mut self.oceanview,
            CabinClass::Balcony => &mut self.balcony,
            CabinClass::Suite => &mut self.suite,
        };
        *slot = price;
    }

    pub fn cheapest(&self) -> Option<f64> {
        CabinClass::ALL
            .iter()
            .filter_map(|class| self.get(*class))
            .filter(|price| *price > 0.0)
            .fold(None, |acc: Option<f64>, price| match acc {
                Some(current) if current <= price => Some(current),
                _ => Some(price),
            })
    }

    pub fn is_empty(&self) -> bool {
        CabinClass::ALL.iter().all(|class| self.get(*class).is_none())
    }
}

/// One cell of the supplier rate/cabin pricing grid.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RateCell {
    pub price: Option<f64>,
    pub taxes: Option<f64>,
    pub fees: Option<f64>,
    pub cabin_type: Option<String>,
    pub available: bool,
}

/// rate code -> cabin code -> cell. Ordered so serialization is deterministic.
pub type PricingGrid = BTreeMap<String, BTreeMap<String, RateCell>>;

/// Ship content carried inside a source record; written as a secondary entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipContent {
    pub ship_id: i32,
    pub name: Option<String>,
    pub content: serde_json::Value,
}

/// One supplier file, parsed and validated. Never persisted verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub supplier_item_id: String,
    pub supplier_line_id: i32,
    pub ship_id: i32,
    pub sailing_date: NaiveDate,
    pub voyage_code: String,
    pub name: Option<String>,
    pub nights: Option<i32>,
    pub prices: CabinPrices,
    pub cheapest_price: Option<f64>,
    pub pricing: PricingGrid,
    pub ship: Option<ShipContent>,
    pub last_cached: Option<DateTime<Utc>>,
    pub file_path: String,
}

impl SourceRecord {
    pub fn natural_key(&self, cruise_line_id: LineId) -> NaturalKey {
        NaturalKey {
            cruise_line_id,
            ship_id: self.ship_id,
            sailing_date: self.sailing_date,
            voyage_code: self.voyage_code.clone(),
        }
    }

    pub fn is_available(&self) -> bool {
        !self.prices.is_empty()
            || self
                .pricing
                .values()
                .flat_map(|cabins| cabins.values())
                .any(|cell| cell.available && cell.price.is_some())
    }
}

/// Canonical, de-duplicated sailing. The read surface for search and booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sailing {
    pub id: Uuid,
    pub cruise_line_id: LineId,
    pub ship_id: i32,
    pub sailing_date: NaiveDate,
    pub voyage_code: String,
    pub supplier_item_id: String,
    pub name: Option<String>,
    pub nights: Option<i32>,
    pub prices: CabinPrices,
    pub cheapest_price: Option<f64>,
    pub is_available: bool,
    pub pricing: PricingGrid,
    pub content_path: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Sailing {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            cruise_line_id: self.cruise_line_id,
            ship_id: self.ship_id,
            sailing_date: self.sailing_date,
            voyage_code: self.voyage_code.clone(),
        }
    }
}

/// Full set of derived fields written for one sailing in a single statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SailingWrite {
    pub key: NaturalKey,
    pub supplier_item_id: String,
    pub name: Option<String>,
    pub nights: Option<i32>,
    pub prices: CabinPrices,
    pub cheapest_price: Option<f64>,
    pub is_available: bool,
    pub pricing: PricingGrid,
    pub content_path: String,
    pub checksum: String,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted(Uuid),
    Updated(Uuid),
}

impl WriteOutcome {
    pub fn sailing_id(self) -> Uuid {
        match self {
            WriteOutcome::Inserted(id) | WriteOutcome::Updated(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} `{}`", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPhase {
    Before,
    After,
}

string_enum!(SnapshotPhase, "snapshot phase", { Before => "before", After => "after" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Insert,
    Update,
}

string_enum!(ChangeType, "change type", { Insert => "insert", Update => "update" });

/// Per-field price movement between a before/after snapshot pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceDelta {
    pub field: String,
    pub before: Option<f64>,
    pub after: Option<f64>,
    /// `after - before`, unrounded.
    pub absolute: Option<f64>,
    pub percent: Option<f64>,
}

impl fmt::Display for PriceDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let price = |p: Option<f64>| p.map_or_else(|| "-".to_string(), |p| format!("{p:.2}"));
        write!(f, "{} {} -> {}", self.field, price(self.before), price(self.after))?;
        match (self.absolute, self.percent) {
            (Some(abs), Some(pct)) => write!(f, " ({abs:+.2}, {pct:+.2}%)"),
            (Some(abs), None) => write!(f, " ({abs:+.2})"),
            _ => Ok(()),
        }
    }
}

/// Immutable point-in-time copy of a sailing's price fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub id: Uuid,
    pub sailing_id: Uuid,
    pub batch_id: Uuid,
    pub phase: SnapshotPhase,
    pub change_type: ChangeType,
    pub prices: CabinPrices,
    pub cheapest_price: Option<f64>,
    pub deltas: Vec<PriceDelta>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Processing,
    Completed,
    Failed,
}

string_enum!(LockStatus, "lock status", {
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl LockStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, LockStatus::Processing)
    }
}

/// Live counters a lock holder publishes on every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub planned: u32,
    pub processed: u32,
    pub succeeded: u32,
    pub skipped: u32,
    pub failed: u32,
}

/// Per-scope exclusivity token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLock {
    pub scope_id: LineId,
    pub holder_id: Uuid,
    pub status: LockStatus,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub progress: Progress,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncLock {
    /// Held by someone and not yet expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == LockStatus::Processing && self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LineUpdate,
    ItemUpdate,
}

string_enum!(EventKind, "event kind", {
    LineUpdate => "line_update",
    ItemUpdate => "item_update",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Webhook,
    Admin,
    Schedule,
}

string_enum!(TriggerSource, "trigger source", {
    Webhook => "webhook",
    Admin => "admin",
    Schedule => "schedule",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Dispatched,
    Done,
    Deduplicated,
    Failed,
}

string_enum!(EventStatus, "event status", {
    Pending => "pending",
    Dispatched => "dispatched",
    Done => "done",
    Deduplicated => "deduplicated",
    Failed => "failed",
});

/// Append-only trigger log entry; pending entries double as the job queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub scope_id: LineId,
    pub supplier_line_id: i32,
    pub kind: EventKind,
    pub source: TriggerSource,
    pub item_paths: Vec<String>,
    pub received_at: DateTime<Utc>,
    pub status: EventStatus,
    pub attempts: i32,
    pub dispatched_at: Option<DateTime<Utc>>,
}

/// Unit of work handed to a worker: every pending trigger of one scope, collapsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeJob {
    pub scope_id: LineId,
    pub supplier_line_id: i32,
    pub kind: EventKind,
    /// Union of item paths; empty for line updates.
    pub item_paths: Vec<String>,
    pub event_ids: Vec<Uuid>,
    /// Highest attempt count among the collapsed events.
    pub attempts: i32,
    pub claimed_at: DateTime<Utc>,
}

/// Per-scope result handed to the notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub scope_id: LineId,
    pub supplier_line_id: i32,
    pub holder_id: Uuid,
    pub kind: EventKind,
    pub status: LockStatus,
    pub files_found: u32,
    pub files_processed: u32,
    pub created: u32,
    pub updated: u32,
    pub skipped: u32,
    pub failed: u32,
    /// Subset of `failed` that could not be parsed even after repair.
    pub corrupt: u32,
    pub duration_ms: u64,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_delta_rounds_only_when_displayed() {
        let delta = PriceDelta {
            field: "interior".to_string(),
            before: Some(899.99),
            after: Some(899.98),
            absolute: Some(899.98 - 899.99),
            percent: Some((899.98 - 899.99) / 899.99 * 100.0),
        };
        assert_ne!(delta.absolute, Some(-0.01));
        assert_eq!(delta.to_string(), "interior 899.99 -> 899.98 (-0.01, -0.00%)");

        let appeared = PriceDelta {
            field: "suite".to_string(),
            before: None,
            after: Some(2400.0),
            absolute: None,
            percent: None,
        };
        assert_eq!(appeared.to_string(), "suite - -> 2400.00");
    }

    #[test]
    fn cheapest_ignores_missing_and_zero_prices() {
        let prices = CabinPrices {
            interior: None,
            oceanview: Some(0.0),
            balcony: Some(1299.0),
            suite: Some(899.5),
        };
        assert_eq!(prices.cheapest(), Some(899.5));
        assert_eq!(CabinPrices::default().cheapest(), None);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [LockStatus::Processing, LockStatus::Completed, LockStatus::Failed] {
            assert_eq!(status.as_str().parse::<LockStatus>().unwrap(), status);
        }
        let err = "stuck".parse::<LockStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown lock status `stuck`");
    }

    #[test]
    fn lock_is_active_only_while_processing_and_unexpired() {
        let now = Utc::now();
        let mut lock = SyncLock {
            scope_id: 7,
            holder_id: Uuid::new_v4(),
            status: LockStatus::Processing,
            acquired_at: now,
            heartbeat_at: now,
            expires_at: now + chrono::Duration::seconds(60),
            progress: Progress::default(),
            error: None,
            finished_at: None,
        };
        assert!(lock.is_active(now));
        assert!(!lock.is_active(now + chrono::Duration::seconds(61)));
        lock.status = LockStatus::Completed;
        assert!(!lock.is_active(now));
    }
}
