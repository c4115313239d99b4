//! Scheduled cleanup of stale sailings and aged-out history. Runs outside the
//! scope lock space.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parquet::arrow::ArrowWriter;
use sailsync_core::PriceSnapshot;
use sailsync_storage::sha256_hex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::CatalogStore;

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    /// Days past departure before an unreferenced sailing is removed.
    pub grace_days: i64,
    pub snapshot_days: i64,
    pub event_days: i64,
    pub archive_dir: Option<PathBuf>,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            grace_days: 7,
            snapshot_days: 180,
            event_days: 30,
            archive_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionReport {
    pub sailings_deleted: u64,
    pub snapshots_archived: u64,
    pub snapshots_deleted: u64,
    pub events_deleted: u64,
    pub archive_manifest: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub cutoff: DateTime<Utc>,
    /// Snapshots of unreferenced sailings that departed before this date are included.
    pub departed_before: NaiveDate,
    pub rows: u64,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub async fn run_retention(
    store: Arc<dyn CatalogStore>,
    settings: &RetentionSettings,
    now: DateTime<Utc>,
) -> Result<RetentionReport> {
    let mut report = RetentionReport::default();

    let snapshot_cutoff = now - Duration::days(settings.snapshot_days);
    let departed_before = (now - Duration::days(settings.grace_days)).date_naive();

    // Stale sailings take their snapshots with them, so the archive covers
    // both before anything is deleted.
    let archived = match &settings.archive_dir {
        Some(dir) => {
            archive_snapshots(store.as_ref(), dir, snapshot_cutoff, departed_before).await
        }
        None => Ok(None),
    };
    match archived {
        Ok(archive) => {
            if let Some((manifest, rows)) = archive {
                report.snapshots_archived = rows;
                report.archive_manifest = Some(manifest);
            }
            report.snapshots_deleted = store
                .delete_snapshots_captured_before(snapshot_cutoff)
                .await
                .context("pruning price snapshots")?;
            report.sailings_deleted = store
                .delete_stale_sailings(departed_before)
                .await
                .context("deleting stale sailings")?;
        }
        Err(err) => {
            warn!(
                error = %format!("{err:#}"),
                "snapshot archive failed; keeping snapshots and stale sailings for the next run"
            );
        }
    }

    report.events_deleted = store
        .delete_events_received_before(now - Duration::days(settings.event_days))
        .await
        .context("pruning webhook events")?;

    info!(
        sailings = report.sailings_deleted,
        snapshots = report.snapshots_deleted,
        archived = report.snapshots_archived,
        events = report.events_deleted,
        "retention finished"
    );
    Ok(report)
}

async fn archive_snapshots(
    store: &dyn CatalogStore,
    archive_dir: &Path,
    cutoff: DateTime<Utc>,
    departed_before: NaiveDate,
) -> Result<Option<(PathBuf, u64)>> {
    let snapshots = store
        .snapshots_to_archive(cutoff, departed_before)
        .await
        .context("loading snapshots to archive")?;
    if snapshots.is_empty() {
        return Ok(None);
    }
    let run_dir = archive_dir.join(Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
    let rows = snapshots.len() as u64;
    let manifest = tokio::task::spawn_blocking(move || {
        write_archive(&run_dir, &snapshots, cutoff, departed_before)
    })
    .await
    .context("archive task panicked")??;
    Ok(Some((manifest, rows)))
}

fn write_archive(
    run_dir: &Path,
    snapshots: &[PriceSnapshot],
    cutoff: DateTime<Utc>,
    departed_before: NaiveDate,
) -> Result<PathBuf> {
    std::fs::create_dir_all(run_dir).with_context(|| format!("creating {}", run_dir.display()))?;
    let parquet_path = run_dir.join("price_snapshots.parquet");
    write_snapshots_parquet(&parquet_path, snapshots)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        cutoff,
        departed_before,
        rows: snapshots.len() as u64,
        files: vec![manifest_entry("price_snapshots", run_dir, &parquet_path)?],
    };
    let manifest_path = run_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing archive manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_snapshots_parquet(path: &Path, snapshots: &[PriceSnapshot]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("sailing_id", DataType::Utf8, false),
        ArrowField::new("batch_id", DataType::Utf8, false),
        ArrowField::new("phase", DataType::Utf8, false),
        ArrowField::new("change_type", DataType::Utf8, false),
        ArrowField::new("interior_price", DataType::Float64, true),
        ArrowField::new("oceanview_price", DataType::Float64, true),
        ArrowField::new("balcony_price", DataType::Float64, true),
        ArrowField::new("suite_price", DataType::Float64, true),
        ArrowField::new("cheapest_price", DataType::Float64, true),
        ArrowField::new("deltas", DataType::Utf8, false),
        ArrowField::new("captured_at", DataType::Utf8, false),
    ]));

    let text = |f: fn(&PriceSnapshot) -> String| {
        StringArray::from(snapshots.iter().map(f).collect::<Vec<_>>())
    };
    let price = |f: fn(&PriceSnapshot) -> Option<f64>| {
        Float64Array::from(snapshots.iter().map(f).collect::<Vec<_>>())
    };

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(text(|s| s.id.to_string())),
            Arc::new(text(|s| s.sailing_id.to_string())),
            Arc::new(text(|s| s.batch_id.to_string())),
            Arc::new(text(|s| s.phase.to_string())),
            Arc::new(text(|s| s.change_type.to_string())),
            Arc::new(price(|s| s.prices.interior)),
            Arc::new(price(|s| s.prices.oceanview)),
            Arc::new(price(|s| s.prices.balcony)),
            Arc::new(price(|s| s.prices.suite)),
            Arc::new(price(|s| s.cheapest_price)),
            Arc::new(text(|s| {
                serde_json::to_string(&s.deltas).unwrap_or_else(|_| "[]".to_string())
            })),
            Arc::new(text(|s| s.captured_at.to_rfc3339())),
        ],
    )
    .context("building price snapshot record batch")?;
    write_parquet(path, batch)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, base: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = sha256_hex(&bytes);
    let rel = path
        .strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use sailsync_core::{
        CabinPrices, ChangeType, EventKind, EventStatus, NaturalKey, SailingWrite, SnapshotPhase,
        TriggerSource, WebhookEvent,
    };
    use uuid::Uuid;

    async fn sailing(store: &MemoryStore, voyage: &str, date: NaiveDate) -> Uuid {
        store
            .upsert_sailing(&SailingWrite {
                key: NaturalKey {
                    cruise_line_id: 7,
                    ship_id: 231,
                    sailing_date: date,
                    voyage_code: voyage.to_string(),
                },
                supplier_item_id: voyage.to_string(),
                name: None,
                nights: Some(7),
                prices: CabinPrices::default(),
                cheapest_price: None,
                is_available: true,
                pricing: Default::default(),
                content_path: String::new(),
                checksum: String::new(),
                seen_at: Utc::now(),
            })
            .await
            .unwrap()
            .sailing_id()
    }

    fn snapshot(sailing_id: Uuid, captured_at: DateTime<Utc>) -> PriceSnapshot {
        PriceSnapshot {
            id: Uuid::new_v4(),
            sailing_id,
            batch_id: Uuid::new_v4(),
            phase: SnapshotPhase::After,
            change_type: ChangeType::Insert,
            prices: CabinPrices {
                interior: Some(899.0),
                ..CabinPrices::default()
            },
            cheapest_price: Some(899.0),
            deltas: vec![],
            captured_at,
        }
    }

    #[tokio::test]
    async fn stale_unreferenced_sailings_go_and_referenced_ones_stay() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let long_gone = (now - Duration::days(30)).date_naive();
        let just_sailed = (now - Duration::days(2)).date_naive();

        sailing(&store, "OLD", long_gone).await;
        let quoted = sailing(&store, "QUOTED", long_gone).await;
        let booked = sailing(&store, "BOOKED", long_gone).await;
        sailing(&store, "GRACE", just_sailed).await;
        sailing(&store, "FUTURE", (now + Duration::days(60)).date_naive()).await;
        store.add_quote_request(quoted);
        store.add_booking_session(booked);

        let report = run_retention(store.clone(), &RetentionSettings::default(), now)
            .await
            .unwrap();
        assert_eq!(report.sailings_deleted, 1);
        let voyages: Vec<String> = store.sailings().into_iter().map(|s| s.voyage_code).collect();
        assert_eq!(voyages.len(), 4);
        assert!(!voyages.contains(&"OLD".to_string()));

        store.remove_quote_request(quoted);
        store.remove_booking_session(booked);
        let report = run_retention(store.clone(), &RetentionSettings::default(), now)
            .await
            .unwrap();
        assert_eq!(report.sailings_deleted, 2);
        let mut voyages: Vec<String> =
            store.sailings().into_iter().map(|s| s.voyage_code).collect();
        voyages.sort();
        assert_eq!(voyages, vec!["FUTURE".to_string(), "GRACE".to_string()]);
    }

    #[tokio::test]
    async fn stale_sailing_history_is_archived_before_it_goes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let gone = sailing(&store, "GONE", (now - Duration::days(30)).date_naive()).await;
        let live = sailing(&store, "LIVE", (now + Duration::days(30)).date_naive()).await;
        store
            .insert_snapshot(&snapshot(gone, now - Duration::days(40)))
            .await
            .unwrap();
        store.insert_snapshot(&snapshot(live, now)).await.unwrap();

        let settings = RetentionSettings {
            archive_dir: Some(dir.path().to_path_buf()),
            ..RetentionSettings::default()
        };
        let report = run_retention(store.clone(), &settings, now).await.unwrap();
        assert_eq!(report.sailings_deleted, 1);
        assert_eq!(report.snapshots_archived, 1);
        assert_eq!(report.snapshots_deleted, 0);
        assert_eq!(store.snapshot_count(), 1);

        let manifest: ParquetManifest = serde_json::from_slice(
            &std::fs::read(report.archive_manifest.unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.rows, 1);
        assert_eq!(manifest.departed_before, (now - Duration::days(7)).date_naive());
    }

    #[tokio::test]
    async fn failed_archive_keeps_stale_sailings_and_their_history() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let gone = sailing(&store, "GONE", (now - Duration::days(30)).date_naive()).await;
        store
            .insert_snapshot(&snapshot(gone, now - Duration::days(400)))
            .await
            .unwrap();

        let settings = RetentionSettings {
            archive_dir: Some(blocker),
            ..RetentionSettings::default()
        };
        let report = run_retention(store.clone(), &settings, now).await.unwrap();
        assert_eq!(report, RetentionReport::default());
        assert_eq!(store.sailings().len(), 1);
        assert_eq!(store.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn old_snapshots_are_archived_before_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let id = sailing(&store, "A", (now + Duration::days(30)).date_naive()).await;
        store
            .insert_snapshot(&snapshot(id, now - Duration::days(400)))
            .await
            .unwrap();
        store
            .insert_snapshot(&snapshot(id, now - Duration::days(200)))
            .await
            .unwrap();
        store.insert_snapshot(&snapshot(id, now)).await.unwrap();

        let settings = RetentionSettings {
            archive_dir: Some(dir.path().to_path_buf()),
            ..RetentionSettings::default()
        };
        let report = run_retention(store.clone(), &settings, now).await.unwrap();
        assert_eq!(report.snapshots_archived, 2);
        assert_eq!(report.snapshots_deleted, 2);
        assert_eq!(store.snapshot_count(), 1);

        let manifest_path = report.archive_manifest.unwrap();
        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.rows, 2);
        let entry = &manifest.files[0];
        let parquet_path = manifest_path.parent().unwrap().join(&entry.path);
        let bytes = std::fs::read(&parquet_path).unwrap();
        assert_eq!(entry.bytes, bytes.len() as u64);
        assert_eq!(entry.sha256, sailsync_storage::sha256_hex(&bytes));

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&parquet_path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let rows: usize = reader.map(|batch| batch.unwrap().num_rows()).sum();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn only_terminal_events_age_out() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let old = now - Duration::days(60);
        for status in [EventStatus::Done, EventStatus::Deduplicated, EventStatus::Pending] {
            store
                .insert_event(&WebhookEvent {
                    id: Uuid::new_v4(),
                    scope_id: 7,
                    supplier_line_id: 7,
                    kind: EventKind::LineUpdate,
                    source: TriggerSource::Schedule,
                    item_paths: vec![],
                    received_at: old,
                    status,
                    attempts: 0,
                    dispatched_at: None,
                })
                .await
                .unwrap();
        }
        let report = run_retention(store.clone(), &RetentionSettings::default(), now)
            .await
            .unwrap();
        assert_eq!(report.events_deleted, 2);
        assert_eq!(store.events_for_scope(7).await.unwrap().len(), 1);
    }
}
