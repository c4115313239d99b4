use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use sailsync_core::{EventKind, EventStatus, LockStatus, Progress, ScopeJob, TriggerSource};
use sailsync_storage::MemoryFeed;
use sailsync_sync::intake::LineEntry;
use sailsync_sync::{
    normalize_webhook, Admission, CatalogStore, FeedSourceKind, LineMapping, LogNotifier,
    MemoryStore, ScopeOutcome, SyncConfig, SyncEngine,
};
use serde_json::json;
use uuid::Uuid;

const SHIP: i32 = 231;

fn test_config(quarantine: &tempfile::TempDir) -> SyncConfig {
    SyncConfig {
        feed_source: FeedSourceKind::Memory,
        rate_limit_per_sec: 0,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        dedup_window_secs: 0,
        months_ahead: 0,
        batch_size: 10,
        quarantine_dir: Some(quarantine.path().to_path_buf()),
        ..SyncConfig::default()
    }
}

fn mapping() -> LineMapping {
    LineMapping::from_entries([
        LineEntry {
            supplier_line_id: 7,
            canonical_line_id: 7,
            name: Some("Royal Caribbean".to_string()),
        },
        LineEntry {
            supplier_line_id: 5,
            canonical_line_id: 5,
            name: Some("Carnival".to_string()),
        },
        LineEntry {
            supplier_line_id: 105,
            canonical_line_id: 5,
            name: Some("Carnival (legacy)".to_string()),
        },
    ])
}

fn engine(store: Arc<MemoryStore>, feed: &MemoryFeed, quarantine: &tempfile::TempDir) -> SyncEngine {
    SyncEngine::new(
        test_config(quarantine),
        store,
        Arc::new(feed.clone()),
        mapping(),
        Arc::new(LogNotifier),
    )
}

fn feed_path(line: i32, item: u32) -> String {
    let now = Utc::now();
    format!("{}/{:02}/{line}/{SHIP}/{item}.json", now.year(), now.month())
}

fn payload(line: i32, item: u32, voyage: &str, interior: f64) -> Vec<u8> {
    let sail_date = (Utc::now() + chrono::Duration::days(90)).date_naive();
    serde_json::to_vec(&json!({
        "codetocruiseid": item.to_string(),
        "lineid": line,
        "shipid": SHIP,
        "saildate": sail_date.to_string(),
        "voyagecode": voyage,
        "name": "Caribbean Escape",
        "nights": 7,
        "cheapestinside": interior,
        "cheapestbalcony": interior + 400.0,
        "cheapestsuite": "N/A",
        "shipcontent": {"id": SHIP, "name": "Wonder of the Seas"}
    }))
    .unwrap()
}

/// The same document persisted one character per numbered key.
fn char_indexed(bytes: &[u8]) -> Vec<u8> {
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let map: serde_json::Map<String, serde_json::Value> = text
        .chars()
        .enumerate()
        .map(|(i, c)| (i.to_string(), json!(c.to_string())))
        .collect();
    serde_json::to_vec(&map).unwrap()
}

fn seed(feed: &MemoryFeed, line: i32, count: u32) {
    for item in 1..=count {
        feed.insert(feed_path(line, item), payload(line, item, &format!("V{item:03}"), 1000.0));
    }
}

fn line_webhook(line: i32) -> Vec<u8> {
    serde_json::to_vec(&json!({"event": "cruiseline_pricing_updated", "lineid": line})).unwrap()
}

#[tokio::test]
async fn webhook_burst_runs_one_job_with_exact_counts() {
    let quarantine = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let feed = MemoryFeed::new();
    seed(&feed, 7, 50);
    let engine = engine(store.clone(), &feed, &quarantine);
    engine.start().await.unwrap();

    engine
        .request_sync(7, false, TriggerSource::Admin)
        .await
        .unwrap();
    let first = engine.run_pending().await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].created, 50);
    assert_eq!(store.sailings().len(), 50);

    // 46 repriced (one of them char-indexed), 2 untouched, 2 corrupt
    for item in 1..=46 {
        let body = payload(7, item, &format!("V{item:03}"), 900.0);
        let body = if item == 1 { char_indexed(&body) } else { body };
        feed.insert(feed_path(7, item), body);
    }
    feed.insert(feed_path(7, 49), b"{\"codetocruiseid\": ".to_vec());
    feed.insert(feed_path(7, 50), b"[1, 2, 3]".to_vec());

    let now = Utc::now();
    let first_trigger = normalize_webhook(engine.mapping(), &line_webhook(7), now).unwrap();
    let second_trigger = normalize_webhook(
        engine.mapping(),
        &line_webhook(7),
        now + chrono::Duration::milliseconds(400),
    )
    .unwrap();
    assert!(engine.submit(&first_trigger).await.unwrap().is_queued());
    assert!(matches!(
        engine.submit(&second_trigger).await.unwrap(),
        Admission::Deduplicated { .. }
    ));

    let handles = engine.tick().await.unwrap();
    assert_eq!(handles.len(), 1);
    let summary = handles.into_iter().next().unwrap().await.unwrap().unwrap();
    assert_eq!(summary.status, LockStatus::Completed);
    assert_eq!(summary.files_found, 50);
    assert_eq!(summary.files_processed, 50);
    assert_eq!(summary.created, 0);
    assert_eq!(summary.updated, 46);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.corrupt, 2);

    let lock = engine.lock_status(7).await.unwrap().unwrap();
    assert_eq!(lock.status, LockStatus::Completed);
    assert_eq!(lock.progress.processed, 50);

    let events = store.events_for_scope(7).await.unwrap();
    let done = events.iter().filter(|e| e.status == EventStatus::Done).count();
    let collapsed = events
        .iter()
        .filter(|e| e.status == EventStatus::Deduplicated)
        .count();
    assert_eq!((done, collapsed), (2, 1));

    let quarantined = std::fs::read_dir(quarantine.path()).unwrap().count();
    assert!(quarantined > 0);

    let report = engine.cleanup().await.unwrap();
    assert_eq!(report.sailings_deleted, 0);
    assert_eq!(report.snapshots_deleted, 0);
    assert_eq!(store.sailings().len(), 50);
}

#[tokio::test]
async fn second_pass_over_unchanged_feed_writes_nothing() {
    let quarantine = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let feed = MemoryFeed::new();
    seed(&feed, 7, 12);
    let engine = engine(store.clone(), &feed, &quarantine);
    engine.start().await.unwrap();

    engine.request_sync(7, true, TriggerSource::Admin).await.unwrap();
    engine.run_pending().await.unwrap();
    let writes = store.write_count();

    engine.request_sync(7, true, TriggerSource::Admin).await.unwrap();
    let rerun = engine.run_pending().await.unwrap();
    assert_eq!(rerun[0].skipped, 12);
    assert_eq!(store.write_count(), writes);
}

#[tokio::test]
async fn held_scope_is_deferred_without_spending_an_attempt() {
    let quarantine = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let feed = MemoryFeed::new();
    seed(&feed, 7, 3);
    let engine = engine(store.clone(), &feed, &quarantine);
    engine.start().await.unwrap();

    engine.request_sync(7, false, TriggerSource::Admin).await.unwrap();
    let other = Uuid::new_v4();
    let now = Utc::now();
    store
        .try_acquire_lock(7, other, now, now + chrono::Duration::minutes(10))
        .await
        .unwrap()
        .unwrap();

    assert!(engine.run_pending().await.unwrap().is_empty());
    let events = store.events_for_scope(7).await.unwrap();
    assert_eq!(events[0].status, EventStatus::Pending);
    assert_eq!(events[0].attempts, 0);
    assert!(store.sailings().is_empty());

    store
        .release_lock(7, other, LockStatus::Completed, Progress::default(), None, Utc::now())
        .await
        .unwrap();
    let summaries = engine.run_pending().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].created, 3);
}

#[tokio::test]
async fn simultaneous_workers_on_one_scope_never_overlap() {
    let quarantine = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let feed = MemoryFeed::new();
    seed(&feed, 7, 6);
    feed.set_latency(Duration::from_millis(20));
    let engine = engine(store.clone(), &feed, &quarantine);
    engine.start().await.unwrap();

    let job = ScopeJob {
        scope_id: 7,
        supplier_line_id: 7,
        kind: EventKind::LineUpdate,
        item_paths: vec![],
        event_ids: vec![],
        attempts: 0,
        claimed_at: Utc::now(),
    };
    let worker = engine_worker(&engine, &store);
    let (a, b) = tokio::join!(worker.run(&job), worker.run(&job));
    let outcomes = [a.unwrap(), b.unwrap()];
    let finished = outcomes
        .iter()
        .filter(|o| matches!(o, ScopeOutcome::Finished(_)))
        .count();
    let contended = outcomes
        .iter()
        .filter(|o| matches!(o, ScopeOutcome::Contended))
        .count();
    assert_eq!((finished, contended), (1, 1));
    assert_eq!(store.sailings().len(), 6);
}

#[tokio::test]
async fn lock_reclaimed_mid_batch_stops_before_the_next_file() {
    let quarantine = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let feed = MemoryFeed::new();
    seed(&feed, 7, 8);
    let engine = engine(store.clone(), &feed, &quarantine);
    engine.start().await.unwrap();
    store.hand_over_lock_after(7, 3);

    let job = ScopeJob {
        scope_id: 7,
        supplier_line_id: 7,
        kind: EventKind::LineUpdate,
        item_paths: vec![],
        event_ids: vec![],
        attempts: 0,
        claimed_at: Utc::now(),
    };
    let worker = engine_worker(&engine, &store);
    let ScopeOutcome::Finished(summary) = worker.run(&job).await.unwrap() else {
        panic!("worker should have held the lock at the start");
    };

    assert_eq!(summary.status, LockStatus::Failed);
    assert_eq!(summary.files_found, 8);
    assert_eq!(summary.files_processed, 3);
    assert_eq!(summary.created, 3);
    assert_eq!(summary.errors[0], "scope lock lost");
    assert_eq!(store.sailings().len(), 3);

    let lock = store.get_lock(7).await.unwrap().unwrap();
    assert_ne!(lock.holder_id, summary.holder_id);
    assert_eq!(lock.status, LockStatus::Processing);
}

fn engine_worker(engine: &SyncEngine, store: &Arc<MemoryStore>) -> sailsync_sync::ScopeWorker {
    let config = engine.config();
    let retry = config.store_retry();
    let store: Arc<dyn CatalogStore> = store.clone();
    sailsync_sync::ScopeWorker {
        pool: Arc::clone(engine.pool()),
        locks: sailsync_sync::LockManager::new(Arc::clone(&store), config.lock_ttl(), retry),
        upserts: sailsync_sync::UpsertEngine::new(store, retry),
        mapping: Arc::new(mapping()),
        quarantine: None,
        parse_options: Default::default(),
        months_ahead: 0,
        budget: Duration::from_secs(30),
    }
}

#[tokio::test]
async fn pool_heals_through_consecutive_session_failures() {
    let quarantine = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let feed = MemoryFeed::new();
    seed(&feed, 7, 20);
    let engine = engine(store.clone(), &feed, &quarantine);
    engine.start().await.unwrap();
    let connects = feed.connect_count();

    feed.kill_sessions();
    feed.fail_next_ops(3);
    engine.request_sync(7, false, TriggerSource::Admin).await.unwrap();
    let summary = engine.run_pending().await.unwrap().remove(0);

    assert_eq!(summary.status, LockStatus::Completed);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.created, 20);
    assert!(feed.connect_count() > connects);
    assert!(engine.pool_health().await.size >= engine.config().pool_min_size);
}

#[tokio::test]
async fn aliased_supplier_lines_share_one_sailing() {
    let quarantine = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let feed = MemoryFeed::new();
    feed.insert(feed_path(5, 9001), payload(5, 9001, "CCL7", 650.0));
    feed.insert(feed_path(105, 4411), payload(105, 4411, "CCL7", 650.0));
    let engine = engine(store.clone(), &feed, &quarantine);
    engine.start().await.unwrap();

    engine.request_sync(105, false, TriggerSource::Admin).await.unwrap();
    let summary = engine.run_pending().await.unwrap().remove(0);
    assert_eq!(summary.scope_id, 5);
    assert_eq!(summary.files_found, 2);
    assert_eq!(summary.created, 1);
    assert_eq!(summary.skipped, 1);

    let sailings = store.sailings();
    assert_eq!(sailings.len(), 1);
    assert_eq!(sailings[0].cruise_line_id, 5);
    assert_eq!(sailings[0].voyage_code, "CCL7");
}
