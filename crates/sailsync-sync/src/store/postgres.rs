//! Postgres-backed [`CatalogStore`]. Runtime-checked queries only, so the
//! workspace builds without a live database.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sailsync_core::{
    CabinPrices, EventStatus, LineId, LockStatus, NaturalKey, PriceDelta, PriceSnapshot,
    PricingGrid, Progress, Sailing, SailingWrite, ShipContent, SyncLock, WebhookEvent,
    WriteOutcome,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::{CatalogStore, StoreError};

const SAILING_COLUMNS: &str = r#"
    id, cruise_line_id, ship_id, sailing_date, voyage_code, supplier_item_id,
    name, nights, interior_price, oceanview_price, balcony_price, suite_price,
    cheapest_price, is_available, pricing, content_path, checksum,
    created_at, updated_at, last_seen_at
"#;

const SNAPSHOT_COLUMNS: &str = r#"
    id, sailing_id, batch_id, phase, change_type, interior_price, oceanview_price,
    balcony_price, suite_price, cheapest_price, deltas, captured_at
"#;

const LOCK_COLUMNS: &str = r#"
    scope_id, holder_id, status, acquired_at, heartbeat_at, expires_at,
    planned, processed, succeeded, skipped, failed, error, finished_at
"#;

const EVENT_COLUMNS: &str = r#"
    id, scope_id, supplier_line_id, kind, source, item_paths, received_at,
    status, attempts, dispatched_at
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .with_context(|| "connecting to the catalog database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running catalog migrations")?;
        info!("catalog migrations applied");
        Ok(())
    }
}

fn map_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") | Some("23503") => StoreError::Conflict(db.message().to_string()),
            // serialization failure, deadlock, admin shutdown
            Some("40001") | Some("40P01") | Some("57P01") => {
                StoreError::Transient(db.message().to_string())
            }
            _ => StoreError::Other(err.to_string()),
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            StoreError::Transient(err.to_string())
        }
        _ => StoreError::Other(err.to_string()),
    }
}

fn parse_column<T: FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    let text: String = row.try_get(column).map_err(map_err)?;
    text.parse()
        .map_err(|err: T::Err| StoreError::Other(format!("{column}: {err}")))
}

fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_db_count(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i32 = row.try_get(column).map_err(map_err)?;
    Ok(u32::try_from(value).unwrap_or(0))
}

fn prices_from_row(row: &PgRow) -> Result<CabinPrices, StoreError> {
    Ok(CabinPrices {
        interior: row.try_get("interior_price").map_err(map_err)?,
        oceanview: row.try_get("oceanview_price").map_err(map_err)?,
        balcony: row.try_get("balcony_price").map_err(map_err)?,
        suite: row.try_get("suite_price").map_err(map_err)?,
    })
}

fn sailing_from_row(row: &PgRow) -> Result<Sailing, StoreError> {
    let pricing: Json<PricingGrid> = row.try_get("pricing").map_err(map_err)?;
    Ok(Sailing {
        id: row.try_get("id").map_err(map_err)?,
        cruise_line_id: row.try_get("cruise_line_id").map_err(map_err)?,
        ship_id: row.try_get("ship_id").map_err(map_err)?,
        sailing_date: row.try_get("sailing_date").map_err(map_err)?,
        voyage_code: row.try_get("voyage_code").map_err(map_err)?,
        supplier_item_id: row.try_get("supplier_item_id").map_err(map_err)?,
        name: row.try_get("name").map_err(map_err)?,
        nights: row.try_get("nights").map_err(map_err)?,
        prices: prices_from_row(row)?,
        cheapest_price: row.try_get("cheapest_price").map_err(map_err)?,
        is_available: row.try_get("is_available").map_err(map_err)?,
        pricing: pricing.0,
        content_path: row.try_get("content_path").map_err(map_err)?,
        checksum: row.try_get("checksum").map_err(map_err)?,
        created_at: row.try_get("created_at").map_err(map_err)?,
        updated_at: row.try_get("updated_at").map_err(map_err)?,
        last_seen_at: row.try_get("last_seen_at").map_err(map_err)?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<PriceSnapshot, StoreError> {
    let deltas: Json<Vec<PriceDelta>> = row.try_get("deltas").map_err(map_err)?;
    Ok(PriceSnapshot {
        id: row.try_get("id").map_err(map_err)?,
        sailing_id: row.try_get("sailing_id").map_err(map_err)?,
        batch_id: row.try_get("batch_id").map_err(map_err)?,
        phase: parse_column(row, "phase")?,
        change_type: parse_column(row, "change_type")?,
        prices: prices_from_row(row)?,
        cheapest_price: row.try_get("cheapest_price").map_err(map_err)?,
        deltas: deltas.0,
        captured_at: row.try_get("captured_at").map_err(map_err)?,
    })
}

fn lock_from_row(row: &PgRow) -> Result<SyncLock, StoreError> {
    Ok(SyncLock {
        scope_id: row.try_get("scope_id").map_err(map_err)?,
        holder_id: row.try_get("holder_id").map_err(map_err)?,
        status: parse_column(row, "status")?,
        acquired_at: row.try_get("acquired_at").map_err(map_err)?,
        heartbeat_at: row.try_get("heartbeat_at").map_err(map_err)?,
        expires_at: row.try_get("expires_at").map_err(map_err)?,
        progress: Progress {
            planned: from_db_count(row, "planned")?,
            processed: from_db_count(row, "processed")?,
            succeeded: from_db_count(row, "succeeded")?,
            skipped: from_db_count(row, "skipped")?,
            failed: from_db_count(row, "failed")?,
        },
        error: row.try_get("error").map_err(map_err)?,
        finished_at: row.try_get("finished_at").map_err(map_err)?,
    })
}

fn event_from_row(row: &PgRow) -> Result<WebhookEvent, StoreError> {
    let item_paths: Json<Vec<String>> = row.try_get("item_paths").map_err(map_err)?;
    Ok(WebhookEvent {
        id: row.try_get("id").map_err(map_err)?,
        scope_id: row.try_get("scope_id").map_err(map_err)?,
        supplier_line_id: row.try_get("supplier_line_id").map_err(map_err)?,
        kind: parse_column(row, "kind")?,
        source: parse_column(row, "source")?,
        item_paths: item_paths.0,
        received_at: row.try_get("received_at").map_err(map_err)?,
        status: parse_column(row, "status")?,
        attempts: row.try_get("attempts").map_err(map_err)?,
        dispatched_at: row.try_get("dispatched_at").map_err(map_err)?,
    })
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn find_sailing(&self, key: &NaturalKey) -> Result<Option<Sailing>, StoreError> {
        let sql = format!(
            "SELECT {SAILING_COLUMNS} FROM sailings
              WHERE cruise_line_id = $1 AND ship_id = $2
                AND sailing_date = $3 AND voyage_code = $4"
        );
        let row = sqlx::query(&sql)
            .bind(key.cruise_line_id)
            .bind(key.ship_id)
            .bind(key.sailing_date)
            .bind(&key.voyage_code)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.as_ref().map(sailing_from_row).transpose()
    }

    async fn upsert_sailing(&self, write: &SailingWrite) -> Result<WriteOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sailings (
                id, cruise_line_id, ship_id, sailing_date, voyage_code, supplier_item_id,
                name, nights, interior_price, oceanview_price, balcony_price, suite_price,
                cheapest_price, is_available, pricing, content_path, checksum,
                created_at, updated_at, last_seen_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $18, $18)
            ON CONFLICT (cruise_line_id, ship_id, sailing_date, voyage_code) DO UPDATE
               SET supplier_item_id = EXCLUDED.supplier_item_id,
                   name = EXCLUDED.name,
                   nights = EXCLUDED.nights,
                   interior_price = EXCLUDED.interior_price,
                   oceanview_price = EXCLUDED.oceanview_price,
                   balcony_price = EXCLUDED.balcony_price,
                   suite_price = EXCLUDED.suite_price,
                   cheapest_price = EXCLUDED.cheapest_price,
                   is_available = EXCLUDED.is_available,
                   pricing = EXCLUDED.pricing,
                   content_path = EXCLUDED.content_path,
                   checksum = EXCLUDED.checksum,
                   updated_at = EXCLUDED.updated_at,
                   last_seen_at = EXCLUDED.last_seen_at
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(write.key.cruise_line_id)
        .bind(write.key.ship_id)
        .bind(write.key.sailing_date)
        .bind(&write.key.voyage_code)
        .bind(&write.supplier_item_id)
        .bind(&write.name)
        .bind(write.nights)
        .bind(write.prices.interior)
        .bind(write.prices.oceanview)
        .bind(write.prices.balcony)
        .bind(write.prices.suite)
        .bind(write.cheapest_price)
        .bind(write.is_available)
        .bind(Json(&write.pricing))
        .bind(&write.content_path)
        .bind(&write.checksum)
        .bind(write.seen_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;

        let id: Uuid = row.try_get("id").map_err(map_err)?;
        let inserted: bool = row.try_get("inserted").map_err(map_err)?;
        Ok(if inserted {
            WriteOutcome::Inserted(id)
        } else {
            WriteOutcome::Updated(id)
        })
    }

    async fn upsert_ship(&self, line_id: LineId, ship: &ShipContent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ships (ship_id, line_id, name, content, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (ship_id) DO UPDATE
               SET line_id = EXCLUDED.line_id,
                   name = EXCLUDED.name,
                   content = EXCLUDED.content,
                   updated_at = now()
            "#,
        )
        .bind(ship.ship_id)
        .bind(line_id)
        .bind(&ship.name)
        .bind(Json(&ship.content))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO price_snapshots (
                id, sailing_id, batch_id, phase, change_type, interior_price,
                oceanview_price, balcony_price, suite_price, cheapest_price, deltas, captured_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.sailing_id)
        .bind(snapshot.batch_id)
        .bind(snapshot.phase.as_str())
        .bind(snapshot.change_type.as_str())
        .bind(snapshot.prices.interior)
        .bind(snapshot.prices.oceanview)
        .bind(snapshot.prices.balcony)
        .bind(snapshot.prices.suite)
        .bind(snapshot.cheapest_price)
        .bind(Json(&snapshot.deltas))
        .bind(snapshot.captured_at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn snapshots_for(&self, sailing_id: Uuid) -> Result<Vec<PriceSnapshot>, StoreError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM price_snapshots
              WHERE sailing_id = $1
              ORDER BY captured_at, phase DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(sailing_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn try_acquire_lock(
        &self,
        scope_id: LineId,
        holder_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<SyncLock>, StoreError> {
        // The conditional DO UPDATE makes check-and-take one atomic statement;
        // no row comes back while another holder is active.
        let sql = format!(
            r#"
            INSERT INTO sync_locks (scope_id, holder_id, status, acquired_at, heartbeat_at, expires_at)
            VALUES ($1, $2, 'processing', $3, $3, $4)
            ON CONFLICT (scope_id) DO UPDATE
               SET holder_id = EXCLUDED.holder_id,
                   status = 'processing',
                   acquired_at = EXCLUDED.acquired_at,
                   heartbeat_at = EXCLUDED.heartbeat_at,
                   expires_at = EXCLUDED.expires_at,
                   planned = 0, processed = 0, succeeded = 0, skipped = 0, failed = 0,
                   error = NULL,
                   finished_at = NULL
             WHERE sync_locks.status <> 'processing'
                OR sync_locks.expires_at <= $3
                OR sync_locks.holder_id = EXCLUDED.holder_id
            RETURNING {LOCK_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(scope_id)
            .bind(holder_id)
            .bind(now)
            .bind(expires_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.as_ref().map(lock_from_row).transpose()
    }

    async fn heartbeat_lock(
        &self,
        scope_id: LineId,
        holder_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        progress: Progress,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_locks
               SET heartbeat_at = $3, expires_at = $4,
                   planned = $5, processed = $6, succeeded = $7, skipped = $8, failed = $9
             WHERE scope_id = $1 AND holder_id = $2 AND status = 'processing'
            "#,
        )
        .bind(scope_id)
        .bind(holder_id)
        .bind(now)
        .bind(expires_at)
        .bind(to_db_count(progress.planned))
        .bind(to_db_count(progress.processed))
        .bind(to_db_count(progress.succeeded))
        .bind(to_db_count(progress.skipped))
        .bind(to_db_count(progress.failed))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() == 1)
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
        let result = sqlx::query(
            r#"
            UPDATE sync_locks
               SET status = $3, error = $4, heartbeat_at = $5, finished_at = $5,
                   planned = $6, processed = $7, succeeded = $8, skipped = $9, failed = $10
             WHERE scope_id = $1 AND holder_id = $2 AND status = 'processing'
            "#,
        )
        .bind(scope_id)
        .bind(holder_id)
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(to_db_count(progress.planned))
        .bind(to_db_count(progress.processed))
        .bind(to_db_count(progress.succeeded))
        .bind(to_db_count(progress.skipped))
        .bind(to_db_count(progress.failed))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_lock(&self, scope_id: LineId) -> Result<Option<SyncLock>, StoreError> {
        let sql = format!("SELECT {LOCK_COLUMNS} FROM sync_locks WHERE scope_id = $1");
        let row = sqlx::query(&sql)
            .bind(scope_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.as_ref().map(lock_from_row).transpose()
    }

    async fn reap_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<LineId>, StoreError> {
        let scopes = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE sync_locks
               SET status = 'failed',
                   error = 'lock expired without release',
                   finished_at = $1
             WHERE status = 'processing' AND expires_at <= $1
            RETURNING scope_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(scopes)
    }

    async fn insert_event(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events (
                id, scope_id, supplier_line_id, kind, source, item_paths, received_at,
                status, attempts, dispatched_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id)
        .bind(event.scope_id)
        .bind(event.supplier_line_id)
        .bind(event.kind.as_str())
        .bind(event.source.as_str())
        .bind(Json(&event.item_paths))
        .bind(event.received_at)
        .bind(event.status.as_str())
        .bind(event.attempts)
        .bind(event.dispatched_at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn open_events(&self, scope_id: LineId) -> Result<Vec<WebhookEvent>, StoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events
              WHERE scope_id = $1 AND status IN ('pending', 'dispatched')
              ORDER BY received_at"
        );
        let rows = sqlx::query(&sql)
            .bind(scope_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn pending_scopes(&self, limit: usize) -> Result<Vec<LineId>, StoreError> {
        let scopes = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT scope_id
              FROM webhook_events
             WHERE status = 'pending'
             GROUP BY scope_id
             ORDER BY min(received_at)
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(scopes)
    }

    async fn claim_events(
        &self,
        scope_id: LineId,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let sql = format!(
            r#"
            UPDATE webhook_events
               SET status = 'dispatched', dispatched_at = $2
             WHERE id IN (
                   SELECT id FROM webhook_events
                    WHERE scope_id = $1 AND status = 'pending'
                    FOR UPDATE SKIP LOCKED
             )
            RETURNING {EVENT_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(scope_id)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        let mut events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        events.sort_by_key(|e| e.received_at);
        Ok(events)
    }

    async fn finish_events(&self, ids: &[Uuid], status: EventStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE webhook_events SET status = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn requeue_events(
        &self,
        ids: &[Uuid],
        consume_attempt: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE webhook_events
               SET status = 'pending',
                   dispatched_at = NULL,
                   attempts = attempts + CASE WHEN $2 THEN 1 ELSE 0 END
             WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .bind(consume_attempt)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn requeue_stale_dispatched(
        &self,
        dispatched_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
               SET status = 'pending', dispatched_at = NULL, attempts = attempts + 1
             WHERE status = 'dispatched' AND dispatched_at < $1
            "#,
        )
        .bind(dispatched_before)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn events_for_scope(&self, scope_id: LineId) -> Result<Vec<WebhookEvent>, StoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE scope_id = $1 ORDER BY received_at"
        );
        let rows = sqlx::query(&sql)
            .bind(scope_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn delete_stale_sailings(&self, departed_before: NaiveDate) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sailings s
             WHERE s.sailing_date < $1
               AND NOT EXISTS (SELECT 1 FROM quote_requests q WHERE q.sailing_id = s.id)
               AND NOT EXISTS (SELECT 1 FROM booking_sessions b WHERE b.sailing_id = s.id)
            "#,
        )
        .bind(departed_before)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn snapshots_to_archive(
        &self,
        cutoff: DateTime<Utc>,
        departed_before: NaiveDate,
    ) -> Result<Vec<PriceSnapshot>, StoreError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM price_snapshots p
              WHERE p.captured_at < $1
                 OR EXISTS (
                    SELECT 1 FROM sailings s
                     WHERE s.id = p.sailing_id
                       AND s.sailing_date < $2
                       AND NOT EXISTS (SELECT 1 FROM quote_requests q WHERE q.sailing_id = s.id)
                       AND NOT EXISTS (SELECT 1 FROM booking_sessions b WHERE b.sailing_id = s.id)
                 )
              ORDER BY p.captured_at"
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .bind(departed_before)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn delete_snapshots_captured_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM price_snapshots WHERE captured_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_events_received_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_events
             WHERE received_at < $1
               AND status IN ('done', 'deduplicated', 'failed')
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }
}
