//! Wires the queue, the worker pool, and the schedules into one service.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sailsync_adapters::ParseOptions;
use sailsync_core::{LineId, LockStatus, SyncLock, SyncSummary, TriggerSource};
use sailsync_storage::{
    Connector, ConnectionPool, FtpConnector, MemoryFeed, MirrorConnector, PoolError, PoolStats,
    QuarantineStore,
};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::{FeedSourceKind, SyncConfig};
use crate::dispatch::{Admission, Dispatcher, JobResolution};
use crate::intake::{LineMapping, Trigger};
use crate::lock::LockManager;
use crate::notify::{LogNotifier, Notifier, SlackNotifier};
use crate::retention::{run_retention, RetentionReport};
use crate::store::{CatalogStore, PgStore, StoreError};
use crate::upsert::UpsertEngine;
use crate::worker::{ScopeOutcome, ScopeWorker};

pub fn connector_for(config: &SyncConfig) -> Arc<dyn Connector> {
    match config.feed_source {
        FeedSourceKind::Ftp => Arc::new(FtpConnector::new(config.ftp_config())),
        FeedSourceKind::Mirror => Arc::new(MirrorConnector::new(config.mirror_dir.clone())),
        FeedSourceKind::Memory => {
            warn!("FEED_SOURCE=memory starts with an empty in-process feed");
            Arc::new(MemoryFeed::new())
        }
    }
}

pub fn notifier_for(config: &SyncConfig) -> Result<Arc<dyn Notifier>> {
    Ok(match &config.slack_webhook_url {
        Some(url) => Arc::new(SlackNotifier::new(url.clone(), config.backoff())?),
        None => Arc::new(LogNotifier),
    })
}

pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn CatalogStore>,
    pool: Arc<ConnectionPool>,
    mapping: Arc<LineMapping>,
    dispatcher: Dispatcher,
    locks: LockManager,
    worker: ScopeWorker,
    notifier: Arc<dyn Notifier>,
    workers: Arc<Semaphore>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn CatalogStore>,
        connector: Arc<dyn Connector>,
        mapping: LineMapping,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let retry = config.store_retry();
        let pool = Arc::new(ConnectionPool::new(connector, config.pool_config()));
        let mapping = Arc::new(mapping);
        let locks = LockManager::new(Arc::clone(&store), config.lock_ttl(), retry);
        let dispatcher = Dispatcher::new(Arc::clone(&store), config.dispatch_settings(), retry);
        let worker = ScopeWorker {
            pool: Arc::clone(&pool),
            locks: locks.clone(),
            upserts: UpsertEngine::new(Arc::clone(&store), retry),
            mapping: Arc::clone(&mapping),
            quarantine: config.quarantine_dir.clone().map(QuarantineStore::new),
            parse_options: ParseOptions {
                repair_char_indexed: config.repair_char_indexed,
            },
            months_ahead: config.months_ahead,
            budget: config.job_budget(),
        };
        let workers = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));
        Self {
            config,
            store,
            pool,
            mapping,
            dispatcher,
            locks,
            worker,
            notifier,
            workers,
        }
    }

    /// Production wiring: Postgres store, configured feed, configured notifier.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = PgStore::connect(&config.database_url, config.db_max_connections).await?;
        let mapping = LineMapping::load(config.line_mapping_file.as_deref())?;
        let connector = connector_for(&config);
        let notifier = notifier_for(&config)?;
        Ok(Self::new(config, Arc::new(store), connector, mapping, notifier))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    pub fn mapping(&self) -> &LineMapping {
        &self.mapping
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn start(&self) -> Result<PoolStats, PoolError> {
        self.pool.init().await
    }

    pub async fn submit(&self, trigger: &Trigger) -> Result<Admission, StoreError> {
        self.dispatcher.admit(trigger).await
    }

    /// Claims as many scopes as there are free workers (capped per tick) and
    /// runs each on its own task. The handles resolve to the scope summary,
    /// or `None` when the scope was deferred.
    pub async fn tick(&self) -> Result<Vec<JoinHandle<Option<SyncSummary>>>, StoreError> {
        let capacity = self.workers.available_permits();
        let jobs = self.dispatcher.claim(capacity).await?;
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
                self.dispatcher.resolve(&job, JobResolution::Contended).await?;
                continue;
            };
            let worker = self.worker.clone();
            let dispatcher = self.dispatcher.clone();
            let notifier = Arc::clone(&self.notifier);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let outcome = worker.run(&job).await;
                let resolution = match &outcome {
                    Ok(ScopeOutcome::Finished(summary)) if summary.status == LockStatus::Completed => {
                        JobResolution::Completed
                    }
                    Ok(ScopeOutcome::Finished(_)) => JobResolution::Failed,
                    Ok(ScopeOutcome::Contended) => JobResolution::Contended,
                    Err(err) => {
                        warn!(scope = job.scope_id, error = %err, "scope job could not start");
                        JobResolution::Failed
                    }
                };
                if let Err(err) = dispatcher.resolve(&job, resolution).await {
                    warn!(scope = job.scope_id, error = %err, "could not settle scope events; the reaper will requeue them");
                }
                let Ok(ScopeOutcome::Finished(summary)) = outcome else {
                    return None;
                };
                if let Err(err) = notifier.notify(&summary).await {
                    warn!(scope = summary.scope_id, error = %err, "notification not delivered");
                }
                Some(summary)
            }));
        }
        Ok(handles)
    }

    /// Ticks until the queue stops yielding work. Stops early if a round only
    /// produced deferrals, so a scope held by another process does not spin.
    pub async fn run_pending(&self) -> Result<Vec<SyncSummary>> {
        let mut summaries = Vec::new();
        loop {
            let handles = self.tick().await.context("claiming scope jobs")?;
            if handles.is_empty() {
                break;
            }
            let mut progressed = false;
            for handle in handles {
                match handle.await {
                    Ok(Some(summary)) => {
                        progressed = true;
                        summaries.push(summary);
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "scope task panicked"),
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(summaries)
    }

    /// Admin path shared by the CLI and the HTTP trigger.
    pub async fn request_sync(
        &self,
        supplier_line_id: i32,
        force: bool,
        source: TriggerSource,
    ) -> Result<Admission> {
        let trigger =
            Trigger::line_update(&self.mapping, supplier_line_id, source, force, Utc::now())?;
        Ok(self.submit(&trigger).await?)
    }

    /// Queues a line update for every mapped scope. Covered scopes collapse.
    pub async fn reconcile_all(&self) -> Result<usize> {
        let mut queued = 0;
        for (scope_id, supplier_line_id) in self.mapping.scopes() {
            let trigger = Trigger::line_update(
                &self.mapping,
                supplier_line_id,
                TriggerSource::Schedule,
                false,
                Utc::now(),
            )?;
            let admission = self
                .submit(&trigger)
                .await
                .with_context(|| format!("queueing reconcile for cruise line {scope_id}"))?;
            if admission.is_queued() {
                queued += 1;
            }
        }
        info!(queued, scopes = self.mapping.len(), "reconcile pass queued");
        Ok(queued)
    }

    /// Fails expired locks and returns events of vanished workers to the queue.
    pub async fn reap(&self) -> Result<(usize, u64), StoreError> {
        let reaped = self.locks.reap().await?;
        let budget = chrono::Duration::from_std(self.config.job_budget())
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        let requeued = self
            .dispatcher
            .requeue_stale(budget + self.locks.ttl())
            .await?;
        Ok((reaped.len(), requeued))
    }

    pub async fn cleanup(&self) -> Result<RetentionReport> {
        run_retention(
            Arc::clone(&self.store),
            &self.config.retention_settings(),
            Utc::now(),
        )
        .await
    }

    pub async fn pool_health(&self) -> PoolStats {
        self.pool.health_check().await
    }

    pub async fn lock_status(&self, scope_id: LineId) -> Result<Option<SyncLock>, StoreError> {
        self.locks.status(scope_id).await
    }

    /// Waits until every running scope task has released its worker slot.
    pub async fn drain(&self) {
        let slots = u32::try_from(self.config.worker_concurrency.max(1)).unwrap_or(u32::MAX);
        match self.workers.acquire_many(slots).await {
            Ok(all) => drop(all),
            Err(_) => warn!("worker semaphore closed while draining"),
        }
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        add_job(&sched, &self.config.reconcile_cron, Arc::clone(self), |engine| async move {
            if let Err(err) = engine.reconcile_all().await {
                warn!(error = %format!("{err:#}"), "scheduled reconcile failed");
            }
        })
        .await?;
        add_job(&sched, &self.config.retention_cron, Arc::clone(self), |engine| async move {
            if let Err(err) = engine.cleanup().await {
                warn!(error = %format!("{err:#}"), "scheduled retention failed");
            }
        })
        .await?;
        add_job(&sched, &self.config.pool_health_cron, Arc::clone(self), |engine| async move {
            engine.pool_health().await;
        })
        .await?;
        add_job(&sched, &self.config.reaper_cron, Arc::clone(self), |engine| async move {
            match engine.reap().await {
                Ok((0, 0)) => {}
                Ok((locks, events)) => info!(locks, events, "reaper recovered stuck work"),
                Err(err) => warn!(error = %err, "lock reaper failed"),
            }
        })
        .await?;
        Ok(Some(sched))
    }

    /// Dispatch loop plus cron jobs until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Err(err) = self.start().await {
            warn!(error = %err, "feed pool not ready; the health sweep will retry");
        }
        let mut scheduler = self.maybe_build_scheduler().await?;
        if let Some(sched) = &scheduler {
            sched.start().await.context("starting scheduler")?;
        }

        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(100)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            workers = self.config.worker_concurrency,
            scopes = self.mapping.len(),
            "sync engine running"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(error = %err, "dispatch tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("sync engine stopping");
        if let Some(sched) = scheduler.as_mut() {
            sched.shutdown().await.context("stopping scheduler")?;
        }
        self.drain().await;
        self.pool.shutdown().await;
        Ok(())
    }
}

async fn add_job<F, Fut>(
    sched: &JobScheduler,
    cron: &str,
    engine: Arc<SyncEngine>,
    task: F,
) -> Result<()>
where
    F: Fn(Arc<SyncEngine>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let job = Job::new_async(cron, move |_uuid, _l| Box::pin(task(Arc::clone(&engine))))
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::LineEntry;
    use crate::store::MemoryStore;

    fn engine(store: Arc<MemoryStore>, feed: MemoryFeed) -> SyncEngine {
        let config = SyncConfig {
            feed_source: FeedSourceKind::Memory,
            quarantine_dir: None,
            rate_limit_per_sec: 0,
            ..SyncConfig::default()
        };
        let mapping = LineMapping::from_entries([LineEntry {
            supplier_line_id: 7,
            canonical_line_id: 7,
            name: Some("Royal Caribbean".to_string()),
        }]);
        SyncEngine::new(config, store, Arc::new(feed), mapping, Arc::new(LogNotifier))
    }

    #[tokio::test]
    async fn reconcile_collapses_against_open_events() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone(), MemoryFeed::new());
        assert_eq!(engine.reconcile_all().await.unwrap(), 1);
        assert_eq!(engine.reconcile_all().await.unwrap(), 0);
        assert_eq!(store.events_for_scope(7).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unmapped_admin_trigger_is_rejected() {
        let engine = engine(Arc::new(MemoryStore::new()), MemoryFeed::new());
        let err = engine
            .request_sync(999, false, TriggerSource::Admin)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not mapped"));
    }

    #[tokio::test]
    async fn empty_scope_completes_and_releases_its_worker() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone(), MemoryFeed::new());
        engine.start().await.unwrap();
        engine
            .request_sync(7, false, TriggerSource::Admin)
            .await
            .unwrap();

        let summaries = engine.run_pending().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].status, LockStatus::Completed);
        assert_eq!(summaries[0].files_found, 0);
        assert_eq!(
            engine.lock_status(7).await.unwrap().unwrap().status,
            LockStatus::Completed
        );
        assert_eq!(
            engine.workers.available_permits(),
            engine.config.worker_concurrency
        );
    }
}
