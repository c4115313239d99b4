//! Fixed-size pool of sessions to the remote file source.
//!
//! Sessions are validated on every checkout. A dead session is removed and a
//! replacement is opened right away; if the pool falls below its safety floor
//! it is torn down and rebuilt from scratch. Every remote operation also goes
//! through an in-flight ceiling and a request-rate cap, and is retried with
//! exponential backoff on a fresh session.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::session::{entry_name, Connector, FeedPath, FileSession, SessionError};
use crate::{BackoffPolicy, RetryDisposition, SimpleTokenBucket, TokenBucketConfig};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub target_size: usize,
    /// Below this many live sessions the pool is rebuilt instead of patched.
    pub min_size: usize,
    pub max_in_flight: usize,
    pub rate_limit: Option<TokenBucketConfig>,
    pub backoff: BackoffPolicy,
    pub connect_timeout: Duration,
    pub op_timeout: Duration,
    pub batch_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_size: 3,
            min_size: 2,
            max_in_flight: 3,
            rate_limit: Some(TokenBucketConfig {
                capacity: 10,
                refill_every: Duration::from_millis(100),
            }),
            backoff: BackoffPolicy::default(),
            connect_timeout: Duration::from_secs(15),
            op_timeout: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Uninitialized,
    Healthy,
    Degraded,
    Reinitializing,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub state: PoolState,
    pub size: usize,
    pub idle: usize,
    pub leased: usize,
    pub target_size: usize,
    pub created: u64,
    pub removed: u64,
    pub reinitializations: u64,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool is closed")]
    Closed,
    #[error("no session available: {0}")]
    Unavailable(#[source] SessionError),
    #[error("{path}: gave up after {attempts} attempts: {source}")]
    Exhausted {
        path: String,
        attempts: usize,
        source: SessionError,
    },
    #[error("{path}: {source}")]
    Remote { path: String, source: SessionError },
}

impl PoolError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PoolError::Remote {
                source: SessionError::NotFound(_),
                ..
            }
        )
    }
}

struct PooledSession {
    id: u64,
    generation: u64,
    session: Box<dyn FileSession>,
    opened_at: Instant,
}

struct Inner {
    state: PoolState,
    generation: u64,
    idle: VecDeque<PooledSession>,
    /// Sessions of the current generation that are checked out or being opened.
    leased: usize,
}

impl Inner {
    fn size(&self) -> usize {
        self.idle.len() + self.leased
    }
}

enum Candidate {
    Idle(PooledSession),
    Grow(u64),
    Wait,
}

enum Op<'a> {
    List(&'a str),
    Retrieve(&'a str),
}

enum OpOutput {
    Names(Vec<String>),
    Bytes(Vec<u8>),
}

impl Op<'_> {
    fn path(&self) -> &str {
        match self {
            Op::List(path) | Op::Retrieve(path) => path,
        }
    }

    async fn run(&self, session: &mut dyn FileSession) -> Result<OpOutput, SessionError> {
        match self {
            Op::List(dir) => session.list(dir).await.map(|names| {
                OpOutput::Names(names.iter().filter_map(|n| entry_name(n)).collect())
            }),
            Op::Retrieve(path) => session.retrieve(path).await.map(OpOutput::Bytes),
        }
    }
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    inner: Mutex<Inner>,
    available: Notify,
    in_flight: Semaphore,
    rate: Option<SimpleTokenBucket>,
    next_id: AtomicU64,
    created: AtomicU64,
    removed: AtomicU64,
    reinitializations: AtomicU64,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let in_flight = config.max_in_flight.max(1);
        let rate = config.rate_limit.map(SimpleTokenBucket::new);
        Self {
            connector,
            config,
            inner: Mutex::new(Inner {
                state: PoolState::Uninitialized,
                generation: 0,
                idle: VecDeque::new(),
                leased: 0,
            }),
            available: Notify::new(),
            in_flight: Semaphore::new(in_flight),
            rate,
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            reinitializations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Opens sessions up to the target size. Fails only if none could be opened.
    pub async fn init(&self) -> Result<PoolStats, PoolError> {
        let (generation, missing) = {
            let inner = self.lock_inner();
            if inner.state == PoolState::Closed {
                return Err(PoolError::Closed);
            }
            (
                inner.generation,
                self.config.target_size.saturating_sub(inner.size()),
            )
        };

        let (fresh, last_error) = self.open_many(generation, missing).await;
        let mut inner = self.lock_inner();
        inner.idle.extend(fresh);
        if inner.size() == 0 {
            return Err(PoolError::Unavailable(last_error.unwrap_or_else(|| {
                SessionError::Connect("no sessions opened".to_string())
            })));
        }
        self.settle(&mut inner);
        let stats = self.stats_locked(&inner);
        drop(inner);
        info!(
            source = %self.connector.describe(),
            size = stats.size,
            target = stats.target_size,
            "connection pool ready"
        );
        Ok(stats)
    }

    pub async fn shutdown(&self) {
        let drained: Vec<PooledSession> = {
            let mut inner = self.lock_inner();
            inner.state = PoolState::Closed;
            inner.leased = 0;
            inner.idle.drain(..).collect()
        };
        let count = drained.len();
        for mut pooled in drained {
            let _ = timeout(self.config.connect_timeout, pooled.session.close()).await;
        }
        self.in_flight.close();
        self.available.notify_waiters();
        info!(closed = count, "connection pool shut down");
    }

    pub fn state(&self) -> PoolState {
        self.lock_inner().state
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock_inner();
        self.stats_locked(&inner)
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    /// Probes every idle session, removes the dead ones, and tops the pool
    /// back up (rebuilding it if it fell below the floor).
    pub async fn health_check(&self) -> PoolStats {
        let batch: Vec<PooledSession> = {
            let mut inner = self.lock_inner();
            if matches!(inner.state, PoolState::Closed | PoolState::Reinitializing) {
                return self.stats_locked(&inner);
            }
            let batch: Vec<PooledSession> = inner.idle.drain(..).collect();
            inner.leased += batch.len();
            batch
        };

        let probed = batch.len();
        let mut dead = 0usize;
        for mut pooled in batch {
            let alive = matches!(
                timeout(self.config.op_timeout, pooled.session.probe()).await,
                Ok(Ok(()))
            );
            if !alive {
                dead += 1;
                self.removed.fetch_add(1, Ordering::Relaxed);
                debug!(session = pooled.id, "health sweep found dead session");
            }
            self.check_in(pooled, alive);
        }
        if dead > 0 {
            warn!(probed, dead, "health sweep removed dead sessions");
        }

        for _ in 0..self.config.target_size {
            let before = {
                let inner = self.lock_inner();
                if inner.size() >= self.config.target_size || inner.state == PoolState::Closed {
                    break;
                }
                inner.size()
            };
            self.replace_and_heal().await;
            if self.lock_inner().size() <= before {
                break;
            }
        }

        self.stats()
    }

    /// Tears the pool down and opens a fresh set of sessions. Sessions that are
    /// checked out at this point are dropped when they come back.
    pub async fn reinitialize(&self) -> Result<PoolStats, PoolError> {
        let (generation, old) = {
            let mut inner = self.lock_inner();
            match inner.state {
                PoolState::Closed => return Err(PoolError::Closed),
                PoolState::Reinitializing => return Ok(self.stats_locked(&inner)),
                _ => {}
            }
            inner.state = PoolState::Reinitializing;
            inner.generation += 1;
            inner.leased = 0;
            let old: Vec<PooledSession> = inner.idle.drain(..).collect();
            (inner.generation, old)
        };
        warn!(
            dropped = old.len(),
            generation, "connection pool below safety floor; reinitializing"
        );
        for mut pooled in old {
            let _ = timeout(self.config.connect_timeout, pooled.session.close()).await;
        }

        let (fresh, last_error) = self.open_many(generation, self.config.target_size).await;
        self.reinitializations.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.lock_inner();
        if inner.state == PoolState::Closed {
            drop(inner);
            fresh.into_iter().for_each(Self::discard);
            return Err(PoolError::Closed);
        }
        inner.idle.extend(fresh);
        inner.state = PoolState::Degraded;
        self.settle(&mut inner);
        let size = inner.size();
        let stats = self.stats_locked(&inner);
        drop(inner);
        self.available.notify_waiters();

        if size == 0 {
            return Err(PoolError::Unavailable(last_error.unwrap_or_else(|| {
                SessionError::Connect("no sessions opened".to_string())
            })));
        }
        info!(size, generation, "connection pool reinitialized");
        Ok(stats)
    }

    pub async fn list(&self, dir: &str) -> Result<Vec<String>, PoolError> {
        match self.execute(Op::List(dir)).await? {
            OpOutput::Names(names) => Ok(names),
            OpOutput::Bytes(_) => Err(PoolError::Remote {
                path: dir.to_string(),
                source: SessionError::Protocol("listing returned file content".to_string()),
            }),
        }
    }

    pub async fn fetch(&self, path: &str) -> Result<Vec<u8>, PoolError> {
        match self.execute(Op::Retrieve(path)).await? {
            OpOutput::Bytes(bytes) => Ok(bytes),
            OpOutput::Names(_) => Err(PoolError::Remote {
                path: path.to_string(),
                source: SessionError::Protocol("retrieval returned a listing".to_string()),
            }),
        }
    }

    /// Every item file for one supplier line across the given (year, month)s.
    /// Months or ships missing on the remote side are skipped.
    pub async fn list_scope(
        &self,
        supplier_line_id: i32,
        months: &[(i32, u32)],
    ) -> Result<Vec<FeedPath>, PoolError> {
        let mut paths = Vec::new();
        for &(year, month) in months {
            let line_dir = FeedPath::line_dir(year, month, supplier_line_id);
            let ships = match self.list(&line_dir).await {
                Ok(names) => names,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            };
            for ship in ships {
                let Ok(ship_id) = ship.parse::<i32>() else {
                    debug!(dir = %line_dir, entry = %ship, "skipping non-ship entry");
                    continue;
                };
                let ship_dir = FeedPath::ship_dir(year, month, supplier_line_id, ship_id);
                let items = match self.list(&ship_dir).await {
                    Ok(names) => names,
                    Err(err) if err.is_not_found() => continue,
                    Err(err) => return Err(err),
                };
                paths.extend(
                    items
                        .iter()
                        .filter_map(|item| FeedPath::parse(&format!("{ship_dir}/{item}"))),
                );
            }
        }
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Fetches one batch concurrently; results keep the input order.
    pub async fn fetch_batch(
        self: &Arc<Self>,
        paths: &[FeedPath],
    ) -> Vec<(FeedPath, Result<Vec<u8>, PoolError>)> {
        let mut set = JoinSet::new();
        for (index, path) in paths.iter().cloned().enumerate() {
            let pool = Arc::clone(self);
            set.spawn(async move {
                let result = pool.fetch(&path.to_path()).await;
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<Vec<u8>, PoolError>>> =
            paths.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(err) => warn!(error = %err, "fetch task aborted"),
            }
        }

        paths
            .iter()
            .cloned()
            .zip(results)
            .map(|(path, result)| {
                let result = result.unwrap_or_else(|| {
                    Err(PoolError::Remote {
                        path: path.to_path(),
                        source: SessionError::Protocol("fetch task aborted".to_string()),
                    })
                });
                (path, result)
            })
            .collect()
    }

    async fn execute(&self, op: Op<'_>) -> Result<OpOutput, PoolError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| PoolError::Closed)?;
        if let Some(bucket) = &self.rate {
            bucket.take().await;
        }

        let span = info_span!("remote_op", path = op.path());
        async {
            let attempts = self.config.backoff.attempts();
            let mut last_error = None;
            for attempt in 0..attempts {
                if attempt > 0 {
                    tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt - 1)).await;
                }

                let mut pooled = match self.checkout().await {
                    Ok(pooled) => pooled,
                    Err(PoolError::Unavailable(err)) => {
                        warn!(attempt = attempt + 1, error = %err, "no usable session");
                        last_error = Some(err);
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                let result = match timeout(self.config.op_timeout, op.run(pooled.session.as_mut()))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SessionError::Timeout(self.config.op_timeout)),
                };

                match result {
                    Ok(output) => {
                        self.check_in(pooled, true);
                        return Ok(output);
                    }
                    Err(err) => {
                        let poisoned = err.poisons_session();
                        if poisoned {
                            self.removed.fetch_add(1, Ordering::Relaxed);
                        }
                        self.check_in(pooled, !poisoned);
                        if poisoned {
                            self.replace_and_heal().await;
                        }
                        if err.disposition() == RetryDisposition::NonRetryable {
                            return Err(PoolError::Remote {
                                path: op.path().to_string(),
                                source: err,
                            });
                        }
                        warn!(attempt = attempt + 1, error = %err, "remote operation failed");
                        last_error = Some(err);
                    }
                }
            }

            Err(PoolError::Exhausted {
                path: op.path().to_string(),
                attempts,
                source: last_error.unwrap_or_else(|| {
                    SessionError::Disconnected("no attempt completed".to_string())
                }),
            })
        }
        .instrument(span)
        .await
    }

    /// Hands out a validated session. Dead sessions found here are removed and
    /// replaced before trying the next one.
    async fn checkout(&self) -> Result<PooledSession, PoolError> {
        let mut dead = 0usize;
        loop {
            let candidate = {
                let mut inner = self.lock_inner();
                if inner.state == PoolState::Closed {
                    return Err(PoolError::Closed);
                }
                if let Some(pooled) = inner.idle.pop_front() {
                    inner.leased += 1;
                    Candidate::Idle(pooled)
                } else if inner.state != PoolState::Reinitializing
                    && inner.size() < self.config.target_size
                {
                    inner.leased += 1;
                    Candidate::Grow(inner.generation)
                } else {
                    Candidate::Wait
                }
            };

            match candidate {
                Candidate::Idle(mut pooled) => {
                    let probe = match timeout(self.config.op_timeout, pooled.session.probe()).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(SessionError::Timeout(self.config.op_timeout)),
                    };
                    let err = match probe {
                        Ok(()) => return Ok(pooled),
                        Err(err) => err,
                    };
                    debug!(
                        session = pooled.id,
                        age_ms = pooled.opened_at.elapsed().as_millis() as u64,
                        error = %err,
                        "removing dead session"
                    );
                    self.removed.fetch_add(1, Ordering::Relaxed);
                    self.check_in(pooled, false);
                    self.replace_and_heal().await;
                    dead += 1;
                    if dead > self.config.target_size {
                        return Err(PoolError::Unavailable(err));
                    }
                }
                Candidate::Grow(generation) => {
                    return match self.open_session(generation).await {
                        Ok(pooled) => Ok(pooled),
                        Err(err) => {
                            self.forget_reservation(generation);
                            Err(PoolError::Unavailable(err))
                        }
                    };
                }
                Candidate::Wait => {
                    let _ = timeout(Duration::from_millis(250), self.available.notified()).await;
                }
            }
        }
    }

    fn check_in(&self, pooled: PooledSession, healthy: bool) {
        let mut inner = self.lock_inner();
        let current = pooled.generation == inner.generation;
        if current {
            inner.leased = inner.leased.saturating_sub(1);
        }
        let rejected = if healthy && current && inner.state != PoolState::Closed {
            inner.idle.push_back(pooled);
            None
        } else {
            Some(pooled)
        };
        self.settle(&mut inner);
        drop(inner);
        self.available.notify_one();
        if let Some(pooled) = rejected {
            debug!(session = pooled.id, healthy, current, "discarding session");
            Self::discard(pooled);
        }
    }

    /// Opens one replacement if below target, or rebuilds below the floor.
    async fn replace_and_heal(&self) {
        let generation = {
            let mut inner = self.lock_inner();
            if matches!(inner.state, PoolState::Closed | PoolState::Reinitializing) {
                return;
            }
            if inner.size() < self.config.min_size {
                None
            } else if inner.size() < self.config.target_size {
                inner.leased += 1;
                Some(inner.generation)
            } else {
                return;
            }
        };

        let Some(generation) = generation else {
            if let Err(err) = self.reinitialize().await {
                warn!(error = %err, "pool reinitialization failed");
            }
            return;
        };

        match self.open_session(generation).await {
            Ok(pooled) => {
                debug!(session = pooled.id, "replacement session opened");
                self.check_in(pooled, true);
            }
            Err(err) => {
                self.forget_reservation(generation);
                warn!(error = %err, "replacement session could not be opened");
            }
        }
    }

    async fn open_session(&self, generation: u64) -> Result<PooledSession, SessionError> {
        let session = match timeout(self.config.connect_timeout, self.connector.connect()).await {
            Ok(result) => result?,
            Err(_) => return Err(SessionError::Timeout(self.config.connect_timeout)),
        };
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(PooledSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            generation,
            session,
            opened_at: Instant::now(),
        })
    }

    async fn open_many(
        &self,
        generation: u64,
        count: usize,
    ) -> (Vec<PooledSession>, Option<SessionError>) {
        let mut fresh = Vec::with_capacity(count);
        let mut last_error = None;
        for _ in 0..count {
            match self.open_session(generation).await {
                Ok(pooled) => fresh.push(pooled),
                Err(err) => {
                    warn!(error = %err, "could not open session");
                    last_error = Some(err);
                }
            }
        }
        (fresh, last_error)
    }

    fn forget_reservation(&self, generation: u64) {
        let mut inner = self.lock_inner();
        if inner.generation == generation {
            inner.leased = inner.leased.saturating_sub(1);
        }
        self.settle(&mut inner);
    }

    fn discard(mut pooled: PooledSession) {
        tokio::spawn(async move {
            pooled.session.close().await;
        });
    }

    fn settle(&self, inner: &mut Inner) {
        if matches!(
            inner.state,
            PoolState::Closed | PoolState::Reinitializing
        ) || (inner.state == PoolState::Uninitialized && inner.size() == 0)
        {
            return;
        }
        let next = if inner.size() >= self.config.target_size {
            PoolState::Healthy
        } else {
            PoolState::Degraded
        };
        if next != inner.state {
            debug!(from = ?inner.state, to = ?next, size = inner.size(), "pool state changed");
            inner.state = next;
        }
    }

    fn stats_locked(&self, inner: &Inner) -> PoolStats {
        PoolStats {
            state: inner.state,
            size: inner.size(),
            idle: inner.idle.len(),
            leased: inner.leased,
            target_size: self.config.target_size,
            created: self.created.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            reinitializations: self.reinitializations.load(Ordering::Relaxed),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFeed;

    fn test_config() -> PoolConfig {
        PoolConfig {
            target_size: 3,
            min_size: 2,
            max_in_flight: 3,
            rate_limit: None,
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
            },
            connect_timeout: Duration::from_secs(1),
            op_timeout: Duration::from_secs(1),
            batch_size: 10,
        }
    }

    fn pool_with(feed: &MemoryFeed, config: PoolConfig) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(Arc::new(feed.clone()), config))
    }

    #[tokio::test]
    async fn init_opens_target_sessions() {
        let feed = MemoryFeed::new();
        let pool = pool_with(&feed, test_config());
        let stats = pool.init().await.unwrap();
        assert_eq!(stats.size, 3);
        assert_eq!(stats.state, PoolState::Healthy);
        assert_eq!(feed.connect_count(), 3);
    }

    #[tokio::test]
    async fn init_fails_when_nothing_connects() {
        let feed = MemoryFeed::new();
        feed.fail_next_connects(3);
        let pool = pool_with(&feed, test_config());
        assert!(matches!(pool.init().await, Err(PoolError::Unavailable(_))));
    }

    #[tokio::test]
    async fn dead_sessions_are_removed_on_checkout_and_replaced() {
        let feed = MemoryFeed::new();
        feed.insert("2025/05/7/231/1.json", b"{\"ok\":true}".to_vec());
        let pool = pool_with(&feed, test_config());
        pool.init().await.unwrap();

        feed.kill_sessions();
        let body = pool.fetch("2025/05/7/231/1.json").await.unwrap();
        assert_eq!(body, b"{\"ok\":true}");

        let stats = pool.stats();
        assert_eq!(stats.size, 3);
        assert_eq!(stats.removed, 3);
        assert_eq!(stats.state, PoolState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_converges_after_consecutive_failures() {
        let feed = MemoryFeed::new();
        feed.insert("2025/05/7/231/1.json", b"{}".to_vec());
        let pool = pool_with(&feed, test_config());
        pool.init().await.unwrap();

        feed.fail_next_ops(6);
        let fetched = pool.fetch("2025/05/7/231/1.json").await;
        assert!(fetched.is_ok(), "fetch should succeed via replacements: {fetched:?}");
        assert_eq!(feed.pending_failures(), 0);

        let stats = pool.health_check().await;
        assert_eq!(stats.size, 3);
        assert_eq!(stats.state, PoolState::Healthy);
        assert!(stats.removed >= 6);
    }

    #[tokio::test]
    async fn sweep_rebuilds_pool_below_floor() {
        let feed = MemoryFeed::new();
        let pool = pool_with(&feed, test_config());
        pool.init().await.unwrap();

        feed.kill_sessions();
        let stats = pool.health_check().await;
        assert_eq!(stats.size, 3);
        assert_eq!(stats.reinitializations, 1);
        assert_eq!(stats.state, PoolState::Healthy);
    }

    #[tokio::test]
    async fn missing_files_are_not_retried() {
        let feed = MemoryFeed::new();
        let pool = pool_with(&feed, test_config());
        pool.init().await.unwrap();

        let err = pool.fetch("2025/05/7/231/404.json").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(feed.retrieval_count(), 1);
        assert_eq!(pool.stats().size, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_outage_exhausts_retries() {
        let feed = MemoryFeed::new();
        feed.insert("2025/05/7/231/1.json", b"{}".to_vec());
        let pool = pool_with(&feed, test_config());
        pool.init().await.unwrap();

        feed.fail_next_connects(usize::MAX);
        feed.kill_sessions();
        let err = pool.fetch("2025/05/7/231/1.json").await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { attempts: 4, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_ceiling_bounds_concurrent_fetches() {
        let feed = MemoryFeed::new();
        feed.set_latency(Duration::from_millis(50));
        let mut paths = Vec::new();
        for item in 0..8 {
            let path = format!("2025/05/7/231/{item}.json");
            feed.insert(path.clone(), b"{}".to_vec());
            paths.push(FeedPath::parse(&path).unwrap());
        }
        let mut config = test_config();
        config.max_in_flight = 2;
        let pool = pool_with(&feed, config);
        pool.init().await.unwrap();

        let results = pool.fetch_batch(&paths).await;
        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(results[3].0, paths[3]);
        assert!(feed.peak_concurrent_retrievals() <= 2);
    }

    #[tokio::test]
    async fn list_scope_walks_months_and_ships() {
        let feed = MemoryFeed::new();
        feed.insert("2025/05/7/231/1.json", b"{}".to_vec());
        feed.insert("2025/05/7/231/2.json", b"{}".to_vec());
        feed.insert("2025/06/7/400/3.json", b"{}".to_vec());
        feed.insert("2025/06/7/400/notes.txt", b"x".to_vec());
        feed.insert("2025/06/9/400/4.json", b"{}".to_vec());
        let pool = pool_with(&feed, test_config());
        pool.init().await.unwrap();

        let paths = pool
            .list_scope(7, &[(2025, 4), (2025, 5), (2025, 6)])
            .await
            .unwrap();
        let rendered: Vec<String> = paths.iter().map(FeedPath::to_path).collect();
        assert_eq!(
            rendered,
            vec![
                "2025/05/7/231/1.json",
                "2025/05/7/231/2.json",
                "2025/06/7/400/3.json",
            ]
        );
    }

    #[tokio::test]
    async fn closed_pool_rejects_work() {
        let feed = MemoryFeed::new();
        let pool = pool_with(&feed, test_config());
        pool.init().await.unwrap();
        pool.shutdown().await;
        assert_eq!(pool.state(), PoolState::Closed);
        assert!(matches!(
            pool.fetch("2025/05/7/231/1.json").await,
            Err(PoolError::Closed)
        ));
    }
}
