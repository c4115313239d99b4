//! In-process feed with the remote layout, used for dry runs and tests.
//! Supports failure injection so pool recovery can be exercised.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::session::{Connector, FileSession, SessionError};

#[derive(Debug, Default)]
struct FeedInner {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    latency: Mutex<Duration>,
    /// Sessions opened before this epoch are dead.
    epoch: AtomicU64,
    fail_connects: AtomicUsize,
    fail_ops: AtomicUsize,
    connects: AtomicUsize,
    retrievals: AtomicUsize,
    active_retrievals: AtomicUsize,
    peak_retrievals: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryFeed {
    inner: Arc<FeedInner>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.files().insert(normalize(&path.into()), body.into());
    }

    pub fn remove(&self, path: &str) -> Option<Vec<u8>> {
        self.files().remove(&normalize(path))
    }

    pub fn len(&self) -> usize {
        self.files().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_latency(&self, latency: Duration) {
        *self
            .inner
            .latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Every session opened so far fails its next operation.
    pub fn kill_sessions(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// The next `n` connection attempts are refused.
    pub fn fail_next_connects(&self, n: usize) {
        self.inner.fail_connects.store(n, Ordering::SeqCst);
    }

    /// The next `n` operations on any session fail and take their session down.
    pub fn fail_next_ops(&self, n: usize) {
        self.inner.fail_ops.store(n, Ordering::SeqCst);
    }

    pub fn pending_failures(&self) -> usize {
        self.inner.fail_ops.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn retrieval_count(&self) -> usize {
        self.inner.retrievals.load(Ordering::SeqCst)
    }

    /// Highest number of retrievals observed running at the same time.
    pub fn peak_concurrent_retrievals(&self) -> usize {
        self.inner.peak_retrievals.load(Ordering::SeqCst)
    }

    fn files(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.inner
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn latency(&self) -> Duration {
        *self
            .inner
            .latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Connector for MemoryFeed {
    async fn connect(&self) -> Result<Box<dyn FileSession>, SessionError> {
        if Self::take_one(&self.inner.fail_connects) {
            return Err(SessionError::Connect("connection refused".to_string()));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            feed: self.clone(),
            epoch: self.inner.epoch.load(Ordering::SeqCst),
            alive: true,
        }))
    }

    fn describe(&self) -> String {
        format!("memory feed ({} files)", self.len())
    }
}

struct MemorySession {
    feed: MemoryFeed,
    epoch: u64,
    alive: bool,
}

impl MemorySession {
    fn check(&mut self) -> Result<(), SessionError> {
        if self.epoch < self.feed.inner.epoch.load(Ordering::SeqCst) {
            self.alive = false;
        }
        if self.alive && MemoryFeed::take_one(&self.feed.inner.fail_ops) {
            self.alive = false;
        }
        if self.alive {
            Ok(())
        } else {
            Err(SessionError::Disconnected("connection reset by peer".to_string()))
        }
    }
}

#[async_trait]
impl FileSession for MemorySession {
    async fn list(&mut self, dir: &str) -> Result<Vec<String>, SessionError> {
        self.check()?;
        let prefix = format!("{}/", normalize(dir));
        let names: BTreeSet<String> = self
            .feed
            .files()
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(ToString::to_string)
            .collect();
        if names.is_empty() {
            return Err(SessionError::NotFound(dir.to_string()));
        }
        Ok(names.into_iter().collect())
    }

    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, SessionError> {
        self.check()?;
        let inner = &self.feed.inner;
        inner.retrievals.fetch_add(1, Ordering::SeqCst);
        let active = inner.active_retrievals.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak_retrievals.fetch_max(active, Ordering::SeqCst);

        let latency = self.feed.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let body = self.feed.files().get(&normalize(path)).cloned();
        inner.active_retrievals.fetch_sub(1, Ordering::SeqCst);
        body.ok_or_else(|| SessionError::NotFound(path.to_string()))
    }

    async fn probe(&mut self) -> Result<(), SessionError> {
        self.check()
    }

    async fn close(&mut self) {
        self.alive = false;
    }
}

fn normalize(path: &str) -> String {
    path.trim().trim_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_children_and_retrieves_files() {
        let feed = MemoryFeed::new();
        feed.insert("2025/05/7/231/1.json", b"{}".to_vec());
        feed.insert("2025/05/7/231/2.json", b"{}".to_vec());
        feed.insert("2025/05/7/400/3.json", b"{}".to_vec());

        let mut session = feed.connect().await.unwrap();
        assert_eq!(session.list("2025/05/7").await.unwrap(), vec!["231", "400"]);
        assert_eq!(
            session.list("2025/05/7/231").await.unwrap(),
            vec!["1.json", "2.json"]
        );
        assert_eq!(session.retrieve("2025/05/7/231/1.json").await.unwrap(), b"{}");
        assert!(matches!(
            session.list("2025/06/7").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn injected_failures_kill_the_session() {
        let feed = MemoryFeed::new();
        let mut session = feed.connect().await.unwrap();
        feed.fail_next_ops(1);
        assert!(session.probe().await.is_err());
        assert!(session.probe().await.is_err());
        assert_eq!(feed.pending_failures(), 0);

        let mut fresh = feed.connect().await.unwrap();
        assert!(fresh.probe().await.is_ok());
        feed.kill_sessions();
        assert!(fresh.probe().await.is_err());
    }
}
