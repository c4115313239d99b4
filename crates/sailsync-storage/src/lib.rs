//! Remote feed access for the sailing sync: pooled sessions, fetch throttling,
//! and the quarantine area for payloads that cannot be parsed.

use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;

pub mod ftp;
pub mod memory;
pub mod mirror;
pub mod pool;
pub mod quarantine;
pub mod session;

pub use ftp::{FtpConfig, FtpConnector};
pub use memory::MemoryFeed;
pub use mirror::MirrorConnector;
pub use pool::{ConnectionPool, PoolConfig, PoolError, PoolState, PoolStats};
pub use quarantine::{QuarantineStore, QuarantinedPayload};
pub use session::{Connector, FeedPath, FileSession, SessionError};

pub const CRATE_NAME: &str = "sailsync-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Total attempts including the first one.
    pub fn attempts(&self) -> usize {
        self.max_retries + 1
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Request-rate cap shared by every fetch that goes through one pool.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let refill_nanos = self.refill_every.as_nanos();
            if refill_nanos > 0 {
                let elapsed = state.last_refill.elapsed();
                let refills = elapsed.as_nanos() / refill_nanos;
                if refills > 0 {
                    let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                    state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                    state.last_refill = Instant::now();
                }
            } else {
                state.tokens = self.capacity;
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
        assert_eq!(policy.attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_caps_request_rate() {
        let bucket = SimpleTokenBucket::new(TokenBucketConfig {
            capacity: 2,
            refill_every: Duration::from_millis(100),
        });
        let started = Instant::now();
        for _ in 0..4 {
            bucket.take().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
