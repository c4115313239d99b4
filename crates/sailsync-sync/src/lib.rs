//! Incremental sync of the sailing catalog: trigger intake, per-scope
//! locking, change detection, price history, and retention.

pub mod config;
pub mod detect;
pub mod dispatch;
pub mod engine;
pub mod intake;
pub mod lock;
pub mod notify;
pub mod retention;
pub mod snapshot;
pub mod store;
pub mod upsert;
pub mod worker;

pub use config::{FeedSourceKind, SyncConfig};
pub use dispatch::{Admission, DispatchSettings, Dispatcher, JobResolution};
pub use engine::{connector_for, notifier_for, SyncEngine};
pub use intake::{normalize_webhook, IntakeError, LineMapping, Trigger};
pub use lock::{LockLease, LockManager};
pub use notify::{LogNotifier, Notifier, NotifyError, SlackNotifier};
pub use retention::{run_retention, RetentionReport, RetentionSettings};
pub use store::{CatalogStore, MemoryStore, PgStore, StoreError};
pub use upsert::{Applied, UpsertEngine};
pub use worker::{ScopeOutcome, ScopeWorker};

pub const CRATE_NAME: &str = "sailsync-sync";
