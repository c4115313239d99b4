//! Session contract for the stateful remote file source and its path layout.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::RetryDisposition;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("session dropped: {0}")]
    Disconnected(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote path not found: {0}")]
    NotFound(String),
    #[error("unexpected reply: {0}")]
    Protocol(String),
    #[error("invalid remote path: {0}")]
    InvalidPath(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            SessionError::NotFound(_) | SessionError::InvalidPath(_) => {
                RetryDisposition::NonRetryable
            }
            _ => RetryDisposition::Retryable,
        }
    }

    /// Whether the session that produced this error must be discarded.
    pub fn poisons_session(&self) -> bool {
        !matches!(
            self,
            SessionError::NotFound(_) | SessionError::InvalidPath(_)
        )
    }
}

/// One live session to the remote source. Sessions carry protocol state, so a
/// session is used by exactly one caller at a time.
#[async_trait]
pub trait FileSession: Send {
    /// Names of the direct children of `dir`.
    async fn list(&mut self, dir: &str) -> Result<Vec<String>, SessionError>;

    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, SessionError>;

    /// Cheap liveness check run on every checkout and by the health sweep.
    async fn probe(&mut self) -> Result<(), SessionError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FileSession>, SessionError>;

    fn describe(&self) -> String;
}

/// `{year}/{month:02}/{supplier_line_id}/{ship_id}/{item_id}.json`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedPath {
    pub year: i32,
    pub month: u32,
    pub supplier_line_id: i32,
    pub ship_id: i32,
    pub item_id: String,
}

impl FeedPath {
    pub fn line_dir(year: i32, month: u32, supplier_line_id: i32) -> String {
        format!("{year}/{month:02}/{supplier_line_id}")
    }

    pub fn ship_dir(year: i32, month: u32, supplier_line_id: i32, ship_id: i32) -> String {
        format!("{}/{ship_id}", Self::line_dir(year, month, supplier_line_id))
    }

    pub fn parse(path: &str) -> Option<Self> {
        let trimmed = path.trim().trim_start_matches('/');
        let mut parts = trimmed.split('/');
        let year = parts.next()?.parse().ok()?;
        let month_text = parts.next()?;
        let month: u32 = month_text.parse().ok()?;
        let supplier_line_id = parts.next()?.parse().ok()?;
        let ship_id = parts.next()?.parse().ok()?;
        let file = parts.next()?;
        if parts.next().is_some() || !(1..=12).contains(&month) {
            return None;
        }
        let item_id = file.strip_suffix(".json")?;
        if item_id.is_empty() {
            return None;
        }
        Some(Self {
            year,
            month,
            supplier_line_id,
            ship_id,
            item_id: item_id.to_string(),
        })
    }

    pub fn to_path(&self) -> String {
        format!(
            "{}/{}.json",
            Self::ship_dir(self.year, self.month, self.supplier_line_id, self.ship_id),
            self.item_id
        )
    }
}

impl fmt::Display for FeedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_path())
    }
}

/// Last path segment of a listing entry; servers differ on whether NLST
/// returns bare names or full paths.
pub(crate) fn entry_name(raw: &str) -> Option<String> {
    let name = raw.trim().trim_end_matches('/').rsplit('/').next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_path_parses_layout() {
        let path = FeedPath::parse("2025/05/7/231/8734921.json").unwrap();
        assert_eq!(path.year, 2025);
        assert_eq!(path.month, 5);
        assert_eq!(path.supplier_line_id, 7);
        assert_eq!(path.ship_id, 231);
        assert_eq!(path.item_id, "8734921");
        assert_eq!(path.to_path(), "2025/05/7/231/8734921.json");
    }

    #[test]
    fn feed_path_rejects_other_shapes() {
        assert!(FeedPath::parse("2025/13/7/231/1.json").is_none());
        assert!(FeedPath::parse("2025/05/7/231").is_none());
        assert!(FeedPath::parse("2025/05/7/231/1.txt").is_none());
        assert!(FeedPath::parse("2025/05/7/231/1.json/extra").is_none());
    }

    #[test]
    fn entry_names_strip_directories() {
        assert_eq!(entry_name("2025/05/7/231").as_deref(), Some("231"));
        assert_eq!(entry_name("  42.json\r").as_deref(), Some("42.json"));
        assert_eq!(entry_name(".."), None);
    }

    #[test]
    fn missing_paths_do_not_poison_sessions() {
        assert!(!SessionError::NotFound("x".into()).poisons_session());
        assert!(SessionError::Disconnected("x".into()).poisons_session());
        assert_eq!(
            SessionError::Timeout(Duration::from_secs(1)).disposition(),
            RetryDisposition::Retryable
        );
    }
}
