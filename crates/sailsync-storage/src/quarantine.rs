//! Content-addressed holding area for payloads the parser rejected.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::sha256_hex;

#[derive(Debug, Clone, Serialize)]
pub struct QuarantinedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize)]
struct QuarantineNote<'a> {
    source_path: &'a str,
    supplier_line_id: i32,
    reason: &'a str,
    captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct QuarantineStore {
    root: PathBuf,
}

impl QuarantineStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative_path(
        &self,
        captured_at: DateTime<Utc>,
        supplier_line_id: i32,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(captured_at.format("%Y%m%d").to_string())
            .join(supplier_line_id.to_string())
            .join(format!("{content_hash}.json"))
    }

    /// Keeps the raw bytes under a hash-addressed path, next to a small
    /// `.reason.json` sidecar naming the source file and the parse failure.
    /// Identical payloads on the same day land on the same file.
    pub async fn store(
        &self,
        captured_at: DateTime<Utc>,
        supplier_line_id: i32,
        source_path: &str,
        reason: &str,
        bytes: &[u8],
    ) -> anyhow::Result<QuarantinedPayload> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.relative_path(captured_at, supplier_line_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let note = QuarantineNote {
            source_path,
            supplier_line_id,
            reason,
            captured_at,
        };
        let note_bytes = serde_json::to_vec_pretty(&note).context("encoding quarantine note")?;
        write_atomic(&absolute_path.with_extension("reason.json"), &note_bytes).await?;

        let deduplicated = !write_atomic(&absolute_path, bytes).await?;
        Ok(QuarantinedPayload {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Returns `false` when the target already existed and was left untouched.
async fn write_atomic(target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = target
        .parent()
        .with_context(|| format!("quarantine path {} has no parent", target.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating quarantine directory {}", parent.display()))?;

    if fs::try_exists(target)
        .await
        .with_context(|| format!("checking quarantine path {}", target.display()))?
    {
        return Ok(false);
    }

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, target).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "renaming {} -> {}",
                    temp_path.display(),
                    target.display()
                )
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-05-14T09:30:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn identical_payloads_share_one_file() {
        let dir = tempdir().expect("tempdir");
        let store = QuarantineStore::new(dir.path());

        let first = store
            .store(at(), 7, "2025/05/7/231/1.json", "eof while parsing", b"{\"broken\":")
            .await
            .expect("first store");
        let second = store
            .store(at(), 7, "2025/05/7/231/9.json", "eof while parsing", b"{\"broken\":")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20250514/7"));
        assert_eq!(
            std::fs::read(&first.absolute_path).expect("read back"),
            b"{\"broken\":"
        );
    }

    #[tokio::test]
    async fn sidecar_records_reason_and_source() {
        let dir = tempdir().expect("tempdir");
        let store = QuarantineStore::new(dir.path());
        let stored = store
            .store(at(), 3, "2025/06/3/12/44.json", "not an object", b"[]")
            .await
            .expect("store");

        let note = std::fs::read_to_string(stored.absolute_path.with_extension("reason.json"))
            .expect("sidecar");
        let note: serde_json::Value = serde_json::from_str(&note).expect("json");
        assert_eq!(note["source_path"], "2025/06/3/12/44.json");
        assert_eq!(note["reason"], "not an object");
        assert_eq!(note["supplier_line_id"], 3);
    }
}
