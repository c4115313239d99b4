//! Sessions over a locally mounted mirror of the supplier feed.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::session::{Connector, FileSession, SessionError};

#[derive(Debug, Clone)]
pub struct MirrorConnector {
    root: PathBuf,
}

impl MirrorConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Connector for MirrorConnector {
    async fn connect(&self) -> Result<Box<dyn FileSession>, SessionError> {
        let meta = fs::metadata(&self.root).await.map_err(|err| {
            SessionError::Connect(format!("mirror root {}: {err}", self.root.display()))
        })?;
        if !meta.is_dir() {
            return Err(SessionError::Connect(format!(
                "mirror root {} is not a directory",
                self.root.display()
            )));
        }
        Ok(Box::new(MirrorSession {
            root: self.root.clone(),
            open: true,
        }))
    }

    fn describe(&self) -> String {
        format!("mirror {}", self.root.display())
    }
}

struct MirrorSession {
    root: PathBuf,
    open: bool,
}

impl MirrorSession {
    fn resolve(&self, remote: &str) -> Result<PathBuf, SessionError> {
        if !self.open {
            return Err(SessionError::Disconnected("session closed".to_string()));
        }
        let relative = Path::new(remote.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SessionError::InvalidPath(remote.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn map_io(remote: &str, err: std::io::Error) -> SessionError {
    if err.kind() == std::io::ErrorKind::NotFound {
        SessionError::NotFound(remote.to_string())
    } else {
        SessionError::Io(err)
    }
}

#[async_trait]
impl FileSession for MirrorSession {
    async fn list(&mut self, dir: &str) -> Result<Vec<String>, SessionError> {
        let path = self.resolve(dir)?;
        let mut entries = fs::read_dir(&path).await.map_err(|err| map_io(dir, err))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|err| map_io(dir, err))? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, SessionError> {
        let resolved = self.resolve(path)?;
        fs::read(&resolved).await.map_err(|err| map_io(path, err))
    }

    async fn probe(&mut self) -> Result<(), SessionError> {
        let root = self.resolve("")?;
        match fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(SessionError::Disconnected("mirror root vanished".to_string())),
            Err(err) => Err(SessionError::Disconnected(err.to_string())),
        }
    }

    async fn close(&mut self) {
        self.open = false;
    }
}
