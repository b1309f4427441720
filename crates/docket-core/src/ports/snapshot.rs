//! SnapshotSink port: where the in-memory backend persists its state.
//!
//! The sink stores opaque bytes. Loading happens once at startup, saving after
//! every queue mutation.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::task_queue::QueueError;

#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Last saved snapshot, if any.
    async fn load(&self) -> Result<Option<Vec<u8>>, QueueError>;

    async fn save(&self, bytes: &[u8]) -> Result<(), QueueError>;
}

/// Keeps nothing. For tests and ephemeral queues.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSnapshotSink;

#[async_trait]
impl SnapshotSink for NoopSnapshotSink {
    async fn load(&self) -> Result<Option<Vec<u8>>, QueueError> {
        Ok(None)
    }

    async fn save(&self, _bytes: &[u8]) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Writes the snapshot to a single file, replacing it atomically.
#[derive(Debug, Clone)]
pub struct FileSnapshotSink {
    path: PathBuf,
}

impl FileSnapshotSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[async_trait]
impl SnapshotSink for FileSnapshotSink {
    async fn load(&self) -> Result<Option<Vec<u8>>, QueueError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(QueueError::Snapshot(format!(
                "read {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn save(&self, bytes: &[u8]) -> Result<(), QueueError> {
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| QueueError::Snapshot(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| QueueError::Snapshot(format!("rename {}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_sink_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSnapshotSink::new(dir.path().join("task_queue.json"));

        assert_eq!(sink.load().await.unwrap(), None);

        sink.save(b"first").await.unwrap();
        sink.save(b"second").await.unwrap();
        assert_eq!(sink.load().await.unwrap(), Some(b"second".to_vec()));
        assert!(!sink.tmp_path().exists());
    }
}
