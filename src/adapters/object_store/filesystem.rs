//! Filesystem object store adapter (spec §6A: dev/test backend, `file://` URLs).

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use crate::domain::errors::{DomainResult, TaskError};
use crate::domain::ports::object_store::ObjectStore;

pub struct FilesystemObjectStore {
    base_dir: PathBuf,
}

impl FilesystemObjectStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn put(&self, key: &str, _content_type: &str, bytes: Vec<u8>) -> DomainResult<String> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TaskError::InternalError(format!("failed to create {}: {e}", parent.display())))?;
        }
        fs::write(&path, bytes).await.map_err(|e| TaskError::InternalError(format!("failed to write {}: {e}", path.display())))?;
        Ok(format!("file://{}", path.display()))
    }

    async fn get(&self, key: &str) -> DomainResult<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TaskError::InternalError(format!("failed to read {}: {e}", path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path());

        let url = store.put("reports/r.html", "text/html", b"<html></html>".to_vec()).await.unwrap();
        assert!(url.starts_with("file://"));

        let fetched = store.get("reports/r.html").await.unwrap().unwrap();
        assert_eq!(fetched, b"<html></html>");
    }

    #[tokio::test]
    async fn get_missing_key_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path());
        assert!(store.get("missing").await.unwrap().is_none());
    }
}
