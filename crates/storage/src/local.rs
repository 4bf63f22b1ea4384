//! Local directory store
//!
//! Writes go to a uniquely named temp file which is synced and renamed into
//! place, so a crash never leaves a truncated checkpoint behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::DurableStore;

/// Durable store rooted at a local (or network-mounted) directory
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn temp_path(full_path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}.tmp",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full_path.with_file_name(temp_name)
    }

    async fn write_atomic(full_path: &Path, data: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = Self::temp_path(full_path);
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        Ok(())
    }
}

fn not_found_or(path: &str, action: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::StoragePathNotFound {
            path: path.to_string(),
        }
    } else {
        Error::Storage {
            message: format!("Failed to {} {}: {}", action, path, e),
        }
    }
}

#[async_trait]
impl DurableStore for LocalDirStore {
    #[instrument(skip(self), fields(store = "local"))]
    async fn get(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve(path);
        debug!(?full_path, "Reading checkpoint file");

        fs::read(&full_path)
            .await
            .map(Bytes::from)
            .map_err(|e| not_found_or(path, "read", e))
    }

    #[instrument(skip(self, data), fields(store = "local", size = data.len()))]
    async fn put(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve(path);

        Self::write_atomic(&full_path, &data)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to write {:?}: {}", full_path, e),
            })?;

        debug!(?full_path, size = data.len(), "Checkpoint file written");
        Ok(data.len() as u64)
    }

    #[instrument(skip(self), fields(store = "local"))]
    async fn remove(&self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve(path))
            .await
            .map_err(|e| not_found_or(path, "remove", e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(self.resolve(path)).await.is_ok())
    }

    #[instrument(skip(self), fields(store = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut results = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let file_type = match entry.file_type().await {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                let entry_path = entry.path();

                if file_type.is_dir() {
                    stack.push(entry_path);
                    continue;
                }

                let Ok(relative) = entry_path.strip_prefix(&self.root) else {
                    continue;
                };
                let relative = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                // Skip in-progress temp files
                let is_temp = entry.file_name().to_string_lossy().starts_with('.');
                if !is_temp && relative.starts_with(prefix) {
                    results.push(relative);
                }
            }
        }

        results.sort();
        Ok(results)
    }
}
