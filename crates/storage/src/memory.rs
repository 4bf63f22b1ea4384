//! In-memory store for tests and single-process runs

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use runtime_core::{Error, Result};

use crate::DurableStore;

/// Store backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: DashMap<String, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.objects
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::StoragePathNotFound {
                path: path.to_string(),
            })
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<u64> {
        let size = data.len() as u64;
        self.objects.insert(path.to_string(), data);
        Ok(size)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::StoragePathNotFound {
                path: path.to_string(),
            })
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.contains_key(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        paths.sort();
        Ok(paths)
    }
}
