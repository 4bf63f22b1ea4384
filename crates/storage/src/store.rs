//! Durable store trait definition
//!
//! The narrow interface the remote node uses to reach storage past its
//! memory tier.

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;

/// Async trait for durable checkpoint stores
///
/// Paths are relative to the store root and use `/` as separator.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read the object at `path`
    ///
    /// # Errors
    /// `StoragePathNotFound` if nothing is stored there
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Store `data` at `path`, replacing any previous object
    ///
    /// Readers never observe a partially written object.
    ///
    /// # Returns
    /// Number of bytes written
    async fn put(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Remove the object at `path`
    ///
    /// # Errors
    /// `StoragePathNotFound` if nothing is stored there
    async fn remove(&self, path: &str) -> Result<()>;

    /// Check if an object exists at `path`
    async fn exists(&self, path: &str) -> Result<bool>;

    /// All paths starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
