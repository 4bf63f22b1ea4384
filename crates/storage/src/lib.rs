//! Storage - Durable tier past the remote node's memory
//!
//! Provides async object storage for persisted checkpoints:
//! - [`LocalDirStore`]: a local or network-mounted directory (default feature)
//! - [`MemoryStore`]: a concurrent in-memory map
//!
//! # Example
//!
//! ```no_run
//! use storage::{DurableStore, LocalDirStore};
//! use bytes::Bytes;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let store = LocalDirStore::new("/tmp/checkpoints");
//! store.put("resnet/resnet.ckpt", Bytes::from(vec![1, 2, 3])).await?;
//! let data = store.get("resnet/resnet.ckpt").await?;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "local")]
mod local;
mod memory;
mod store;

#[cfg(feature = "local")]
pub use local::LocalDirStore;
pub use memory::MemoryStore;
pub use store::DurableStore;
