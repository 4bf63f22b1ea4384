//! Runtime Core - Foundation for the multi-level checkpoint runtime
//!
//! Provides core types, the snapshot record format, error handling,
//! configuration and an owned async runtime for synchronous callers.

pub mod config;
pub mod error;
pub mod record;
pub mod runtime;
pub mod types;

pub use config::{
    BufferConfig, NamingPolicy, OverwritePolicy, PersistMode, RetryConfig, RuntimeConfig,
    SnapshotFormat,
};
pub use error::{Error, Result};
pub use record::{checksum, SnapshotRecord};
pub use runtime::{RuntimeManager, RuntimeManagerBuilder};
pub use types::*;
