//! Remote node - Receives, retains and serves checkpoint snapshots
//!
//! Provides:
//! - [`RemoteNode`]: checksum verification, per-node retention and the
//!   [`RemoteLedger`] of high-water marks
//! - [`RemoteServer`]: the gRPC front end serving the `Snapshots` service
//! - [`Persister`]: optional write-behind to a durable store
//! - [`RemoteNodeService`]: all of the above wired from a `RuntimeConfig`

pub mod ledger;
pub mod node;
pub mod persist;
pub mod server;
pub mod service;

pub use ledger::RemoteLedger;
pub use node::{RemoteNode, RemoteNodeConfig};
pub use persist::{
    checkpoint_path, decode_checkpoint, encode_checkpoint, PersistConfig, PersistedCheckpoint,
    PersistQueue, Persister, CHECKPOINT_MAGIC, CHECKPOINT_VERSION,
};
pub use server::{shutdown_signal, RemoteServer, SnapshotService};
pub use service::RemoteNodeService;
