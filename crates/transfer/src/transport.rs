//! Transport seams between training nodes and remote nodes
//!
//! A [`Transport`] makes exactly one delivery attempt; retries live in
//! [`TransferChannel`](crate::TransferChannel). [`RecordSink`] and
//! [`RemoteView`] are what a remote node exposes, either in-process or
//! behind a gRPC channel.

use std::sync::Arc;

use async_trait::async_trait;
use runtime_core::{Ack, NodeCatalog, NodeId, Result, Sequence, SnapshotRecord};

/// One delivery attempt of a snapshot record
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `record` and wait for the remote's verdict
    ///
    /// # Errors
    /// `Corrupt` when the remote's checksum verification fails, `Transport`
    /// or `Io` for connection problems, `Rejected` for refused writes.
    async fn deliver(&self, record: &SnapshotRecord) -> Result<Ack>;

    /// Endpoint description for logs
    fn endpoint(&self) -> String;
}

/// Receiving side of a snapshot write
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Verify, store and acknowledge a record
    async fn accept(&self, record: SnapshotRecord) -> Result<Ack>;
}

/// Read-only view of what a remote node retains
#[async_trait]
pub trait RemoteView: Send + Sync {
    /// Retained snapshots of every known node
    async fn catalog(&self) -> Result<Vec<NodeCatalog>>;

    /// One retained snapshot; `sequence: None` selects the node's latest
    async fn fetch(
        &self,
        node_id: NodeId,
        sequence: Option<Sequence>,
    ) -> Result<Option<SnapshotRecord>>;
}

/// In-process transport handing records straight to a sink
#[derive(Clone)]
pub struct LoopbackTransport {
    sink: Arc<dyn RecordSink>,
}

impl LoopbackTransport {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn deliver(&self, record: &SnapshotRecord) -> Result<Ack> {
        self.sink.accept(record.clone()).await
    }

    fn endpoint(&self) -> String {
        "loopback".to_string()
    }
}
