//! Snapshot record transferred from a training node to a remote node
//!
//! The checksum is a CRC32 over the payload, computed once by the sender
//! and carried unchanged until the receiver verifies it.

use bytes::Bytes;

use crate::types::{Epoch, NodeId, Sequence, SnapshotInfo};
use crate::{Error, Result};

/// CRC32 checksum used for every payload
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// One serialized checkpoint snapshot plus its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub node_id: NodeId,
    pub sequence: Sequence,
    pub epoch: Epoch,
    pub checksum: u32,
    pub payload: Bytes,
}

impl SnapshotRecord {
    /// Build a record, computing the checksum over `payload`
    pub fn new(node_id: NodeId, sequence: Sequence, epoch: Epoch, payload: Bytes) -> Self {
        Self {
            node_id,
            sequence,
            epoch,
            checksum: checksum(&payload),
            payload,
        }
    }

    /// Verify the payload against the carried checksum
    pub fn verify(&self) -> Result<()> {
        let computed = checksum(&self.payload);
        if computed != self.checksum {
            return Err(Error::Corrupt {
                node_id: self.node_id,
                sequence: self.sequence,
                expected: self.checksum,
                computed,
            });
        }
        Ok(())
    }

    /// Payload-free description
    pub fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            sequence: self.sequence,
            epoch: self.epoch,
            size_bytes: self.payload.len() as u64,
            checksum: self.checksum,
        }
    }
}
