//! Core type definitions for the multi-level checkpoint runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Training node identifier (the node's rank)
pub type NodeId = u32;

/// Per-node checkpoint sequence number, starting at 1
pub type Sequence = u64;

/// Training epoch counter
pub type Epoch = u32;

/// Acknowledgment of durable receipt on the remote node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    /// Node that contributed the snapshot
    pub node_id: NodeId,

    /// Acknowledged sequence
    pub sequence: Sequence,
}

/// Reason a remote node refused a write
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NackReason {
    /// Checksum did not match the payload
    Corrupt { expected: u32, computed: u32 },

    /// Write was refused for a non-integrity reason
    Rejected { message: String },
}

/// Negative acknowledgment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Nack {
    pub node_id: NodeId,
    pub sequence: Sequence,
    pub reason: NackReason,
}

/// Where the remote node keeps the payload behind a ledger entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PayloadLocation {
    /// Retained in the remote node's memory tier
    Memory,

    /// Also written to the durable store at this path
    Persisted { path: String },
}

/// High-water mark for one training node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    /// Training node
    pub node_id: NodeId,

    /// Highest acknowledged sequence
    pub high_water: Sequence,

    /// Epoch of the high-water snapshot
    pub epoch: Epoch,

    /// Location of the high-water payload
    pub location: PayloadLocation,

    /// When the entry last advanced
    pub updated_at: DateTime<Utc>,
}

/// Description of one retained snapshot, without its payload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub sequence: Sequence,
    pub epoch: Epoch,
    pub size_bytes: u64,
    pub checksum: u32,
}

/// Everything a remote node retains for one training node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeCatalog {
    /// Training node
    pub node_id: NodeId,

    /// Highest acknowledged sequence
    pub high_water: Sequence,

    /// Retained snapshots, ascending by sequence
    pub snapshots: Vec<SnapshotInfo>,
}

impl NodeCatalog {
    /// Highest epoch among retained snapshots
    pub fn max_epoch(&self) -> Option<Epoch> {
        self.snapshots.iter().map(|s| s.epoch).max()
    }

    /// Latest retained snapshot for a given epoch
    pub fn find_epoch(&self, epoch: Epoch) -> Option<&SnapshotInfo> {
        self.snapshots
            .iter()
            .filter(|s| s.epoch == epoch)
            .max_by_key(|s| s.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(sequence: Sequence, epoch: Epoch) -> SnapshotInfo {
        SnapshotInfo {
            sequence,
            epoch,
            size_bytes: 16,
            checksum: 0,
        }
    }

    #[test]
    fn test_catalog_epoch_lookup() {
        let catalog = NodeCatalog {
            node_id: 1,
            high_water: 4,
            snapshots: vec![info(2, 1), info(3, 2), info(4, 2)],
        };

        assert_eq!(catalog.max_epoch(), Some(2));
        assert_eq!(catalog.find_epoch(2).map(|s| s.sequence), Some(4));
        assert_eq!(catalog.find_epoch(1).map(|s| s.sequence), Some(2));
        assert!(catalog.find_epoch(7).is_none());
    }
}
