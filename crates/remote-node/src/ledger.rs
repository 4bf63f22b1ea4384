//! Per-node high-water marks

use chrono::Utc;
use dashmap::DashMap;
use runtime_core::{Epoch, LedgerEntry, NodeId, PayloadLocation, Sequence};

/// Highest acknowledged sequence of every training node
///
/// Entries only move forward. Updates for different nodes never contend on
/// a shared lock.
#[derive(Debug, Default)]
pub struct RemoteLedger {
    entries: DashMap<NodeId, LedgerEntry>,
}

impl RemoteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the node's high-water mark to `sequence` if it is higher
    ///
    /// Returns true when the entry advanced.
    pub fn advance(&self, node_id: NodeId, sequence: Sequence, epoch: Epoch) -> bool {
        let mut advanced = false;
        self.entries
            .entry(node_id)
            .and_modify(|entry| {
                if sequence > entry.high_water {
                    entry.high_water = sequence;
                    entry.epoch = epoch;
                    entry.location = PayloadLocation::Memory;
                    entry.updated_at = Utc::now();
                    advanced = true;
                }
            })
            .or_insert_with(|| {
                advanced = true;
                LedgerEntry {
                    node_id,
                    high_water: sequence,
                    epoch,
                    location: PayloadLocation::Memory,
                    updated_at: Utc::now(),
                }
            });
        advanced
    }

    /// Record that the high-water payload also lives at `path`
    ///
    /// Ignored if the entry has already moved past `sequence`.
    pub fn mark_persisted(&self, node_id: NodeId, sequence: Sequence, path: &str) {
        if let Some(mut entry) = self.entries.get_mut(&node_id) {
            if entry.high_water == sequence {
                entry.location = PayloadLocation::Persisted {
                    path: path.to_string(),
                };
            }
        }
    }

    pub fn get(&self, node_id: NodeId) -> Option<LedgerEntry> {
        self.entries.get(&node_id).map(|entry| entry.clone())
    }

    pub fn high_water(&self, node_id: NodeId) -> Option<Sequence> {
        self.entries.get(&node_id).map(|entry| entry.high_water)
    }

    /// All entries, ordered by node
    pub fn entries(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> =
            self.entries.iter().map(|entry| entry.value().clone()).collect();
        entries.sort_by_key(|entry| entry.node_id);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let ledger = RemoteLedger::new();

        assert!(ledger.advance(1, 3, 3));
        assert!(!ledger.advance(1, 2, 2));
        assert!(!ledger.advance(1, 3, 3));
        assert_eq!(ledger.high_water(1), Some(3));
        assert_eq!(ledger.get(1).unwrap().epoch, 3);

        assert!(ledger.advance(1, 5, 4));
        assert_eq!(ledger.high_water(1), Some(5));
        assert!(ledger.high_water(2).is_none());
    }

    #[test]
    fn test_persisted_location_follows_high_water() {
        let ledger = RemoteLedger::new();
        ledger.advance(0, 1, 1);
        ledger.mark_persisted(0, 1, "model.ckpt");
        assert_eq!(
            ledger.get(0).unwrap().location,
            PayloadLocation::Persisted {
                path: "model.ckpt".to_string()
            }
        );

        ledger.advance(0, 2, 2);
        ledger.mark_persisted(0, 1, "old.ckpt");
        assert_eq!(ledger.get(0).unwrap().location, PayloadLocation::Memory);
    }

    #[test]
    fn test_entries_sorted() {
        let ledger = RemoteLedger::new();
        ledger.advance(2, 1, 1);
        ledger.advance(0, 1, 1);
        ledger.advance(1, 1, 1);
        let nodes: Vec<_> = ledger.entries().iter().map(|e| e.node_id).collect();
        assert_eq!(nodes, vec![0, 1, 2]);
    }
}
