//! Remote node agent: verifies, retains and serves checkpoint snapshots

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use runtime_core::{
    Ack, Error, LedgerEntry, NodeCatalog, NodeId, Result, Sequence, SnapshotRecord,
};
use tracing::{debug, info, instrument, warn};
use transfer::{RecordSink, RemoteView};

use crate::ledger::RemoteLedger;
use crate::persist::PersistQueue;

/// Snapshots retained for one training node
#[derive(Debug, Default)]
struct NodeStore {
    snapshots: BTreeMap<Sequence, Arc<SnapshotRecord>>,
}

/// Remote node configuration
#[derive(Debug, Clone)]
pub struct RemoteNodeConfig {
    /// Acknowledged snapshots kept per training node
    pub retain_per_node: usize,
}

impl Default for RemoteNodeConfig {
    fn default() -> Self {
        Self { retain_per_node: 4 }
    }
}

/// Receives snapshots from many training nodes and answers recovery queries
///
/// Writes for one node are serialized by that node's store lock; the
/// payload is inserted and the ledger advanced under the same lock, so a
/// reader never sees a ledger entry without its payload.
pub struct RemoteNode {
    config: RemoteNodeConfig,
    ledger: Arc<RemoteLedger>,
    stores: DashMap<NodeId, Arc<Mutex<NodeStore>>>,
    persist: Option<PersistQueue>,
}

impl RemoteNode {
    pub fn new(config: RemoteNodeConfig) -> Self {
        Self {
            config,
            ledger: Arc::new(RemoteLedger::new()),
            stores: DashMap::new(),
            persist: None,
        }
    }

    /// Queue every newly accepted snapshot for `persist` as it is acknowledged
    pub fn with_persistence(
        config: RemoteNodeConfig,
        ledger: Arc<RemoteLedger>,
        persist: PersistQueue,
    ) -> Self {
        Self {
            config,
            ledger,
            stores: DashMap::new(),
            persist: Some(persist),
        }
    }

    /// Stop handing snapshots to the persister so it can drain and exit
    pub fn stop_persisting(&self) {
        if let Some(queue) = &self.persist {
            queue.close();
        }
    }

    pub fn ledger(&self) -> &Arc<RemoteLedger> {
        &self.ledger
    }

    fn store(&self, node_id: NodeId) -> Arc<Mutex<NodeStore>> {
        self.stores.entry(node_id).or_default().clone()
    }

    /// Verify and retain a snapshot, then acknowledge it
    ///
    /// # Errors
    /// `Corrupt` if the payload does not match its checksum, `Rejected` if
    /// the same sequence was already accepted with a different payload.
    #[instrument(skip(self, record), fields(node_id = record.node_id, sequence = record.sequence, epoch = record.epoch))]
    pub fn receive(&self, record: SnapshotRecord) -> Result<Ack> {
        if let Err(e) = record.verify() {
            warn!(error = %e, "Rejecting corrupt snapshot");
            return Err(e);
        }

        let ack = Ack {
            node_id: record.node_id,
            sequence: record.sequence,
        };
        let record = Arc::new(record);
        let store = self.store(record.node_id);
        let mut store = store.lock();

        if let Some(existing) = store.snapshots.get(&record.sequence) {
            if existing.checksum == record.checksum {
                debug!("Duplicate delivery, re-acknowledging");
                return Ok(ack);
            }
            return Err(Error::Rejected {
                message: format!(
                    "node {} sequence {} was already accepted with a different payload",
                    record.node_id, record.sequence
                ),
            });
        }

        store.snapshots.insert(record.sequence, record.clone());
        self.ledger
            .advance(record.node_id, record.sequence, record.epoch);

        let high_water = self.ledger.high_water(record.node_id).unwrap_or(record.sequence);
        while store.snapshots.len() > self.config.retain_per_node {
            let Some(oldest) = store
                .snapshots
                .keys()
                .copied()
                .find(|sequence| *sequence != high_water)
            else {
                break;
            };
            store.snapshots.remove(&oldest);
            debug!(evicted = oldest, "Evicted retained snapshot");
        }
        drop(store);

        if let Some(queue) = &self.persist {
            if !queue.push(record.clone()) {
                warn!("Persister stopped; snapshot kept in memory only");
            }
        }

        info!(size_bytes = record.payload.len(), "Snapshot acknowledged");
        Ok(ack)
    }

    /// Highest acknowledged snapshot of a node
    pub fn latest(&self, node_id: NodeId) -> Option<SnapshotRecord> {
        let high_water = self.ledger.high_water(node_id)?;
        self.get(node_id, high_water)
    }

    pub fn get(&self, node_id: NodeId, sequence: Sequence) -> Option<SnapshotRecord> {
        let store = self.stores.get(&node_id)?.clone();
        let store = store.lock();
        store
            .snapshots
            .get(&sequence)
            .map(|record| record.as_ref().clone())
    }

    /// Retained snapshots of every known node, ordered by node
    pub fn node_catalogs(&self) -> Vec<NodeCatalog> {
        self.ledger
            .entries()
            .into_iter()
            .map(|entry| {
                let snapshots = self
                    .stores
                    .get(&entry.node_id)
                    .map(|store| store.clone())
                    .map(|store| {
                        store
                            .lock()
                            .snapshots
                            .values()
                            .map(|record| record.info())
                            .collect()
                    })
                    .unwrap_or_default();
                NodeCatalog {
                    node_id: entry.node_id,
                    high_water: entry.high_water,
                    snapshots,
                }
            })
            .collect()
    }

    pub fn ledger_entries(&self) -> Vec<LedgerEntry> {
        self.ledger.entries()
    }
}

#[async_trait]
impl RecordSink for RemoteNode {
    async fn accept(&self, record: SnapshotRecord) -> Result<Ack> {
        self.receive(record)
    }
}

#[async_trait]
impl RemoteView for RemoteNode {
    async fn catalog(&self) -> Result<Vec<NodeCatalog>> {
        Ok(self.node_catalogs())
    }

    async fn fetch(
        &self,
        node_id: NodeId,
        sequence: Option<Sequence>,
    ) -> Result<Option<SnapshotRecord>> {
        Ok(match sequence {
            Some(sequence) => self.get(node_id, sequence),
            None => self.latest(node_id),
        })
    }
}
