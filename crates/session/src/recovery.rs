//! Recovery after preemption
//!
//! Gathers what every reachable remote node retains, picks the highest
//! epoch that all expected training nodes have in common and fetches
//! those snapshots. Persisted checkpoint files can be loaded directly
//! when the memory tier is gone.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use checkpoint::{join_shards, Snapshot, SnapshotSerializer};
use remote_node::{decode_checkpoint, PersistedCheckpoint};
use runtime_core::{Epoch, Error, NodeId, Result, SnapshotInfo, SnapshotRecord};
use storage::DurableStore;
use tracing::{debug, info, warn};
use transfer::RemoteView;

/// Snapshots chosen for restore, one per node, ascending by node id
#[derive(Debug, Clone)]
pub struct RecoveredCheckpoint {
    pub epoch: Epoch,
    pub snapshots: Vec<SnapshotRecord>,
}

impl RecoveredCheckpoint {
    pub fn payload_for(&self, node_id: NodeId) -> Option<&Bytes> {
        self.snapshots
            .iter()
            .find(|record| record.node_id == node_id)
            .map(|record| &record.payload)
    }

    /// All payloads concatenated in node order, for sharded saves
    pub fn joined(&self) -> Bytes {
        join_shards(self.snapshots.iter().map(|record| &record.payload))
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.snapshots.iter().map(|record| record.node_id).collect()
    }
}

/// Result of a recovery pass
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    /// Nothing retained for any expected node; training starts over
    Fresh,

    /// Restore from the given snapshots
    Restore(RecoveredCheckpoint),
}

impl RecoveryOutcome {
    pub fn epoch(&self) -> Option<Epoch> {
        match self {
            RecoveryOutcome::Fresh => None,
            RecoveryOutcome::Restore(checkpoint) => Some(checkpoint.epoch),
        }
    }

    pub fn checkpoint(&self) -> Option<&RecoveredCheckpoint> {
        match self {
            RecoveryOutcome::Fresh => None,
            RecoveryOutcome::Restore(checkpoint) => Some(checkpoint),
        }
    }
}

/// Where one node's snapshot for an epoch can be fetched
#[derive(Debug, Clone, Copy)]
struct Located {
    view: usize,
    info: SnapshotInfo,
}

/// Consistent restore point selection across remote nodes
pub struct RecoveryCoordinator {
    views: Vec<Arc<dyn RemoteView>>,
    expected: Vec<NodeId>,
}

impl RecoveryCoordinator {
    /// `expected` lists the training nodes that must all be restored; when
    /// empty, every node any remote knows about is expected
    pub fn new(views: Vec<Arc<dyn RemoteView>>, expected: Vec<NodeId>) -> Self {
        let mut expected = expected;
        expected.sort_unstable();
        expected.dedup();
        Self { views, expected }
    }

    /// Merge every reachable catalog into node -> epoch -> location
    ///
    /// Unreachable remotes are skipped; their snapshots simply do not count.
    async fn gather(&self) -> Result<BTreeMap<NodeId, BTreeMap<Epoch, Located>>> {
        let mut merged: BTreeMap<NodeId, BTreeMap<Epoch, Located>> = BTreeMap::new();
        let mut reachable = 0;

        for (view, remote) in self.views.iter().enumerate() {
            let catalogs = match remote.catalog().await {
                Ok(catalogs) => catalogs,
                Err(e) => {
                    warn!(view, error = %e, "Remote node unreachable during recovery");
                    continue;
                }
            };
            reachable += 1;

            for catalog in catalogs {
                let epochs = merged.entry(catalog.node_id).or_default();
                for info in catalog.snapshots {
                    let newer = epochs
                        .get(&info.epoch)
                        .map_or(true, |known| info.sequence > known.info.sequence);
                    if newer {
                        epochs.insert(info.epoch, Located { view, info });
                    }
                }
            }
        }

        if reachable == 0 && !self.views.is_empty() {
            return Err(Error::Transport {
                message: "no remote node reachable for recovery".to_string(),
            });
        }
        Ok(merged)
    }

    /// Choose and fetch the restore point
    ///
    /// The restore epoch is the highest epoch retained for every expected
    /// node. A node missing entirely while others have snapshots, or no
    /// common epoch, is `RecoveryIncomplete`.
    pub async fn recover(&self) -> Result<RecoveryOutcome> {
        let merged = self.gather().await?;

        let expected: Vec<NodeId> = if self.expected.is_empty() {
            merged
                .iter()
                .filter(|(_, epochs)| !epochs.is_empty())
                .map(|(node_id, _)| *node_id)
                .collect()
        } else {
            self.expected.clone()
        };

        let missing: Vec<NodeId> = expected
            .iter()
            .copied()
            .filter(|node_id| merged.get(node_id).map_or(true, BTreeMap::is_empty))
            .collect();

        if missing.len() == expected.len() {
            info!("No retained snapshots, starting fresh");
            return Ok(RecoveryOutcome::Fresh);
        }
        if !missing.is_empty() {
            return Err(Error::RecoveryIncomplete {
                reason: format!("no snapshots retained for nodes {:?}", missing),
            });
        }

        let epoch = common_epoch(&expected, &merged).ok_or_else(|| Error::RecoveryIncomplete {
            reason: format!("nodes {:?} retain no epoch in common", expected),
        })?;
        debug!(epoch, nodes = expected.len(), "Selected restore epoch");

        let mut snapshots = Vec::with_capacity(expected.len());
        for node_id in &expected {
            let located = merged
                .get(node_id)
                .and_then(|epochs| epochs.get(&epoch))
                .copied()
                .ok_or_else(|| Error::RecoveryIncomplete {
                    reason: format!("node {} has no snapshot for epoch {}", node_id, epoch),
                })?;

            let record = self.views[located.view]
                .fetch(*node_id, Some(located.info.sequence))
                .await?
                .ok_or_else(|| Error::RecoveryIncomplete {
                    reason: format!(
                        "snapshot {} of node {} was evicted during recovery",
                        located.info.sequence, node_id
                    ),
                })?;
            record.verify()?;
            snapshots.push(record);
        }

        info!(epoch, nodes = snapshots.len(), "Recovered checkpoint");
        Ok(RecoveryOutcome::Restore(RecoveredCheckpoint { epoch, snapshots }))
    }
}

/// Highest epoch present for every node, searching down from the smallest
/// per-node maximum
fn common_epoch(
    expected: &[NodeId],
    merged: &BTreeMap<NodeId, BTreeMap<Epoch, Located>>,
) -> Option<Epoch> {
    let per_node: Vec<&BTreeMap<Epoch, Located>> = expected
        .iter()
        .map(|node_id| merged.get(node_id))
        .collect::<Option<_>>()?;

    let ceiling = per_node
        .iter()
        .map(|epochs| epochs.keys().next_back().copied())
        .collect::<Option<Vec<_>>>()?
        .into_iter()
        .min()?;

    let (first, rest) = per_node.split_first()?;
    first
        .range(..=ceiling)
        .rev()
        .map(|(epoch, _)| *epoch)
        .find(|epoch| rest.iter().all(|epochs| epochs.contains_key(epoch)))
}

/// Read a checkpoint file written by the persister
pub async fn load_persisted(store: &dyn DurableStore, path: &str) -> Result<PersistedCheckpoint> {
    let data = store.get(path).await?;
    let checkpoint = decode_checkpoint(&data)?;
    info!(
        path,
        epoch = checkpoint.epoch,
        nodes = checkpoint.node_count,
        size = checkpoint.payload.len(),
        "Loaded persisted checkpoint"
    );
    Ok(checkpoint)
}

/// Load and decode a persisted checkpoint into training state
pub async fn restore_persisted<S: Snapshot>(
    store: &dyn DurableStore,
    path: &str,
    serializer: &SnapshotSerializer,
) -> Result<(Epoch, S)> {
    let checkpoint = load_persisted(store, path).await?;
    let state = serializer.deserialize(&checkpoint.payload)?;
    Ok((checkpoint.epoch, state))
}
