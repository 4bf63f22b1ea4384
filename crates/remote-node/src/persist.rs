//! Durable persistence past the remote node's memory tier
//!
//! Acknowledged snapshots are handed to a persister task which writes them
//! to a [`DurableStore`] without delaying acknowledgments. The hand-off
//! queue holds at most one snapshot per node: a newer snapshot replaces a
//! pending older one, so a slow store costs superseded writes, not memory.
//!
//! File layout (little-endian, 28-byte header + payload):
//! - Bytes 0-3:   magic `SPCK`
//! - Bytes 4-7:   format version (u32)
//! - Bytes 8-11:  epoch (u32)
//! - Bytes 12-15: contributing node count (u32)
//! - Bytes 16-19: CRC32 of payload (u32)
//! - Bytes 20-27: payload length (u64)
//! - Bytes 28+:   payload

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use runtime_core::{
    checksum, Epoch, Error, NamingPolicy, NodeId, PersistMode, Result, SnapshotRecord,
};
use parking_lot::Mutex;
use storage::DurableStore;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ledger::RemoteLedger;

/// Magic bytes of a persisted checkpoint file
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"SPCK";

/// Current file format version
pub const CHECKPOINT_VERSION: u32 = 1;

const HEADER_LEN: usize = 28;

/// Epochs waiting for missing shard contributors
const MAX_PENDING_EPOCHS: usize = 8;

/// Decoded checkpoint file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedCheckpoint {
    pub epoch: Epoch,
    pub node_count: u32,
    pub payload: Bytes,
}

pub fn encode_checkpoint(epoch: Epoch, node_count: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&CHECKPOINT_MAGIC);
    buf.put_u32_le(CHECKPOINT_VERSION);
    buf.put_u32_le(epoch);
    buf.put_u32_le(node_count);
    buf.put_u32_le(checksum(payload));
    buf.put_u64_le(payload.len() as u64);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn decode_checkpoint(data: &[u8]) -> Result<PersistedCheckpoint> {
    let malformed = |message: String| Error::Storage { message };

    if data.len() < HEADER_LEN {
        return Err(malformed(format!(
            "checkpoint file too short: {} bytes",
            data.len()
        )));
    }
    if data[0..4] != CHECKPOINT_MAGIC {
        return Err(malformed("not a checkpoint file (bad magic)".to_string()));
    }

    let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
    let version = word(4);
    if version != CHECKPOINT_VERSION {
        return Err(malformed(format!(
            "unsupported checkpoint version {}",
            version
        )));
    }

    let epoch = word(8);
    let node_count = word(12);
    let expected = word(16);
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&data[20..28]);
    let payload_len = u64::from_le_bytes(len_bytes);

    let payload = &data[HEADER_LEN..];
    if payload.len() as u64 != payload_len {
        return Err(malformed(format!(
            "checkpoint payload truncated: declared {} bytes, found {}",
            payload_len,
            payload.len()
        )));
    }

    let computed = checksum(payload);
    if computed != expected {
        return Err(malformed(format!(
            "checkpoint checksum mismatch (expected 0x{:08X}, computed 0x{:08X})",
            expected, computed
        )));
    }

    Ok(PersistedCheckpoint {
        epoch,
        node_count,
        payload: Bytes::copy_from_slice(payload),
    })
}

/// Relative path of a checkpoint file
///
/// `{model}.ckpt`, or `{model}_{YYYY-MM-DD-HHMMSS}_e{epoch}.ckpt` when
/// timestamped; per-node files add `_n{node}` before the extension.
pub fn checkpoint_path(
    naming: &NamingPolicy,
    epoch: Epoch,
    node_id: Option<NodeId>,
    now: DateTime<Utc>,
) -> String {
    let mut name = naming.model_name.clone();
    if naming.timestamped {
        name.push_str(&format!("_{}_e{}", now.format("%Y-%m-%d-%H%M%S"), epoch));
    }
    if let Some(node_id) = node_id {
        name.push_str(&format!("_n{}", node_id));
    }
    name.push_str(".ckpt");

    if naming.in_directory {
        format!("{}/{}", naming.model_name, name)
    } else {
        name
    }
}

/// Epoch embedded in a timestamped file name
fn epoch_of(model_name: &str, file_name: &str) -> Option<Epoch> {
    let rest = file_name.strip_prefix(model_name)?.strip_prefix('_')?;
    let rest = rest.strip_suffix(".ckpt")?;
    // Per-node files end with `_e{epoch}_n{node}`
    let rest = match rest.rsplit_once("_n") {
        Some((head, node)) if node.parse::<NodeId>().is_ok() => head,
        _ => rest,
    };
    let (_, epoch) = rest.rsplit_once("_e")?;
    epoch.parse().ok()
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BTreeMap<NodeId, Arc<SnapshotRecord>>,
    superseded: u64,
    closed: bool,
}

#[derive(Debug, Default)]
struct QueueShared {
    state: Mutex<QueueState>,
    ready: Notify,
}

/// Hand-off from the remote node to the persister, newest snapshot per node
#[derive(Debug, Clone, Default)]
pub struct PersistQueue {
    shared: Arc<QueueShared>,
}

impl PersistQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `record`, replacing an older pending snapshot of the same node
    ///
    /// Never waits. Returns false once the queue is closed.
    pub fn push(&self, record: Arc<SnapshotRecord>) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed {
            return false;
        }

        let node_id = record.node_id;
        match state.pending.get(&node_id) {
            Some(pending) if pending.sequence >= record.sequence => {
                debug!(node_id, sequence = record.sequence, "Newer snapshot already queued");
                return true;
            }
            Some(pending) => {
                warn!(
                    node_id,
                    dropped = pending.sequence,
                    sequence = record.sequence,
                    "Persister behind, superseded snapshot not persisted"
                );
                state.superseded += 1;
            }
            None => {}
        }
        state.pending.insert(node_id, record);
        drop(state);

        self.shared.ready.notify_one();
        true
    }

    /// Refuse further snapshots; the persister drains what is queued and exits
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.ready.notify_one();
    }

    /// Snapshots waiting for the persister
    pub fn len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots replaced before they were persisted
    pub fn superseded(&self) -> u64 {
        self.shared.state.lock().superseded
    }

    /// Everything queued, in node order; `None` once closed and drained
    async fn next_batch(&self) -> Option<Vec<Arc<SnapshotRecord>>> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if !state.pending.is_empty() {
                    let batch = std::mem::take(&mut state.pending);
                    return Some(batch.into_values().collect());
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.ready.notified().await;
        }
    }
}

/// Persister settings
#[derive(Debug, Clone)]
pub struct PersistConfig {
    pub mode: PersistMode,
    pub naming: NamingPolicy,

    /// Timestamped epochs to keep; 0 keeps all
    pub keep_count: usize,
}

/// Writes acknowledged snapshots to a durable store
pub struct Persister {
    config: PersistConfig,
    store: Arc<dyn DurableStore>,
    ledger: Arc<RemoteLedger>,
    pending: BTreeMap<Epoch, BTreeMap<NodeId, Arc<SnapshotRecord>>>,
}

impl Persister {
    pub fn new(config: PersistConfig, store: Arc<dyn DurableStore>, ledger: Arc<RemoteLedger>) -> Self {
        Self {
            config,
            store,
            ledger,
            pending: BTreeMap::new(),
        }
    }

    /// Start the persister task
    pub fn spawn(self) -> (PersistQueue, JoinHandle<()>) {
        let queue = PersistQueue::new();
        let handle = tokio::spawn(self.run(queue.clone()));
        (queue, handle)
    }

    async fn run(mut self, queue: PersistQueue) {
        info!(mode = ?self.config.mode, "Persister started");

        while let Some(batch) = queue.next_batch().await {
            for record in batch {
                if let Err(e) = self.handle(record).await {
                    error!(error = %e, "Failed to persist checkpoint");
                }
            }
        }

        if !self.pending.is_empty() {
            warn!(
                epochs = self.pending.len(),
                "Persister stopped with incomplete joined epochs"
            );
        }
        info!(superseded = queue.superseded(), "Persister stopped");
    }

    /// Persist one acknowledged snapshot
    pub async fn handle(&mut self, record: Arc<SnapshotRecord>) -> Result<()> {
        match self.config.mode {
            PersistMode::Disabled => Ok(()),
            PersistMode::PerNode => {
                let path = checkpoint_path(
                    &self.config.naming,
                    record.epoch,
                    Some(record.node_id),
                    Utc::now(),
                );
                self.write(&path, record.epoch, 1, &record.payload).await?;
                self.ledger
                    .mark_persisted(record.node_id, record.sequence, &path);
                self.prune().await
            }
            PersistMode::Joined { shard_count } => self.join(record, shard_count).await,
        }
    }

    async fn join(&mut self, record: Arc<SnapshotRecord>, shard_count: u32) -> Result<()> {
        let epoch = record.epoch;
        let contributors = self.pending.entry(epoch).or_default();
        contributors.insert(record.node_id, record);

        if contributors.len() < shard_count as usize {
            debug!(
                epoch,
                have = contributors.len(),
                need = shard_count,
                "Waiting for shard contributors"
            );
            while self.pending.len() > MAX_PENDING_EPOCHS {
                if let Some((dropped, _)) = self.pending.pop_first() {
                    warn!(epoch = dropped, "Giving up on incomplete joined epoch");
                }
            }
            return Ok(());
        }

        let Some(contributors) = self.pending.remove(&epoch) else {
            return Ok(());
        };
        // Older epochs can no longer become the latest joined checkpoint
        self.pending.retain(|pending_epoch, _| *pending_epoch > epoch);

        let mut joined = BytesMut::new();
        for record in contributors.values() {
            joined.extend_from_slice(&record.payload);
        }

        let path = checkpoint_path(&self.config.naming, epoch, None, Utc::now());
        self.write(&path, epoch, contributors.len() as u32, &joined)
            .await?;
        for record in contributors.values() {
            self.ledger
                .mark_persisted(record.node_id, record.sequence, &path);
        }
        self.prune().await
    }

    async fn write(&self, path: &str, epoch: Epoch, node_count: u32, payload: &[u8]) -> Result<()> {
        let file = encode_checkpoint(epoch, node_count, payload);
        let size = self.store.put(path, file).await?;
        info!(path, epoch, node_count, size_bytes = size, "Checkpoint persisted");
        Ok(())
    }

    /// Remove timestamped files beyond the newest `keep_count` epochs
    async fn prune(&self) -> Result<()> {
        let naming = &self.config.naming;
        if !naming.timestamped || self.config.keep_count == 0 {
            return Ok(());
        }

        let prefix = if naming.in_directory {
            format!("{}/", naming.model_name)
        } else {
            String::new()
        };

        let files: Vec<(Epoch, String)> = self
            .store
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|path| {
                let file_name = path.rsplit('/').next()?;
                let epoch = epoch_of(&naming.model_name, file_name)?;
                Some((epoch, path))
            })
            .collect();

        let epochs: BTreeSet<Epoch> = files.iter().map(|(epoch, _)| *epoch).collect();
        let Some(&oldest_kept) = epochs.iter().rev().nth(self.config.keep_count - 1) else {
            return Ok(());
        };

        for (epoch, path) in files {
            if epoch < oldest_kept {
                match self.store.remove(&path).await {
                    Ok(()) => debug!(path = %path, "Removed old checkpoint"),
                    Err(e) => warn!(path = %path, error = %e, "Failed to remove old checkpoint"),
                }
            }
        }
        Ok(())
    }
}
