//! Training node agent
//!
//! `save` captures state into the local buffer and queues the slot for a
//! background flush worker; `wait_copy_complete` lets the training loop
//! advance the optimizer only once the snapshot before the latest one is
//! acknowledged by the remote node.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use runtime_core::{
    Epoch, Error, NodeId, OverwritePolicy, Result, RuntimeConfig, Sequence, SnapshotFormat,
    SnapshotRecord,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use transfer::{ChannelStats, TransferChannel};

use crate::buffer::{CircularBuffer, SlotInfo};
use crate::serializer::{Snapshot, SnapshotSerializer};
use crate::shard::ShardSpec;

/// Training node agent configuration
#[derive(Debug, Clone)]
pub struct TrainNodeConfig {
    pub node_id: NodeId,

    /// Slots in the local circular buffer
    pub depth: usize,

    pub overwrite_policy: OverwritePolicy,

    pub format: SnapshotFormat,

    /// Contribute only this slice of each payload
    pub shard: Option<ShardSpec>,

    /// Sequence of the first save
    pub first_sequence: Sequence,
}

impl TrainNodeConfig {
    pub fn from_runtime(node_id: NodeId, config: &RuntimeConfig) -> Self {
        Self {
            node_id,
            depth: config.buffer.depth,
            overwrite_policy: config.buffer.overwrite_policy,
            format: config.snapshot.format,
            shard: None,
            first_sequence: 1,
        }
    }
}

/// Flush results published by the worker
#[derive(Debug, Clone, Default)]
pub struct FlushProgress {
    /// Highest acknowledged sequence
    pub acked: Option<Sequence>,

    /// Sequences that failed, were held behind a failure or were
    /// discarded, with the reason
    pub failed: BTreeMap<Sequence, String>,

    /// Worker has exited
    pub closed: bool,
}

#[derive(Debug, Default)]
struct SaveCursor {
    latest: Option<Sequence>,
    previous: Option<Sequence>,
}

/// Per-node agent between the training loop and the transfer channel
pub struct TrainNode {
    node_id: NodeId,
    buffer: Arc<CircularBuffer>,
    serializer: SnapshotSerializer,
    shard: Option<ShardSpec>,
    channel: Arc<TransferChannel>,
    queue: Option<mpsc::Sender<Sequence>>,
    progress: Arc<watch::Sender<FlushProgress>>,
    cursor: Mutex<SaveCursor>,
    worker: Option<JoinHandle<()>>,
}

impl TrainNode {
    /// Create the agent and start its flush worker on the current runtime
    pub fn spawn(config: TrainNodeConfig, channel: TransferChannel) -> Result<Self> {
        let buffer = Arc::new(CircularBuffer::starting_at(
            config.depth,
            config.overwrite_policy,
            config.first_sequence,
        )?);
        let channel = Arc::new(channel);
        let (progress, _) = watch::channel(FlushProgress::default());
        let progress = Arc::new(progress);

        // Every queued sequence holds a dirty slot, plus room for re-flushes
        let (queue_tx, queue_rx) = mpsc::channel(config.depth * 2);

        let worker = tokio::spawn(flush_loop(
            config.node_id,
            buffer.clone(),
            channel.clone(),
            queue_rx,
            progress.clone(),
        ));

        info!(
            node_id = config.node_id,
            depth = config.depth,
            first_sequence = config.first_sequence,
            "Training node agent started"
        );

        Ok(Self {
            node_id: config.node_id,
            buffer,
            serializer: SnapshotSerializer::new(config.format),
            shard: config.shard,
            channel,
            queue: Some(queue_tx),
            progress,
            cursor: Mutex::new(SaveCursor::default()),
            worker: Some(worker),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Capture `state` for `epoch` and queue it for transfer
    ///
    /// Returns once the snapshot is in the local buffer; waits only under
    /// buffer back-pressure.
    pub async fn save<S: Snapshot>(&self, epoch: Epoch, state: &S) -> Result<Sequence> {
        let payload = self.serializer.serialize(state)?;
        self.save_payload(epoch, payload).await
    }

    /// Capture an already serialized payload
    #[instrument(skip(self, payload), fields(node_id = self.node_id, size = payload.len()))]
    pub async fn save_payload(&self, epoch: Epoch, payload: Bytes) -> Result<Sequence> {
        let queue = self.queue.as_ref().ok_or_else(|| Error::Shutdown {
            component: "training node agent".to_string(),
        })?;

        let payload = match &self.shard {
            Some(shard) => shard.slice(&payload),
            None => payload,
        };

        let sequence = self.buffer.write(epoch, payload).await?;
        {
            let mut cursor = self.cursor.lock();
            let previous = cursor.latest.replace(sequence);
            cursor.previous = previous;
        }

        queue.send(sequence).await.map_err(|_| Error::ChannelClosed {
            channel: "flush queue".to_string(),
        })?;

        debug!(sequence, epoch, "Snapshot captured");
        Ok(sequence)
    }

    /// Wait until the snapshot saved before the latest one is acknowledged
    ///
    /// Returns immediately when fewer than two saves were made. Fails with
    /// `CheckpointUnavailable` if that snapshot's transfer failed for good.
    pub async fn wait_copy_complete(&self) -> Result<()> {
        let Some(target) = self.cursor.lock().previous else {
            return Ok(());
        };
        self.wait_for_sequence(target).await
    }

    /// Wait until every save so far is acknowledged
    pub async fn wait_all_copies(&self) -> Result<()> {
        let Some(target) = self.cursor.lock().latest else {
            return Ok(());
        };
        self.wait_for_sequence(target).await
    }

    async fn wait_for_sequence(&self, target: Sequence) -> Result<()> {
        let mut rx = self.progress.subscribe();
        let outcome = {
            let buffer = &self.buffer;
            let progress = rx
                .wait_for(|p| {
                    p.failed.contains_key(&target) || buffer.is_acknowledged(target) || p.closed
                })
                .await
                .map_err(|_| Error::ChannelClosed {
                    channel: "flush progress".to_string(),
                })?;

            if let Some(reason) = progress.failed.get(&target) {
                Err(reason.clone())
            } else if buffer.is_acknowledged(target) {
                Ok(())
            } else {
                Err("flush worker stopped before the copy completed".to_string())
            }
        };

        outcome.map_err(|reason| {
            warn!(node_id = self.node_id, sequence = target, %reason, "Checkpoint copy unavailable");
            Error::CheckpointUnavailable {
                sequence: target,
                reason,
            }
        })
    }

    /// Queue snapshots whose flush failed permanently for another attempt
    pub async fn retry_failed(&self) -> Result<usize> {
        let queue = self.queue.as_ref().ok_or_else(|| Error::Shutdown {
            component: "training node agent".to_string(),
        })?;

        let sequences = self.buffer.requeue_abandoned();
        self.progress.send_modify(|p| {
            for sequence in &sequences {
                p.failed.remove(sequence);
            }
        });

        for &sequence in &sequences {
            queue.send(sequence).await.map_err(|_| Error::ChannelClosed {
                channel: "flush queue".to_string(),
            })?;
        }

        if !sequences.is_empty() {
            info!(node_id = self.node_id, count = sequences.len(), "Re-queued failed flushes");
        }
        Ok(sequences.len())
    }

    pub fn latest_sequence(&self) -> Option<Sequence> {
        self.cursor.lock().latest
    }

    pub fn previous_sequence(&self) -> Option<Sequence> {
        self.cursor.lock().previous
    }

    /// Highest sequence acknowledged by the remote node
    pub fn acknowledged(&self) -> Option<Sequence> {
        self.progress.borrow().acked
    }

    pub fn progress(&self) -> FlushProgress {
        self.progress.borrow().clone()
    }

    pub fn slots(&self) -> Vec<SlotInfo> {
        self.buffer.slots()
    }

    pub fn dirty_count(&self) -> usize {
        self.buffer.dirty_count()
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.channel.stats()
    }

    /// Flush everything queued, then stop the worker and release the buffer
    pub async fn shutdown(mut self) -> Result<()> {
        self.queue.take();

        if let Some(worker) = self.worker.take() {
            worker.await.map_err(|e| Error::Internal {
                message: format!("flush worker panicked: {}", e),
            })?;
        }
        self.buffer.close();

        let failed = self.progress.borrow().failed.len();
        info!(node_id = self.node_id, failed, "Training node agent shut down");
        Ok(())
    }
}

impl Drop for TrainNode {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        self.buffer.close();
    }
}

/// Failures remembered for waiters
const MAX_FAILED_TRACKED: usize = 1024;

fn record_failure(progress: &watch::Sender<FlushProgress>, sequence: Sequence, reason: String) {
    progress.send_modify(|p| {
        p.failed.insert(sequence, reason);
        if p.failed.len() > MAX_FAILED_TRACKED {
            p.failed.pop_first();
        }
    });
}

/// Sends queued sequences in order
///
/// After a permanent failure every later sequence is held back as failed
/// without being sent, so the remote never acknowledges a sequence before
/// an earlier one. The hold lifts once the failed sequence is re-flushed.
async fn flush_loop(
    node_id: NodeId,
    buffer: Arc<CircularBuffer>,
    channel: Arc<TransferChannel>,
    mut queue: mpsc::Receiver<Sequence>,
    progress: Arc<watch::Sender<FlushProgress>>,
) {
    debug!(node_id, "Flush worker started");
    let mut held_behind: Option<Sequence> = None;

    while let Some(sequence) = queue.recv().await {
        if let Some(failed) = held_behind.filter(|failed| sequence > *failed) {
            warn!(node_id, sequence, failed, "Flush held behind failed sequence");
            buffer.mark_failed(sequence);
            record_failure(
                &progress,
                sequence,
                format!("held behind failed sequence {}", failed),
            );
            continue;
        }

        let Some(snapshot) = buffer.begin_flush(sequence) else {
            if buffer.is_discarded(sequence) {
                record_failure(
                    &progress,
                    sequence,
                    "discarded before transfer".to_string(),
                );
            }
            debug!(node_id, sequence, "Snapshot superseded before flush");
            continue;
        };

        let record = SnapshotRecord::new(node_id, sequence, snapshot.epoch, snapshot.payload);
        match channel.send(&record).await {
            Ok(_) => {
                buffer.mark_flushed(sequence);
                if held_behind == Some(sequence) {
                    info!(node_id, sequence, "Failed sequence re-flushed, releasing hold");
                    held_behind = None;
                }
                progress.send_modify(|p| {
                    p.acked = p.acked.max(Some(sequence));
                    p.failed.remove(&sequence);
                });
            }
            Err(e) => {
                error!(node_id, sequence, error = %e, "Snapshot flush failed");
                buffer.mark_failed(sequence);
                held_behind = Some(held_behind.map_or(sequence, |held| held.min(sequence)));
                record_failure(&progress, sequence, e.to_string());
            }
        }
    }

    progress.send_modify(|p| p.closed = true);
    debug!(node_id, "Flush worker stopped");
}
