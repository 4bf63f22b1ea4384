//! Circular checkpoint buffer with dirty-bit tracking
//!
//! Each slot moves through `Empty/Flushed → Writing → Ready → Flushing →
//! Flushed`. The slot for sequence `s` is `s % depth`. A dirty bit is set
//! when a snapshot is committed and cleared only when the remote node
//! acknowledges it, and a dirty slot is never reused unless the
//! `DropOldest` policy discards a snapshot that has not started flushing.

use std::collections::BTreeSet;

use bytes::Bytes;
use parking_lot::Mutex;
use runtime_core::{Epoch, Error, OverwritePolicy, Result, Sequence};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Discarded sequences remembered for flush bookkeeping
const MAX_DISCARDED_TRACKED: usize = 256;

/// Lifecycle state of a checkpoint slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Writing,
    Ready,
    Flushing,
    Flushed,
}

#[derive(Debug, Clone)]
struct CheckpointSlot {
    sequence: Sequence,
    epoch: Epoch,
    payload: Bytes,
    state: SlotState,
    /// Flush failed permanently; waits for a manual re-flush
    abandoned: bool,
}

impl CheckpointSlot {
    fn empty() -> Self {
        Self {
            sequence: 0,
            epoch: 0,
            payload: Bytes::new(),
            state: SlotState::Empty,
            abandoned: false,
        }
    }
}

/// One bit per slot
#[derive(Debug, Clone)]
struct DirtyBitmap {
    words: Vec<u64>,
}

impl DirtyBitmap {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
        }
    }

    fn set(&mut self, index: usize) {
        self.words[index / 64] |= 1 << (index % 64);
    }

    fn clear(&mut self, index: usize) {
        self.words[index / 64] &= !(1 << (index % 64));
    }

    fn is_set(&self, index: usize) -> bool {
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Point-in-time view of a slot, for instrumentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub index: usize,
    pub sequence: Sequence,
    pub epoch: Epoch,
    pub size_bytes: usize,
    pub state: SlotState,
    pub dirty: bool,
    pub abandoned: bool,
}

/// Payload handed to the transfer side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushSnapshot {
    pub sequence: Sequence,
    pub epoch: Epoch,
    pub payload: Bytes,
}

#[derive(Debug)]
struct BufferInner {
    slots: Vec<CheckpointSlot>,
    dirty: DirtyBitmap,
    next_sequence: Sequence,
    writing: Option<Sequence>,
    /// Recently discarded by `DropOldest`, never transferred
    discarded: BTreeSet<Sequence>,
    closed: bool,
}

impl BufferInner {
    fn index(&self, sequence: Sequence) -> usize {
        (sequence % self.slots.len() as u64) as usize
    }

    /// Slot currently holding `sequence`, if it has not been reused
    fn slot_of(&mut self, sequence: Sequence) -> Option<(usize, &mut CheckpointSlot)> {
        let index = self.index(sequence);
        let slot = &mut self.slots[index];
        (slot.sequence == sequence && slot.state != SlotState::Empty).then_some((index, slot))
    }
}

/// Fixed-capacity circular store of checkpoint slots for one training node
#[derive(Debug)]
pub struct CircularBuffer {
    inner: Mutex<BufferInner>,
    changed: Notify,
    policy: OverwritePolicy,
}

impl CircularBuffer {
    /// Create a buffer whose first sequence is 1
    pub fn new(depth: usize, policy: OverwritePolicy) -> Result<Self> {
        Self::starting_at(depth, policy, 1)
    }

    /// Create a buffer whose first sequence is `first_sequence`
    pub fn starting_at(
        depth: usize,
        policy: OverwritePolicy,
        first_sequence: Sequence,
    ) -> Result<Self> {
        if depth == 0 {
            return Err(Error::InvalidConfig {
                message: "checkpoint buffer depth must be at least 1".to_string(),
            });
        }

        Ok(Self {
            inner: Mutex::new(BufferInner {
                slots: vec![CheckpointSlot::empty(); depth],
                dirty: DirtyBitmap::new(depth),
                next_sequence: first_sequence.max(1),
                writing: None,
                discarded: BTreeSet::new(),
                closed: false,
            }),
            changed: Notify::new(),
            policy,
        })
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn policy(&self) -> OverwritePolicy {
        self.policy
    }

    /// Sequence the next write will receive
    pub fn next_sequence(&self) -> Sequence {
        self.inner.lock().next_sequence
    }

    /// Reserve the next slot, moving it to `Writing`
    ///
    /// Waits while another write is open. When the target slot still holds
    /// an unacknowledged snapshot the overwrite policy decides: `Block`
    /// waits for its flush, `Reject` fails with `BufferFull`, `DropOldest`
    /// discards it unless it is already flushing.
    pub async fn begin_write(&self, epoch: Epoch) -> Result<Sequence> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(sequence) = self.try_reserve(epoch)? {
                return Ok(sequence);
            }

            notified.await;
        }
    }

    fn try_reserve(&self, epoch: Epoch) -> Result<Option<Sequence>> {
        let mut inner = self.inner.lock();

        if inner.closed {
            return Err(Error::Shutdown {
                component: "checkpoint buffer".to_string(),
            });
        }
        if inner.writing.is_some() {
            return Ok(None);
        }

        let sequence = inner.next_sequence;
        let index = inner.index(sequence);
        let dirty = inner.dirty.is_set(index);
        let slot = &inner.slots[index];

        if dirty {
            if slot.abandoned {
                return Err(Error::CheckpointUnavailable {
                    sequence: slot.sequence,
                    reason: format!(
                        "slot {} still holds unflushed sequence {} whose transfer failed",
                        index, slot.sequence
                    ),
                });
            }

            match (self.policy, slot.state) {
                (OverwritePolicy::Reject, _) => {
                    return Err(Error::BufferFull {
                        slot: index,
                        occupant: slot.sequence,
                    });
                }
                (OverwritePolicy::DropOldest, SlotState::Ready) => {
                    let dropped = slot.sequence;
                    warn!(slot = index, dropped, "Discarding snapshot that was never transferred");
                    inner.discarded.insert(dropped);
                    if inner.discarded.len() > MAX_DISCARDED_TRACKED {
                        inner.discarded.pop_first();
                    }
                }
                _ => {
                    debug!(slot = index, occupant = slot.sequence, "Waiting for slot to flush");
                    return Ok(None);
                }
            }
        }

        inner.dirty.clear(index);
        inner.slots[index] = CheckpointSlot {
            sequence,
            epoch,
            payload: Bytes::new(),
            state: SlotState::Writing,
            abandoned: false,
        };
        inner.writing = Some(sequence);
        inner.next_sequence += 1;

        Ok(Some(sequence))
    }

    /// Store the serialized payload for a reserved sequence (`Writing → Ready`)
    pub fn commit(&self, sequence: Sequence, payload: Bytes) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.writing != Some(sequence) {
            return Err(Error::Internal {
                message: format!("sequence {} is not open for writing", sequence),
            });
        }

        let index = inner.index(sequence);
        let slot = &mut inner.slots[index];
        slot.payload = payload;
        slot.state = SlotState::Ready;
        inner.dirty.set(index);
        inner.writing = None;
        drop(inner);

        self.changed.notify_waiters();
        Ok(())
    }

    /// Give up a reserved sequence; its slot becomes `Empty`
    pub fn abort(&self, sequence: Sequence) {
        let mut inner = self.inner.lock();
        if inner.writing != Some(sequence) {
            return;
        }

        let index = inner.index(sequence);
        inner.slots[index] = CheckpointSlot::empty();
        inner.writing = None;
        drop(inner);

        self.changed.notify_waiters();
    }

    /// Reserve, fill and commit the next slot
    pub async fn write(&self, epoch: Epoch, payload: Bytes) -> Result<Sequence> {
        let sequence = self.begin_write(epoch).await?;
        self.commit(sequence, payload)?;
        Ok(sequence)
    }

    /// Read-only access to a committed snapshot that has not been acknowledged
    pub fn snapshot_for_flush(&self, sequence: Sequence) -> Option<FlushSnapshot> {
        let mut inner = self.inner.lock();
        let (_, slot) = inner.slot_of(sequence)?;

        matches!(slot.state, SlotState::Ready | SlotState::Flushing).then(|| FlushSnapshot {
            sequence,
            epoch: slot.epoch,
            payload: slot.payload.clone(),
        })
    }

    /// Move a `Ready` slot to `Flushing` and hand out its payload
    ///
    /// Returns `None` if the sequence was discarded, already acknowledged
    /// or is already in flight.
    pub fn begin_flush(&self, sequence: Sequence) -> Option<FlushSnapshot> {
        let mut inner = self.inner.lock();
        let (_, slot) = inner.slot_of(sequence)?;

        if slot.state != SlotState::Ready {
            return None;
        }

        slot.state = SlotState::Flushing;
        slot.abandoned = false;
        Some(FlushSnapshot {
            sequence,
            epoch: slot.epoch,
            payload: slot.payload.clone(),
        })
    }

    /// Record the remote acknowledgment; clears the dirty bit. Idempotent.
    pub fn mark_flushed(&self, sequence: Sequence) -> bool {
        let mut inner = self.inner.lock();
        let Some((index, slot)) = inner.slot_of(sequence) else {
            return false;
        };

        match slot.state {
            SlotState::Ready | SlotState::Flushing => {
                slot.state = SlotState::Flushed;
                slot.abandoned = false;
                inner.dirty.clear(index);
            }
            _ => return false,
        }
        drop(inner);

        self.changed.notify_waiters();
        true
    }

    /// Record a permanent flush failure, or a flush that was held back
    /// behind one; the slot stays dirty and is marked abandoned until
    /// [`requeue_abandoned`](Self::requeue_abandoned)
    pub fn mark_failed(&self, sequence: Sequence) {
        let mut inner = self.inner.lock();
        if let Some((_, slot)) = inner.slot_of(sequence) {
            if matches!(slot.state, SlotState::Ready | SlotState::Flushing) {
                slot.state = SlotState::Ready;
                slot.abandoned = true;
            }
        }
        drop(inner);

        self.changed.notify_waiters();
    }

    /// Clear the abandoned flag of failed slots and return their sequences
    pub fn requeue_abandoned(&self) -> Vec<Sequence> {
        let mut inner = self.inner.lock();
        let mut sequences: Vec<Sequence> = inner
            .slots
            .iter_mut()
            .filter(|slot| slot.abandoned && slot.state == SlotState::Ready)
            .map(|slot| {
                slot.abandoned = false;
                slot.sequence
            })
            .collect();
        sequences.sort_unstable();
        sequences
    }

    pub fn is_dirty(&self, sequence: Sequence) -> bool {
        let inner = self.inner.lock();
        let index = inner.index(sequence);
        let slot = &inner.slots[index];
        slot.sequence == sequence && slot.state != SlotState::Empty && inner.dirty.is_set(index)
    }

    /// Whether `sequence` was discarded by `DropOldest` before transfer
    pub fn is_discarded(&self, sequence: Sequence) -> bool {
        self.inner.lock().discarded.contains(&sequence)
    }

    /// Whether the remote acknowledged `sequence`
    ///
    /// A slot that moved on to a later sequence was acknowledged first,
    /// unless `DropOldest` discarded it.
    pub fn is_acknowledged(&self, sequence: Sequence) -> bool {
        let inner = self.inner.lock();
        let slot = &inner.slots[inner.index(sequence)];

        if slot.sequence == sequence {
            slot.state == SlotState::Flushed
        } else {
            slot.sequence > sequence && !inner.discarded.contains(&sequence)
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.inner.lock().dirty.count()
    }

    pub fn slots(&self) -> Vec<SlotInfo> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotInfo {
                index,
                sequence: slot.sequence,
                epoch: slot.epoch,
                size_bytes: slot.payload.len(),
                state: slot.state,
                dirty: inner.dirty.is_set(index),
                abandoned: slot.abandoned,
            })
            .collect()
    }

    /// Fail pending and future writes and release payload memory
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for slot in inner.slots.iter_mut() {
            slot.payload = Bytes::new();
        }
        drop(inner);

        self.changed.notify_waiters();
    }
}
