//! Checkpoint capture on training nodes
//!
//! Provides the circular checkpoint buffer with dirty-bit tracking, the
//! snapshot serializer, payload sharding, the save schedule and the
//! training node agent that overlaps transfer with computation.

pub mod buffer;
pub mod schedule;
pub mod serializer;
pub mod shard;
pub mod train_node;

pub use buffer::{CircularBuffer, FlushSnapshot, SlotInfo, SlotState};
pub use schedule::SaveSchedule;
pub use serializer::{Snapshot, SnapshotSerializer};
pub use shard::{join_shards, shard_range, ShardSpec};
pub use train_node::{FlushProgress, TrainNode, TrainNodeConfig};
