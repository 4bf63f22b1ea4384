//! Payload sharding across contributing training nodes

use std::ops::Range;

use bytes::{Bytes, BytesMut};
use runtime_core::{Error, Result};

/// Byte range of shard `rank` out of `count` for a payload of `len` bytes
///
/// The first `len % count` shards are one byte longer. Shards may be empty.
pub fn shard_range(len: usize, rank: usize, count: usize) -> Range<usize> {
    let count = count.max(1);
    let rank = rank.min(count - 1);
    let quotient = len / count;
    let remainder = len % count;

    if rank < remainder {
        rank * (quotient + 1)..(rank + 1) * (quotient + 1)
    } else {
        rank * quotient + remainder..(rank + 1) * quotient + remainder
    }
}

/// Which slice of the full payload this node contributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub rank: usize,
    pub count: usize,
}

impl ShardSpec {
    pub fn new(rank: usize, count: usize) -> Result<Self> {
        if count == 0 || rank >= count {
            return Err(Error::InvalidConfig {
                message: format!("shard rank {} is outside of {} shards", rank, count),
            });
        }
        Ok(Self { rank, count })
    }

    /// This node's slice; shares memory with `payload`
    pub fn slice(&self, payload: &Bytes) -> Bytes {
        payload.slice(shard_range(payload.len(), self.rank, self.count))
    }
}

/// Concatenate shards given in rank order
pub fn join_shards<I>(shards: I) -> Bytes
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut joined = BytesMut::new();
    for shard in shards {
        joined.extend_from_slice(shard.as_ref());
    }
    joined.freeze()
}
