//! Process-group identity supplied by the launcher

use checkpoint::ShardSpec;
use runtime_core::{Error, NodeId, Result};

/// This process's place in the job
///
/// The highest rank hosts the remote node; every other rank trains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Communicator {
    pub rank: u32,
    pub world_size: u32,
    pub local_rank: u32,
    /// Rendezvous address of the training process group
    pub master_addr: String,
    pub master_port: u16,
    /// `host:port` of the remote node
    pub remote_addr: String,
    /// Ranks contributing a payload shard, in shard order
    pub sharding_ranks: Vec<u32>,
}

const DEFAULT_MASTER_PORT: u16 = 29500;
const DEFAULT_REMOTE_PORT: u16 = 50061;

impl Communicator {
    pub fn new(rank: u32, world_size: u32) -> Result<Self> {
        if world_size < 2 {
            return Err(Error::InvalidConfig {
                message: format!(
                    "world size {} leaves no room for a remote node next to the trainers",
                    world_size
                ),
            });
        }
        if rank >= world_size {
            return Err(Error::InvalidConfig {
                message: format!("rank {} is outside world size {}", rank, world_size),
            });
        }

        Ok(Self {
            rank,
            world_size,
            local_rank: 0,
            master_addr: "127.0.0.1".to_string(),
            master_port: DEFAULT_MASTER_PORT,
            remote_addr: format!("127.0.0.1:{}", DEFAULT_REMOTE_PORT),
            sharding_ranks: (0..world_size - 1).collect(),
        })
    }

    /// Read `RANK`, `WORLD_SIZE`, `LOCAL_RANK`, `MASTER_ADDR`, `MASTER_PORT`
    /// and `REMOTE_ADDR` from the environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| Error::InvalidConfig {
                message: format!("{} is not set", key),
            })
        };
        let number = |key: &str, value: String| {
            value.trim().parse::<u32>().map_err(|_| Error::InvalidConfig {
                message: format!("{}={} is not a number", key, value),
            })
        };

        let rank = number("RANK", required("RANK")?)?;
        let world_size = number("WORLD_SIZE", required("WORLD_SIZE")?)?;
        let mut communicator = Self::new(rank, world_size)?;

        if let Some(value) = lookup("LOCAL_RANK") {
            communicator.local_rank = number("LOCAL_RANK", value)?;
        }
        if let Some(addr) = lookup("MASTER_ADDR") {
            communicator.remote_addr = format!("{}:{}", addr, DEFAULT_REMOTE_PORT);
            communicator.master_addr = addr;
        }
        if let Some(value) = lookup("MASTER_PORT") {
            communicator.master_port = value.trim().parse().map_err(|_| Error::InvalidConfig {
                message: format!("MASTER_PORT={} is not a port", value),
            })?;
        }
        if let Some(addr) = lookup("REMOTE_ADDR") {
            communicator.remote_addr = addr;
        }

        Ok(communicator)
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = addr.into();
        self
    }

    pub fn with_sharding_ranks(mut self, ranks: Vec<u32>) -> Self {
        self.sharding_ranks = ranks;
        self
    }

    /// One shard contributor per host: ranks whose local rank is 0
    ///
    /// `local_ranks[r]` is the local rank of global rank `r`. The remote
    /// node's rank never contributes.
    pub fn sharding_ranks_from_local(local_ranks: &[u32]) -> Vec<u32> {
        let trainers = local_ranks.len().saturating_sub(1);
        local_ranks[..trainers]
            .iter()
            .enumerate()
            .filter(|(_, local_rank)| **local_rank == 0)
            .map(|(rank, _)| rank as u32)
            .collect()
    }

    pub fn remote_rank(&self) -> u32 {
        self.world_size - 1
    }

    pub fn is_remote(&self) -> bool {
        self.rank == self.remote_rank()
    }

    pub fn node_id(&self) -> NodeId {
        self.rank
    }

    /// Ranks that train, which is everyone but the remote node
    pub fn training_ranks(&self) -> Vec<NodeId> {
        (0..self.remote_rank()).collect()
    }

    /// Position among the shard contributors
    pub fn shard_rank(&self) -> Option<usize> {
        if self.is_remote() {
            return None;
        }
        self.sharding_ranks.iter().position(|rank| *rank == self.rank)
    }

    /// Slice to contribute when payloads are split `shard_count` ways
    pub fn shard_spec(&self, shard_count: u32) -> Result<Option<ShardSpec>> {
        let shard_count = shard_count as usize;
        if shard_count > self.sharding_ranks.len() {
            return Err(Error::InvalidConfig {
                message: format!(
                    "shard count {} exceeds the {} available shard contributors",
                    shard_count,
                    self.sharding_ranks.len()
                ),
            });
        }

        match self.shard_rank() {
            Some(rank) if rank < shard_count => ShardSpec::new(rank, shard_count).map(Some),
            _ => Ok(None),
        }
    }

    /// Node ids whose snapshots make up one joined checkpoint
    pub fn shard_contributors(&self, shard_count: u32) -> Vec<NodeId> {
        self.sharding_ranks
            .iter()
            .take(shard_count as usize)
            .copied()
            .collect()
    }

    /// Environment a training process group expects, as key/value pairs
    ///
    /// The training group excludes the remote node, so `WORLD_SIZE` is one
    /// less than the job's world size.
    pub fn training_env(&self) -> Vec<(String, String)> {
        let shard_rank = self
            .shard_rank()
            .map(|rank| rank.to_string())
            .unwrap_or_else(|| "-1".to_string());

        vec![
            ("RANK".to_string(), self.rank.to_string()),
            ("LOCAL_RANK".to_string(), self.local_rank.to_string()),
            ("WORLD_SIZE".to_string(), (self.world_size - 1).to_string()),
            ("MASTER_ADDR".to_string(), self.master_addr.clone()),
            ("MASTER_PORT".to_string(), self.master_port.to_string()),
            ("SHARD_RANK".to_string(), shard_rank),
        ]
    }
}
