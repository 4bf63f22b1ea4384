//! Runtime configuration types

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Main runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Local checkpoint buffer settings
    pub buffer: BufferConfig,

    /// Transfer channel settings
    pub transfer: TransferConfig,

    /// Snapshot encoding and naming
    pub snapshot: SnapshotConfig,

    /// Remote node settings
    pub remote: RemoteConfig,

    /// Durable store settings
    pub storage: StorageConfig,

    /// Network settings
    pub network: NetworkConfig,

    /// Save schedule
    pub schedule: ScheduleConfig,

    /// Number of async I/O threads for the owned runtime
    pub io_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            transfer: TransferConfig::default(),
            snapshot: SnapshotConfig::default(),
            remote: RemoteConfig::default(),
            storage: StorageConfig::default(),
            network: NetworkConfig::default(),
            schedule: ScheduleConfig::default(),
            io_threads: 2,
        }
    }
}

impl RuntimeConfig {
    /// Load a JSON configuration file; missing fields take defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: RuntimeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.buffer.depth == 0 {
            return Err(invalid("buffer.depth must be at least 1"));
        }
        if self.remote.retain_per_node == 0 {
            return Err(invalid("remote.retain_per_node must be at least 1"));
        }
        if self.schedule.save_period == 0 {
            return Err(invalid("schedule.save_period must be at least 1"));
        }
        if self.transfer.retry.backoff_multiplier < 1.0 {
            return Err(invalid("transfer.retry.backoff_multiplier must be >= 1.0"));
        }
        if self.transfer.retry.initial_delay > self.transfer.retry.max_delay {
            return Err(invalid("transfer.retry.initial_delay exceeds max_delay"));
        }
        if let PersistMode::Joined { shard_count: 0 } = self.remote.persist {
            return Err(invalid("remote.persist.shard_count must be at least 1"));
        }
        if self.snapshot.naming.model_name.is_empty() {
            return Err(invalid("snapshot.naming.model_name cannot be empty"));
        }
        if self.io_threads == 0 {
            return Err(invalid("io_threads must be at least 1"));
        }
        Ok(())
    }

    /// Remote address as `host:port`
    pub fn remote_address(&self) -> String {
        format!("{}:{}", self.remote.bind_address, self.remote.port)
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidConfig {
        message: message.to_string(),
    }
}

/// What `write` does when the next slot still holds unacknowledged data
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum OverwritePolicy {
    /// Wait until the slot is flushed
    #[default]
    Block,

    /// Fail immediately with `BufferFull`
    Reject,

    /// Discard a queued-but-untransferred snapshot; still waits on an in-flight one
    DropOldest,
}

/// Checkpoint buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Number of slots in the circular buffer
    pub depth: usize,

    /// Policy when wrapping onto a dirty slot
    pub overwrite_policy: OverwritePolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            depth: 2,
            overwrite_policy: OverwritePolicy::Block,
        }
    }
}

/// Transfer channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Retry configuration
    pub retry: RetryConfig,

    /// Timeout for a single delivery attempt
    #[serde(with = "millis")]
    pub attempt_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Initial delay before first retry
    #[serde(with = "millis")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "millis")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Add jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Snapshot serialization format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SnapshotFormat {
    /// Compact structured record (bincode)
    #[default]
    Record,

    /// Self-describing dictionary (JSON)
    Dictionary,
}

/// How persisted checkpoint files are named
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NamingPolicy {
    /// Base name of checkpoint files
    pub model_name: String,

    /// Append a timestamp (and epoch) instead of overwriting a fixed name
    pub timestamped: bool,

    /// Place files under a directory named after the model
    pub in_directory: bool,
}

impl Default for NamingPolicy {
    fn default() -> Self {
        Self {
            model_name: "model".to_string(),
            timestamped: false,
            in_directory: false,
        }
    }
}

/// Snapshot configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Serialization format
    pub format: SnapshotFormat,

    /// File naming for the durable tier
    pub naming: NamingPolicy,
}

/// Whether and how the remote node writes snapshots to the durable store
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PersistMode {
    /// Memory tier only
    #[default]
    Disabled,

    /// One file per node snapshot
    PerNode,

    /// Join all shard contributors of an epoch into one file
    Joined { shard_count: u32 },
}

/// Remote node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Address to bind (or connect to)
    pub bind_address: String,

    /// Port for the snapshot server
    pub port: u16,

    /// Acknowledged snapshots kept in memory per training node
    pub retain_per_node: usize,

    /// Durable persistence mode
    pub persist: PersistMode,

    /// Timestamped checkpoint files to keep
    pub keep_count: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 50061,
            retain_per_node: 4,
            persist: PersistMode::Disabled,
            keep_count: 5,
        }
    }
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base path for checkpoint files
    pub base_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: "./checkpoints".to_string(),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Connection timeout
    #[serde(with = "millis")]
    pub connect_timeout: Duration,

    /// Request timeout for catalog and fetch queries
    #[serde(with = "millis")]
    pub request_timeout: Duration,

    /// Maximum gRPC message size in bytes
    pub max_message_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_message_size: 1024 * 1024 * 1024, // 1GB
        }
    }
}

/// Save schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// First epoch this run trains (1-based)
    pub start_epoch: u32,

    /// Last epoch of the job
    pub total_epochs: u32,

    /// Save every N epochs
    pub save_period: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            start_epoch: 1,
            total_epochs: 100,
            save_period: 1,
        }
    }
}

/// Duration serialization as integer milliseconds
mod millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.buffer.depth, 2);
        assert_eq!(config.buffer.overwrite_policy, OverwritePolicy::Block);
        assert_eq!(config.remote.port, 50061);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.remote.port, config.remote.port);
        assert_eq!(parsed.transfer.retry.initial_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let json = r#"{
            "buffer": { "depth": 4, "overwrite_policy": "Reject" },
            "remote": {
                "bind_address": "10.0.0.9",
                "port": 7000,
                "retain_per_node": 2,
                "persist": { "Joined": { "shard_count": 3 } },
                "keep_count": 1
            }
        }"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.buffer.depth, 4);
        assert_eq!(config.buffer.overwrite_policy, OverwritePolicy::Reject);
        assert_eq!(config.remote.persist, PersistMode::Joined { shard_count: 3 });
        assert_eq!(config.remote_address(), "10.0.0.9:7000");
        assert_eq!(config.snapshot.format, SnapshotFormat::Record);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "buffer": { "depth": 0, "overwrite_policy": "Block" } }"#)
            .unwrap();

        let result = RuntimeConfig::from_json_file(&path);
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RuntimeConfig::default();
        config.transfer.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.remote.persist = PersistMode::Joined { shard_count: 0 };
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.schedule.save_period = 0;
        assert!(config.validate().is_err());
    }
}
