//! Error types for the multi-level checkpoint runtime

use crate::types::{NodeId, Sequence};
use thiserror::Error;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the multi-level checkpoint runtime
#[derive(Error, Debug)]
pub enum Error {
    // Local buffer errors
    #[error("Checkpoint buffer full: slot {slot} still holds unacknowledged sequence {occupant}")]
    BufferFull { slot: usize, occupant: Sequence },

    // Transfer errors
    #[error("Transfer failed: node={node_id}, sequence={sequence} after {attempts} attempts: {reason}")]
    TransferFailed {
        node_id: NodeId,
        sequence: Sequence,
        attempts: u32,
        reason: String,
    },

    #[error("Snapshot corrupted: node={node_id}, sequence={sequence} (expected crc 0x{expected:08X}, computed 0x{computed:08X})")]
    Corrupt {
        node_id: NodeId,
        sequence: Sequence,
        expected: u32,
        computed: u32,
    },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Write rejected by remote node: {message}")]
    Rejected { message: String },

    // Durability errors
    #[error("Checkpoint unavailable: sequence {sequence} could not be certified durable: {reason}")]
    CheckpointUnavailable { sequence: Sequence, reason: String },

    #[error("Recovery incomplete: {reason}")]
    RecoveryIncomplete { reason: String },

    #[error("Snapshot not found: node={node_id}, sequence={sequence:?}")]
    SnapshotNotFound {
        node_id: NodeId,
        sequence: Option<Sequence>,
    },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Timeout errors
    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // Channel errors
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    #[error("Component shut down: {component}")]
    Shutdown { component: String },

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if the transfer channel should retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::Timeout { .. } | Error::Corrupt { .. } | Error::Io(_)
        )
    }

    /// Returns true if this error voids the checkpoint safety guarantee
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CheckpointUnavailable { .. }
                | Error::RecoveryIncomplete { .. }
                | Error::InvalidConfig { .. }
                | Error::Internal { .. }
        )
    }

    /// Delay in milliseconds that replaces the backoff schedule for this
    /// error, if any
    ///
    /// A checksum rejection means the remote was reachable, so the record
    /// is resent without waiting.
    pub fn retry_delay_hint_ms(&self) -> Option<u64> {
        match self {
            Error::Corrupt { .. } => Some(0),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let err = Error::Transport {
            message: "connection reset".to_string(),
        };
        assert!(err.is_retryable());

        let err = Error::Corrupt {
            node_id: 0,
            sequence: 3,
            expected: 1,
            computed: 2,
        };
        assert!(err.is_retryable());

        let err = Error::Rejected {
            message: "unknown node".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_only_corrupt_skips_backoff() {
        let corrupt = Error::Corrupt {
            node_id: 0,
            sequence: 1,
            expected: 1,
            computed: 2,
        };
        assert_eq!(corrupt.retry_delay_hint_ms(), Some(0));

        let unreachable = Error::Transport {
            message: "connection refused".to_string(),
        };
        assert_eq!(unreachable.retry_delay_hint_ms(), None);
    }

    #[test]
    fn test_error_fatal() {
        let err = Error::CheckpointUnavailable {
            sequence: 4,
            reason: "remote unreachable".to_string(),
        };
        assert!(err.is_fatal());

        let err = Error::BufferFull {
            slot: 1,
            occupant: 3,
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_corrupt_message_shows_checksums() {
        let err = Error::Corrupt {
            node_id: 2,
            sequence: 9,
            expected: 0xDEADBEEF,
            computed: 0x0000_00FF,
        };
        let msg = err.to_string();
        assert!(msg.contains("0xDEADBEEF"));
        assert!(msg.contains("0x000000FF"));
    }
}
