//! Conversions between runtime types and their protobuf messages
//!
//! Records keep the checksum they were created with in both directions;
//! only the remote node recomputes it, when verifying a put.

use runtime_core::{
    Ack, Error, Nack, NackReason, NodeCatalog, SnapshotInfo, SnapshotRecord,
};
use tonic::{Code, Status};

use crate::proto;

impl From<&SnapshotRecord> for proto::SnapshotRecord {
    fn from(record: &SnapshotRecord) -> Self {
        Self {
            node_id: record.node_id,
            sequence: record.sequence,
            epoch: record.epoch,
            checksum: record.checksum,
            payload: record.payload.clone(),
        }
    }
}

impl From<proto::SnapshotRecord> for SnapshotRecord {
    fn from(record: proto::SnapshotRecord) -> Self {
        Self {
            node_id: record.node_id,
            sequence: record.sequence,
            epoch: record.epoch,
            checksum: record.checksum,
            payload: record.payload,
        }
    }
}

impl From<Ack> for proto::Ack {
    fn from(ack: Ack) -> Self {
        Self {
            node_id: ack.node_id,
            sequence: ack.sequence,
        }
    }
}

impl From<proto::Ack> for Ack {
    fn from(ack: proto::Ack) -> Self {
        Self {
            node_id: ack.node_id,
            sequence: ack.sequence,
        }
    }
}

impl From<Nack> for proto::Nack {
    fn from(nack: Nack) -> Self {
        let reason = match nack.reason {
            NackReason::Corrupt { expected, computed } => {
                proto::nack::Reason::Corrupt(proto::ChecksumMismatch { expected, computed })
            }
            NackReason::Rejected { message } => proto::nack::Reason::Rejected(message),
        };
        Self {
            node_id: nack.node_id,
            sequence: nack.sequence,
            reason: Some(reason),
        }
    }
}

impl From<SnapshotInfo> for proto::SnapshotInfo {
    fn from(info: SnapshotInfo) -> Self {
        Self {
            sequence: info.sequence,
            epoch: info.epoch,
            size_bytes: info.size_bytes,
            checksum: info.checksum,
        }
    }
}

impl From<proto::SnapshotInfo> for SnapshotInfo {
    fn from(info: proto::SnapshotInfo) -> Self {
        Self {
            sequence: info.sequence,
            epoch: info.epoch,
            size_bytes: info.size_bytes,
            checksum: info.checksum,
        }
    }
}

impl From<NodeCatalog> for proto::NodeCatalog {
    fn from(catalog: NodeCatalog) -> Self {
        Self {
            node_id: catalog.node_id,
            high_water: catalog.high_water,
            snapshots: catalog.snapshots.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<proto::NodeCatalog> for NodeCatalog {
    fn from(catalog: proto::NodeCatalog) -> Self {
        Self {
            node_id: catalog.node_id,
            high_water: catalog.high_water,
            snapshots: catalog.snapshots.into_iter().map(Into::into).collect(),
        }
    }
}

/// Turn a put reply into the delivery verdict
pub fn put_outcome(reply: proto::PutReply) -> Result<Ack, Error> {
    match reply.outcome {
        Some(proto::put_reply::Outcome::Ack(ack)) => Ok(ack.into()),
        Some(proto::put_reply::Outcome::Nack(nack)) => match nack.reason {
            Some(proto::nack::Reason::Corrupt(mismatch)) => Err(Error::Corrupt {
                node_id: nack.node_id,
                sequence: nack.sequence,
                expected: mismatch.expected,
                computed: mismatch.computed,
            }),
            Some(proto::nack::Reason::Rejected(message)) => Err(Error::Rejected { message }),
            None => Err(Error::Protocol {
                message: format!("nack for sequence {} without a reason", nack.sequence),
            }),
        },
        None => Err(Error::Protocol {
            message: "put reply carried neither ack nor nack".to_string(),
        }),
    }
}

/// Map a failed call onto the runtime taxonomy
///
/// Unreachable remotes surface as `Transport` and expired deadlines as
/// `Timeout`, so both stay retryable.
pub fn status_to_error(status: Status, operation: &str, timeout_ms: u64) -> Error {
    match status.code() {
        Code::Unavailable | Code::Aborted => Error::Transport {
            message: format!("{} failed: {}", operation, status.message()),
        },
        Code::DeadlineExceeded | Code::Cancelled => Error::Timeout {
            operation: operation.to_string(),
            timeout_ms,
        },
        code => Error::Protocol {
            message: format!("{} failed with {:?}: {}", operation, code, status.message()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_record_keeps_carried_checksum() {
        let mut record = SnapshotRecord::new(4, 9, 2, Bytes::from_static(b"embedding"));
        record.checksum ^= 1;

        let back = SnapshotRecord::from(proto::SnapshotRecord::from(&record));
        assert_eq!(back, record);
        assert!(back.verify().is_err());
    }

    #[test]
    fn test_nack_reasons() {
        let corrupt = proto::PutReply {
            outcome: Some(proto::put_reply::Outcome::Nack(
                Nack {
                    node_id: 1,
                    sequence: 3,
                    reason: NackReason::Corrupt {
                        expected: 10,
                        computed: 11,
                    },
                }
                .into(),
            )),
        };
        let err = put_outcome(corrupt).unwrap_err();
        assert!(matches!(
            err,
            Error::Corrupt {
                node_id: 1,
                sequence: 3,
                expected: 10,
                computed: 11
            }
        ));
        assert!(err.is_retryable());

        let rejected = proto::PutReply {
            outcome: Some(proto::put_reply::Outcome::Nack(
                Nack {
                    node_id: 1,
                    sequence: 3,
                    reason: NackReason::Rejected {
                        message: "stale".to_string(),
                    },
                }
                .into(),
            )),
        };
        assert!(matches!(put_outcome(rejected), Err(Error::Rejected { .. })));

        let empty = proto::PutReply { outcome: None };
        assert!(matches!(put_outcome(empty), Err(Error::Protocol { .. })));
    }

    #[test]
    fn test_status_mapping() {
        let err = status_to_error(Status::unavailable("refused"), "put", 100);
        assert!(matches!(err, Error::Transport { .. }));
        assert!(err.is_retryable());

        let err = status_to_error(Status::deadline_exceeded("slow"), "fetch", 100);
        assert!(matches!(err, Error::Timeout { timeout_ms: 100, .. }));

        let err = status_to_error(Status::resource_exhausted("too large"), "put", 100);
        assert!(matches!(err, Error::Protocol { .. }));
        assert!(!err.is_retryable());
    }
}
