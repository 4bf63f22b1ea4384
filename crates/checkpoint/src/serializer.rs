//! Snapshot serialization
//!
//! Training state reaches the buffer through the [`Snapshot`] capability:
//! any type that can produce and consume a byte-exact representation of
//! itself. Every serde type gets it for free.

use bytes::Bytes;
use runtime_core::{Result, SnapshotFormat};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Capability of a training state to be captured and restored byte-exactly
pub trait Snapshot: Sized {
    /// Encode the state in `format`
    fn to_payload(&self, format: SnapshotFormat) -> Result<Vec<u8>>;

    /// Rebuild the state from a payload produced by [`to_payload`](Self::to_payload)
    fn from_payload(payload: &[u8], format: SnapshotFormat) -> Result<Self>;
}

impl<T> Snapshot for T
where
    T: Serialize + DeserializeOwned,
{
    fn to_payload(&self, format: SnapshotFormat) -> Result<Vec<u8>> {
        match format {
            SnapshotFormat::Record => Ok(bincode::serialize(self)?),
            SnapshotFormat::Dictionary => Ok(serde_json::to_vec(self)?),
        }
    }

    fn from_payload(payload: &[u8], format: SnapshotFormat) -> Result<Self> {
        match format {
            SnapshotFormat::Record => Ok(bincode::deserialize(payload)?),
            SnapshotFormat::Dictionary => Ok(serde_json::from_slice(payload)?),
        }
    }
}

/// Converts training state to and from snapshot payloads in one format
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotSerializer {
    format: SnapshotFormat,
}

impl SnapshotSerializer {
    pub fn new(format: SnapshotFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> SnapshotFormat {
        self.format
    }

    pub fn serialize<S: Snapshot>(&self, state: &S) -> Result<Bytes> {
        state.to_payload(self.format).map(Bytes::from)
    }

    pub fn deserialize<S: Snapshot>(&self, payload: &[u8]) -> Result<S> {
        S::from_payload(payload, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TrainState {
        epoch: u32,
        weights: Vec<f32>,
        optimizer: BTreeMap<String, f64>,
    }

    fn state() -> TrainState {
        let mut optimizer = BTreeMap::new();
        optimizer.insert("lr".to_string(), 0.01);
        optimizer.insert("momentum".to_string(), 0.9);
        TrainState {
            epoch: 4,
            weights: vec![0.5, -1.25, 3.0],
            optimizer,
        }
    }

    #[test]
    fn test_both_formats_restore_state() {
        for format in [SnapshotFormat::Record, SnapshotFormat::Dictionary] {
            let serializer = SnapshotSerializer::new(format);
            let payload = serializer.serialize(&state()).unwrap();
            let restored: TrainState = serializer.deserialize(&payload).unwrap();
            assert_eq!(restored, state());
        }
    }

    #[test]
    fn test_dictionary_is_self_describing() {
        let payload = SnapshotSerializer::new(SnapshotFormat::Dictionary)
            .serialize(&state())
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["optimizer"]["momentum"], 0.9);
    }

    #[test]
    fn test_format_mismatch_is_an_error() {
        let payload = SnapshotSerializer::new(SnapshotFormat::Record)
            .serialize(&state())
            .unwrap();
        let result: Result<TrainState> =
            SnapshotSerializer::new(SnapshotFormat::Dictionary).deserialize(&payload);
        assert!(result.is_err());
    }
}
