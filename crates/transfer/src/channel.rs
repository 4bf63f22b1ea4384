//! Transfer channel: one ordered, retried flush at a time per training node

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use runtime_core::{Ack, Error, NodeId, Result, Sequence, SnapshotRecord};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::retry::RetryPolicy;
use crate::transport::Transport;

/// One in-flight copy; lives only for the duration of `send`
#[derive(Debug)]
struct TransferSession {
    id: Uuid,
    node_id: NodeId,
    sequence: Sequence,
    attempts: u32,
    started: Instant,
}

impl TransferSession {
    fn new(node_id: NodeId, sequence: Sequence) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id,
            sequence,
            attempts: 0,
            started: Instant::now(),
        }
    }

    fn failed(&self, reason: String) -> Error {
        Error::TransferFailed {
            node_id: self.node_id,
            sequence: self.sequence,
            attempts: self.attempts,
            reason,
        }
    }
}

/// Counters exposed for instrumentation
#[derive(Debug, Default)]
struct ChannelCounters {
    delivered: AtomicU64,
    retries: AtomicU64,
    corrupt: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of channel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub delivered: u64,
    pub retries: u64,
    pub corrupt: u64,
    pub failed: u64,
}

/// Reliable point-to-point channel from one training node to the remote node
pub struct TransferChannel {
    node_id: NodeId,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    /// Serializes transfers so at most one is in flight
    gate: Mutex<()>,
    counters: ChannelCounters,
}

impl TransferChannel {
    pub fn new(
        node_id: NodeId,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            transport,
            policy,
            attempt_timeout,
            gate: Mutex::new(()),
            counters: ChannelCounters::default(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Deliver a record, retrying transient failures with backoff
    ///
    /// Checksum rejections are retried like transport errors, but without
    /// backoff. Returns
    /// `TransferFailed` once the attempt budget is spent or a
    /// non-retryable error occurs.
    #[instrument(skip(self, record), fields(node_id = self.node_id, sequence = record.sequence, epoch = record.epoch))]
    pub async fn send(&self, record: &SnapshotRecord) -> Result<Ack> {
        let _gate = self.gate.lock().await;
        let mut session = TransferSession::new(self.node_id, record.sequence);
        let max_attempts = self.policy.max_attempts();

        debug!(
            session = %session.id,
            size_bytes = record.payload.len(),
            endpoint = %self.transport.endpoint(),
            "Starting transfer"
        );

        loop {
            session.attempts += 1;

            let outcome = match tokio::time::timeout(
                self.attempt_timeout,
                self.transport.deliver(record),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    operation: format!("deliver sequence {}", record.sequence),
                    timeout_ms: self.attempt_timeout.as_millis() as u64,
                }),
            };

            let error = match outcome {
                Ok(ack) if ack.node_id == record.node_id && ack.sequence == record.sequence => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    info!(
                        session = %session.id,
                        attempts = session.attempts,
                        elapsed_ms = session.started.elapsed().as_millis() as u64,
                        "Snapshot acknowledged"
                    );
                    return Ok(ack);
                }
                Ok(ack) => Error::Protocol {
                    message: format!(
                        "acknowledgment for node {} sequence {} does not match the request",
                        ack.node_id, ack.sequence
                    ),
                },
                Err(e) => e,
            };

            if matches!(error, Error::Corrupt { .. }) {
                self.counters.corrupt.fetch_add(1, Ordering::Relaxed);
            }

            if !error.is_retryable() {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(session = %session.id, error = %error, "Transfer failed permanently");
                return Err(session.failed(error.to_string()));
            }

            if session.attempts >= max_attempts {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session = %session.id,
                    attempts = session.attempts,
                    error = %error,
                    "Transfer retry budget exhausted"
                );
                return Err(session.failed(error.to_string()));
            }

            let delay = self.policy.delay_after(session.attempts, &error);
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                session = %session.id,
                attempt = session.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transfer attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            corrupt: self.counters.corrupt.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
