use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use checkpoint::{SnapshotSerializer, TrainNode, TrainNodeConfig};
use remote_node::{decode_checkpoint, RemoteNodeService};
use runtime_core::{Ack, Error, PayloadLocation, PersistMode, RuntimeConfig, SnapshotRecord};
use session::{load_persisted, RecoveryCoordinator, RecoveryOutcome};
use storage::{DurableStore, LocalDirStore, MemoryStore};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::info;
use transfer::{GrpcRemoteClient, GrpcTransport, RemoteView, RetryPolicy, TransferChannel, Transport};

mod common;

const MAX_MESSAGE: usize = 64 * 1024 * 1024;

async fn start_remote(config: &RuntimeConfig, store: Arc<dyn DurableStore>) -> Result<RemoteNodeService> {
    common::init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(RemoteNodeService::start_on(config, listener, store)?)
}

fn grpc_transport(service: &RemoteNodeService) -> Arc<GrpcTransport> {
    let transport = GrpcTransport::new(
        service.local_addr().to_string(),
        Duration::from_secs(2),
        MAX_MESSAGE,
    );
    Arc::new(transport.expect("valid remote address"))
}

fn grpc_client(service: &RemoteNodeService) -> Arc<GrpcRemoteClient> {
    let client = GrpcRemoteClient::new(
        service.local_addr().to_string(),
        Duration::from_secs(2),
        Duration::from_secs(5),
        MAX_MESSAGE,
    );
    Arc::new(client.expect("valid remote address"))
}

fn train_node(node_id: u32, depth: usize, transport: Arc<dyn Transport>, policy: RetryPolicy) -> TrainNode {
    common::init_tracing();
    let mut config = TrainNodeConfig::from_runtime(node_id, &RuntimeConfig::default());
    config.depth = depth;
    let channel = TransferChannel::new(node_id, transport, policy, Duration::from_secs(5));
    TrainNode::spawn(config, channel).unwrap()
}

/// Holds every delivery until a permit is released
struct GatedTransport {
    inner: Arc<GrpcTransport>,
    gate: Semaphore,
}

#[async_trait]
impl Transport for GatedTransport {
    async fn deliver(&self, record: &SnapshotRecord) -> runtime_core::Result<Ack> {
        let _permit = self.gate.acquire().await.map_err(|_| Error::ChannelClosed {
            channel: "gate".to_string(),
        })?;
        self.inner.deliver(record).await
    }

    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }
}

/// Damages the first record it sends
struct CorruptOnce {
    inner: Arc<GrpcTransport>,
    done: AtomicBool,
}

#[async_trait]
impl Transport for CorruptOnce {
    async fn deliver(&self, record: &SnapshotRecord) -> runtime_core::Result<Ack> {
        if !self.done.swap(true, Ordering::SeqCst) {
            let mut damaged = record.clone();
            damaged.checksum ^= 0xdead_beef;
            return self.inner.deliver(&damaged).await;
        }
        self.inner.deliver(record).await
    }

    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }
}

/// Fails every delivery while `down` is set
struct FlakyLink {
    inner: Arc<GrpcTransport>,
    down: AtomicBool,
}

#[async_trait]
impl Transport for FlakyLink {
    async fn deliver(&self, record: &SnapshotRecord) -> runtime_core::Result<Ack> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Transport {
                message: "link down".to_string(),
            });
        }
        self.inner.deliver(record).await
    }

    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }
}

#[tokio::test]
async fn test_snapshots_acked_over_grpc() -> Result<()> {
    let service = start_remote(&RuntimeConfig::default(), Arc::new(MemoryStore::new())).await?;
    let node = train_node(0, 2, grpc_transport(&service), RetryPolicy::immediate(2));

    for epoch in 1..=4u32 {
        node.save(epoch, &vec![epoch as f32; 256]).await?;
        node.wait_copy_complete().await?;
    }
    node.wait_all_copies().await?;

    assert_eq!(node.acknowledged(), Some(4));
    assert_eq!(node.dirty_count(), 0);
    let entry = service.node().ledger().get(0).unwrap();
    assert_eq!(entry.high_water, 4);
    assert_eq!(entry.epoch, 4);

    node.shutdown().await?;
    service.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_third_save_waits_for_a_free_slot() -> Result<()> {
    let service = start_remote(&RuntimeConfig::default(), Arc::new(MemoryStore::new())).await?;
    let gated = Arc::new(GatedTransport {
        inner: grpc_transport(&service),
        gate: Semaphore::new(0),
    });
    let node = train_node(0, 2, gated.clone(), RetryPolicy::immediate(0));

    node.save_payload(1, Bytes::from_static(b"one")).await?;
    node.save_payload(2, Bytes::from_static(b"two")).await?;

    // Both slots hold unacknowledged copies
    let third = timeout(Duration::from_millis(200), node.save_payload(3, Bytes::from_static(b"three"))).await;
    assert!(third.is_err());
    assert_eq!(node.dirty_count(), 2);

    gated.gate.add_permits(16);
    let sequence = timeout(Duration::from_secs(5), node.save_payload(3, Bytes::from_static(b"three"))).await??;
    assert_eq!(sequence, 3);
    node.wait_all_copies().await?;
    assert_eq!(service.node().latest(0).unwrap().payload, Bytes::from_static(b"three"));

    node.shutdown().await?;
    service.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_remote_reports_unavailable_copy() -> Result<()> {
    let port = portpicker::pick_unused_port().expect("No ports free");
    let transport = Arc::new(GrpcTransport::new(
        format!("127.0.0.1:{}", port),
        Duration::from_millis(200),
        MAX_MESSAGE,
    )?);
    let node = train_node(0, 2, transport, RetryPolicy::immediate(2));

    node.save_payload(1, Bytes::from_static(b"one")).await?;
    node.save_payload(2, Bytes::from_static(b"two")).await?;

    let err = node.wait_copy_complete().await.unwrap_err();
    assert!(matches!(err, Error::CheckpointUnavailable { sequence: 1, .. }));
    assert_eq!(node.acknowledged(), None);
    Ok(())
}

#[tokio::test]
async fn test_remote_never_holds_a_gap_after_outage() -> Result<()> {
    let service = start_remote(&RuntimeConfig::default(), Arc::new(MemoryStore::new())).await?;
    let link = Arc::new(FlakyLink {
        inner: grpc_transport(&service),
        down: AtomicBool::new(true),
    });
    let node = train_node(0, 4, link.clone(), RetryPolicy::immediate(1));

    node.save_payload(1, Bytes::from_static(b"one")).await?;
    assert!(node.wait_all_copies().await.is_err());

    info!("Link restored");
    link.down.store(false, Ordering::SeqCst);
    node.save_payload(2, Bytes::from_static(b"two")).await?;
    let err = node.wait_all_copies().await.unwrap_err();
    assert!(matches!(err, Error::CheckpointUnavailable { sequence: 2, .. }));

    // Sequence 2 was held back instead of landing above the missing 1
    assert!(service.node().latest(0).is_none());

    assert_eq!(node.retry_failed().await?, 2);
    node.wait_all_copies().await?;

    let catalog = grpc_client(&service).catalog().await?;
    let sequences: Vec<u64> = catalog[0].snapshots.iter().map(|s| s.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
    assert_eq!(catalog[0].high_water, 2);

    node.shutdown().await?;
    service.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_corrupt_delivery_is_retried() -> Result<()> {
    let service = start_remote(&RuntimeConfig::default(), Arc::new(MemoryStore::new())).await?;
    let transport = Arc::new(CorruptOnce {
        inner: grpc_transport(&service),
        done: AtomicBool::new(false),
    });
    let node = train_node(3, 2, transport, RetryPolicy::immediate(3));

    node.save_payload(1, Bytes::from_static(b"weights")).await?;
    node.wait_all_copies().await?;

    let stats = node.channel_stats();
    assert_eq!(stats.corrupt, 1);
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.delivered, 1);

    let stored = service.node().latest(3).unwrap();
    stored.verify()?;
    assert_eq!(stored.payload, Bytes::from_static(b"weights"));

    node.shutdown().await?;
    service.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_recovery_restores_min_common_epoch() -> Result<()> {
    let mut config = RuntimeConfig::default();
    config.remote.retain_per_node = 8;
    let service = start_remote(&config, Arc::new(MemoryStore::new())).await?;

    let serializer = SnapshotSerializer::default();
    let fast = train_node(0, 2, grpc_transport(&service), RetryPolicy::immediate(2));
    let slow = train_node(1, 2, grpc_transport(&service), RetryPolicy::immediate(2));

    for epoch in 1..=7u32 {
        fast.save(epoch, &(epoch, format!("fast-{}", epoch))).await?;
        fast.wait_copy_complete().await?;
    }
    for epoch in 1..=5u32 {
        slow.save(epoch, &(epoch, format!("slow-{}", epoch))).await?;
        slow.wait_copy_complete().await?;
    }
    fast.wait_all_copies().await?;
    slow.wait_all_copies().await?;

    let views: Vec<Arc<dyn RemoteView>> = vec![grpc_client(&service)];
    let outcome = RecoveryCoordinator::new(views, vec![0, 1]).recover().await?;
    let RecoveryOutcome::Restore(checkpoint) = outcome else {
        panic!("expected a restore point");
    };
    assert_eq!(checkpoint.epoch, 5);

    let restored: (u32, String) = serializer.deserialize(checkpoint.payload_for(0).unwrap())?;
    assert_eq!(restored, (5, "fast-5".to_string()));
    let expected = serializer.serialize(&(5u32, "slow-5".to_string()))?;
    assert_eq!(checkpoint.payload_for(1).unwrap(), &expected);

    fast.shutdown().await?;
    slow.shutdown().await?;
    service.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_recovery_starts_fresh_on_empty_remote() -> Result<()> {
    let service = start_remote(&RuntimeConfig::default(), Arc::new(MemoryStore::new())).await?;
    let views: Vec<Arc<dyn RemoteView>> = vec![grpc_client(&service)];

    let outcome = RecoveryCoordinator::new(views, vec![0, 1]).recover().await?;
    assert!(matches!(outcome, RecoveryOutcome::Fresh));

    service.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_persisted_checkpoint_survives_remote_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn DurableStore> = Arc::new(LocalDirStore::new(dir.path()));
    let mut config = RuntimeConfig::default();
    config.remote.persist = PersistMode::PerNode;
    config.snapshot.naming.model_name = "resnet".to_string();

    let service = start_remote(&config, store.clone()).await?;
    let remote = service.node().clone();
    let node = train_node(2, 2, grpc_transport(&service), RetryPolicy::immediate(2));

    let weights: Vec<f64> = (0..512).map(|i| i as f64 * 0.25).collect();
    for epoch in 1..=3u32 {
        node.save(epoch, &weights).await?;
    }
    node.shutdown().await?;
    service.stop().await?;

    // Persistence finished once the service stopped
    let entry = remote.ledger().get(2).unwrap();
    assert_eq!(entry.location, PayloadLocation::Persisted { path: "resnet_n2.ckpt".to_string() });

    let reopened = LocalDirStore::new(dir.path());
    let checkpoint = load_persisted(&reopened, "resnet_n2.ckpt").await?;
    assert_eq!(checkpoint.epoch, 3);
    let restored: Vec<f64> = SnapshotSerializer::default().deserialize(&checkpoint.payload)?;
    assert_eq!(restored, weights);

    let raw = reopened.get("resnet_n2.ckpt").await?;
    assert_eq!(decode_checkpoint(&raw)?.payload, checkpoint.payload);
    Ok(())
}
