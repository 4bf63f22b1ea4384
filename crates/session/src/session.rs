//! One process's checkpointing session
//!
//! `Session::init` reads the process's role from its [`Communicator`]:
//! the highest rank runs the remote node, every other rank runs a
//! training node agent that ships snapshots to it.

use std::net::SocketAddr;
use std::sync::Arc;

use checkpoint::{SaveSchedule, Snapshot, SnapshotSerializer, TrainNode, TrainNodeConfig};
use remote_node::{PersistedCheckpoint, RemoteNode, RemoteNodeService};
use runtime_core::{
    Epoch, Error, NodeId, PersistMode, Result, RuntimeConfig, Sequence,
};
use storage::{DurableStore, LocalDirStore};
use tracing::{debug, info, warn};
use transfer::{
    GrpcRemoteClient, GrpcTransport, RemoteView, RetryPolicy, TransferChannel, Transport,
};

use crate::communicator::Communicator;
use crate::recovery::{load_persisted, RecoveryCoordinator, RecoveryOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Train,
    Remote,
}

/// Checkpointing state owned by one process
pub struct Session {
    communicator: Communicator,
    config: RuntimeConfig,
    schedule: SaveSchedule,
    serializer: SnapshotSerializer,
    store: Arc<dyn DurableStore>,
    views: Vec<Arc<dyn RemoteView>>,
    expected: Vec<NodeId>,
    train_node: Option<TrainNode>,
    remote: Option<RemoteNodeService>,
}

impl Session {
    /// Start the remote node or connect a training node, by rank
    pub async fn init(config: RuntimeConfig, communicator: Communicator) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn DurableStore> = Arc::new(LocalDirStore::new(&config.storage.base_path));

        if communicator.is_remote() {
            let service = RemoteNodeService::start(&config, store.clone()).await?;
            let view: Arc<dyn RemoteView> = service.node().clone();
            let expected = expected_nodes(&config, &communicator);

            info!(
                rank = communicator.rank,
                address = %service.local_addr(),
                "Session started as remote node"
            );
            return Ok(Self {
                schedule: SaveSchedule::from(&config.schedule),
                serializer: SnapshotSerializer::new(config.snapshot.format),
                communicator,
                config,
                store,
                views: vec![view],
                expected,
                train_node: None,
                remote: Some(service),
            });
        }

        let network = &config.network;
        let transport = Arc::new(GrpcTransport::new(
            communicator.remote_addr.clone(),
            network.connect_timeout,
            network.max_message_size,
        )?);
        let view = Arc::new(GrpcRemoteClient::new(
            communicator.remote_addr.clone(),
            network.connect_timeout,
            network.request_timeout,
            network.max_message_size,
        )?);
        Self::with_transport(config, communicator, transport, view, store).await
    }

    /// Start a training node session over the given transport
    ///
    /// `view` answers the catalog query that picks the first sequence, so a
    /// restarted node continues above what the remote already holds.
    pub async fn with_transport(
        config: RuntimeConfig,
        communicator: Communicator,
        transport: Arc<dyn Transport>,
        view: Arc<dyn RemoteView>,
        store: Arc<dyn DurableStore>,
    ) -> Result<Self> {
        config.validate()?;
        if communicator.is_remote() {
            return Err(Error::InvalidConfig {
                message: format!("rank {} is the remote node, not a trainer", communicator.rank),
            });
        }

        let node_id = communicator.node_id();
        let (contributes, shard) = match config.remote.persist {
            PersistMode::Joined { shard_count } => {
                let shard = communicator.shard_spec(shard_count)?;
                (shard.is_some(), shard)
            }
            _ => (true, None),
        };

        let policy = RetryPolicy::from(&config.transfer.retry);
        let train_node = if contributes {
            let first_sequence = resume_sequence(view.as_ref(), node_id, &policy).await?;
            let channel = TransferChannel::new(
                node_id,
                transport,
                policy,
                config.transfer.attempt_timeout,
            );
            let node_config = TrainNodeConfig {
                shard,
                first_sequence,
                ..TrainNodeConfig::from_runtime(node_id, &config)
            };
            Some(TrainNode::spawn(node_config, channel)?)
        } else {
            info!(rank = communicator.rank, "Rank contributes no shard, saves are skipped");
            None
        };

        info!(
            rank = communicator.rank,
            remote = %communicator.remote_addr,
            shard = ?shard,
            "Session started as training node"
        );

        Ok(Self {
            schedule: SaveSchedule::from(&config.schedule),
            serializer: SnapshotSerializer::new(config.snapshot.format),
            expected: expected_nodes(&config, &communicator),
            communicator,
            config,
            store,
            views: vec![view],
            train_node,
            remote: None,
        })
    }

    pub fn role(&self) -> Role {
        if self.remote.is_some() {
            Role::Remote
        } else {
            Role::Train
        }
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn schedule(&self) -> SaveSchedule {
        self.schedule
    }

    /// Training node agent, absent on the remote rank and on ranks that
    /// contribute no shard
    pub fn train_node(&self) -> Option<&TrainNode> {
        self.train_node.as_ref()
    }

    pub fn remote_node(&self) -> Option<&Arc<RemoteNode>> {
        self.remote.as_ref().map(RemoteNodeService::node)
    }

    pub fn remote_local_addr(&self) -> Option<SocketAddr> {
        self.remote.as_ref().map(RemoteNodeService::local_addr)
    }

    /// Add another remote to consult during recovery
    pub fn add_remote_view(&mut self, view: Arc<dyn RemoteView>) {
        self.views.push(view);
    }

    /// Capture `state` for `epoch`; `None` when this rank does not save
    pub async fn save<S: Snapshot>(&self, epoch: Epoch, state: &S) -> Result<Option<Sequence>> {
        match &self.train_node {
            Some(node) => node.save(epoch, state).await.map(Some),
            None => Ok(None),
        }
    }

    /// Save only when `epoch` is a scheduled save point
    pub async fn save_if_due<S: Snapshot>(
        &self,
        epoch: Epoch,
        state: &S,
    ) -> Result<Option<Sequence>> {
        if !self.schedule.should_save(epoch) {
            return Ok(None);
        }
        self.save(epoch, state).await
    }

    pub async fn wait_copy_complete(&self) -> Result<()> {
        match &self.train_node {
            Some(node) => node.wait_copy_complete().await,
            None => Ok(()),
        }
    }

    pub fn recovery_coordinator(&self) -> RecoveryCoordinator {
        RecoveryCoordinator::new(self.views.clone(), self.expected.clone())
    }

    /// Find the restore point and move the schedule past it
    pub async fn recover(&mut self) -> Result<RecoveryOutcome> {
        let outcome = self.recovery_coordinator().recover().await?;
        if let Some(epoch) = outcome.epoch() {
            self.schedule = self.schedule.resume_from(epoch);
            debug!(epoch, start_epoch = self.schedule.start_epoch, "Schedule resumed");
        }
        Ok(outcome)
    }

    /// Recover and decode this rank's training state
    ///
    /// Sharded saves are joined across contributors first. Returns `None`
    /// when there is nothing to restore.
    pub async fn restore<S: Snapshot>(&mut self) -> Result<Option<(Epoch, S)>> {
        let outcome = self.recover().await?;
        let Some(checkpoint) = outcome.checkpoint() else {
            return Ok(None);
        };

        let state = match self.config.remote.persist {
            PersistMode::Joined { .. } => self.serializer.deserialize(&checkpoint.joined())?,
            _ => {
                let node_id = self.communicator.node_id();
                let payload =
                    checkpoint
                        .payload_for(node_id)
                        .ok_or(Error::SnapshotNotFound {
                            node_id,
                            sequence: None,
                        })?;
                self.serializer.deserialize(payload)?
            }
        };
        Ok(Some((checkpoint.epoch, state)))
    }

    /// Read a checkpoint file from the durable store
    pub async fn load_persisted(&self, path: &str) -> Result<PersistedCheckpoint> {
        load_persisted(self.store.as_ref(), path).await
    }

    /// Flush outstanding snapshots and stop every component
    pub async fn destroy(mut self) -> Result<()> {
        if let Some(node) = self.train_node.take() {
            node.shutdown().await?;
        }
        if let Some(service) = self.remote.take() {
            service.stop().await?;
        }
        info!(rank = self.communicator.rank, "Session destroyed");
        Ok(())
    }
}

/// Training nodes whose snapshots make up one restore point
fn expected_nodes(config: &RuntimeConfig, communicator: &Communicator) -> Vec<NodeId> {
    match config.remote.persist {
        PersistMode::Joined { shard_count } => communicator.shard_contributors(shard_count),
        _ => communicator.training_ranks(),
    }
}

/// Sequence above the remote's high-water mark for `node_id`
async fn resume_sequence(
    view: &dyn RemoteView,
    node_id: NodeId,
    policy: &RetryPolicy,
) -> Result<Sequence> {
    let mut attempt = 0;
    loop {
        match view.catalog().await {
            Ok(catalogs) => {
                let high_water = catalogs
                    .iter()
                    .find(|catalog| catalog.node_id == node_id)
                    .map_or(0, |catalog| catalog.high_water);
                return Ok(high_water + 1);
            }
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts() => {
                let delay = policy.delay_for(attempt);
                warn!(node_id, attempt, error = %e, ?delay, "Remote node not ready, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
