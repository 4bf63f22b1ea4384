//! Remote node assembled from a runtime configuration

use std::net::SocketAddr;
use std::sync::Arc;

use runtime_core::{Error, PersistMode, Result, RuntimeConfig};
use storage::DurableStore;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::ledger::RemoteLedger;
use crate::node::{RemoteNode, RemoteNodeConfig};
use crate::persist::{PersistConfig, Persister};
use crate::server::RemoteServer;

/// A running remote node: agent, gRPC server and optional persister
pub struct RemoteNodeService {
    node: Arc<RemoteNode>,
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<Result<()>>>,
    persister: Option<JoinHandle<()>>,
}

impl RemoteNodeService {
    /// Bind the configured address and start serving
    ///
    /// `store` receives persisted checkpoints when `remote.persist` is not
    /// `Disabled`.
    pub async fn start(config: &RuntimeConfig, store: Arc<dyn DurableStore>) -> Result<Self> {
        let listener = TcpListener::bind(config.remote_address())
            .await
            .map_err(|e| Error::Transport {
                message: format!("Failed to bind {}: {}", config.remote_address(), e),
            })?;
        Self::start_on(config, listener, store)
    }

    /// Start serving on an already bound listener
    pub fn start_on(
        config: &RuntimeConfig,
        listener: TcpListener,
        store: Arc<dyn DurableStore>,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let node_config = RemoteNodeConfig {
            retain_per_node: config.remote.retain_per_node,
        };

        let (node, persister) = match config.remote.persist {
            PersistMode::Disabled => (RemoteNode::new(node_config), None),
            mode => {
                let ledger = Arc::new(RemoteLedger::new());
                let persister = Persister::new(
                    PersistConfig {
                        mode,
                        naming: config.snapshot.naming.clone(),
                        keep_count: config.remote.keep_count,
                    },
                    store,
                    ledger.clone(),
                );
                let (queue, handle) = persister.spawn();
                (
                    RemoteNode::with_persistence(node_config, ledger, queue),
                    Some(handle),
                )
            }
        };
        let node = Arc::new(node);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = RemoteServer::new(node.clone(), config.network.max_message_size);
        let server = tokio::spawn(server.serve_with_shutdown(listener, async {
            let _ = shutdown_rx.await;
        }));

        info!(address = %local_addr, persist = ?config.remote.persist, "Remote node service started");

        Ok(Self {
            node,
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            server: Some(server),
            persister,
        })
    }

    pub fn node(&self) -> &Arc<RemoteNode> {
        &self.node
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop serving and wait for the server task
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            match server.await {
                Ok(result) => result?,
                Err(e) => warn!(error = %e, "Remote server task failed"),
            }
        }
        if let Some(persister) = self.persister.take() {
            self.node.stop_persisting();
            if let Err(e) = persister.await {
                warn!(error = %e, "Persister task failed");
            }
        }
        info!(address = %self.local_addr, "Remote node service stopped");
        Ok(())
    }
}

impl Drop for RemoteNodeService {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
