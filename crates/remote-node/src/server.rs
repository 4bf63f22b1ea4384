//! gRPC server with graceful shutdown
//!
//! Puts are answered in the order a training node sends them; each
//! node's transfer channel has at most one put in flight.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use runtime_core::{Error, Nack, NackReason, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info};
use transfer::proto::snapshots_server::{Snapshots, SnapshotsServer};
use transfer::proto::{
    put_reply, CatalogReply, CatalogRequest, FetchReply, FetchRequest, PutReply,
};

use crate::node::RemoteNode;

/// `Snapshots` service backed by a [`RemoteNode`]
pub struct SnapshotService {
    node: Arc<RemoteNode>,
}

impl SnapshotService {
    pub fn new(node: Arc<RemoteNode>) -> Self {
        Self { node }
    }
}

#[tonic::async_trait]
impl Snapshots for SnapshotService {
    async fn put(
        &self,
        request: Request<transfer::proto::SnapshotRecord>,
    ) -> std::result::Result<Response<PutReply>, Status> {
        let record = runtime_core::SnapshotRecord::from(request.into_inner());
        let (node_id, sequence) = (record.node_id, record.sequence);

        let outcome = match self.node.receive(record) {
            Ok(ack) => put_reply::Outcome::Ack(ack.into()),
            Err(Error::Corrupt {
                expected, computed, ..
            }) => put_reply::Outcome::Nack(
                Nack {
                    node_id,
                    sequence,
                    reason: NackReason::Corrupt { expected, computed },
                }
                .into(),
            ),
            Err(e) => put_reply::Outcome::Nack(
                Nack {
                    node_id,
                    sequence,
                    reason: NackReason::Rejected {
                        message: e.to_string(),
                    },
                }
                .into(),
            ),
        };
        Ok(Response::new(PutReply {
            outcome: Some(outcome),
        }))
    }

    async fn catalog(
        &self,
        _request: Request<CatalogRequest>,
    ) -> std::result::Result<Response<CatalogReply>, Status> {
        let nodes = self.node.node_catalogs().into_iter().map(Into::into).collect();
        Ok(Response::new(CatalogReply { nodes }))
    }

    async fn fetch(
        &self,
        request: Request<FetchRequest>,
    ) -> std::result::Result<Response<FetchReply>, Status> {
        let request = request.into_inner();
        let record = match request.sequence {
            Some(sequence) => self.node.get(request.node_id, sequence),
            None => self.node.latest(request.node_id),
        };
        debug!(node_id = request.node_id, found = record.is_some(), "Fetch served");
        Ok(Response::new(FetchReply {
            record: record.as_ref().map(Into::into),
        }))
    }
}

/// Serves a [`RemoteNode`] over gRPC
pub struct RemoteServer {
    node: Arc<RemoteNode>,
    max_message_size: usize,
}

impl RemoteServer {
    pub fn new(node: Arc<RemoteNode>, max_message_size: usize) -> Self {
        Self {
            node,
            max_message_size,
        }
    }

    fn service(&self) -> SnapshotsServer<SnapshotService> {
        SnapshotsServer::new(SnapshotService::new(self.node.clone()))
            .max_decoding_message_size(self.max_message_size)
            .max_encoding_message_size(self.max_message_size)
    }

    /// Serve on `listener` until `shutdown` resolves
    ///
    /// In-flight calls finish before this returns.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        info!(address = %addr, "Remote node listening");

        Server::builder()
            .add_service(self.service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await
            .map_err(|e| {
                error!(error = %e, "Server error");
                Error::Transport {
                    message: format!("remote node server on {} failed: {}", addr, e),
                }
            })?;

        info!(address = %addr, "Remote node stopped serving");
        Ok(())
    }

    /// Serve until Ctrl+C or SIGTERM
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        info!(address = %addr, "Remote node listening");

        Server::builder()
            .add_service(self.service())
            .serve_with_shutdown(addr, shutdown_signal())
            .await
            .map_err(|e| {
                error!(error = %e, "Server error");
                Error::Transport {
                    message: format!("remote node server on {} failed: {}", addr, e),
                }
            })?;

        info!("Remote node shutdown complete");
        Ok(())
    }
}

/// Wait for Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
