//! gRPC transport and remote query client

use std::time::Duration;

use async_trait::async_trait;
use runtime_core::{Ack, Error, NodeCatalog, NodeId, Result, Sequence, SnapshotRecord};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, instrument};

use crate::proto::snapshots_client::SnapshotsClient;
use crate::proto::{self, CatalogRequest, FetchRequest};
use crate::transport::{RemoteView, Transport};
use crate::wire::{put_outcome, status_to_error};

/// Lazily connected channel to a remote node
///
/// The channel reconnects on its own after the remote goes away.
fn connect(
    addr: &str,
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
    max_message_size: usize,
) -> Result<SnapshotsClient<Channel>> {
    let mut endpoint = Endpoint::from_shared(format!("http://{}", addr))
        .map_err(|e| Error::InvalidConfig {
            message: format!("invalid remote address {}: {}", addr, e),
        })?
        .connect_timeout(connect_timeout)
        .tcp_nodelay(true);
    if let Some(timeout) = request_timeout {
        endpoint = endpoint.timeout(timeout);
    }

    debug!(addr, "Remote node channel created");
    Ok(SnapshotsClient::new(endpoint.connect_lazy())
        .max_decoding_message_size(max_message_size)
        .max_encoding_message_size(max_message_size))
}

/// Delivers snapshot records to a remote node over gRPC
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    addr: String,
    client: SnapshotsClient<Channel>,
}

impl GrpcTransport {
    /// Per-attempt deadlines come from the
    /// [`TransferChannel`](crate::TransferChannel), not the channel.
    pub fn new(
        addr: impl Into<String>,
        connect_timeout: Duration,
        max_message_size: usize,
    ) -> Result<Self> {
        let addr = addr.into();
        let client = connect(&addr, connect_timeout, None, max_message_size)?;
        Ok(Self { addr, client })
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    #[instrument(skip(self, record), fields(addr = %self.addr, sequence = record.sequence))]
    async fn deliver(&self, record: &SnapshotRecord) -> Result<Ack> {
        let reply = self
            .client
            .clone()
            .put(proto::SnapshotRecord::from(record))
            .await
            .map_err(|status| status_to_error(status, "put", 0))?;
        put_outcome(reply.into_inner())
    }

    fn endpoint(&self) -> String {
        format!("grpc://{}", self.addr)
    }
}

/// Catalog and fetch queries against a remote node
#[derive(Debug, Clone)]
pub struct GrpcRemoteClient {
    addr: String,
    client: SnapshotsClient<Channel>,
    request_timeout: Duration,
}

impl GrpcRemoteClient {
    pub fn new(
        addr: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
        max_message_size: usize,
    ) -> Result<Self> {
        let addr = addr.into();
        let client = connect(&addr, connect_timeout, Some(request_timeout), max_message_size)?;
        Ok(Self {
            addr,
            client,
            request_timeout,
        })
    }

    fn failed(&self, status: tonic::Status, operation: &str) -> Error {
        let operation = format!("{} request to {}", operation, self.addr);
        status_to_error(status, &operation, self.request_timeout.as_millis() as u64)
    }
}

#[async_trait]
impl RemoteView for GrpcRemoteClient {
    async fn catalog(&self) -> Result<Vec<NodeCatalog>> {
        let reply = self
            .client
            .clone()
            .catalog(CatalogRequest {})
            .await
            .map_err(|status| self.failed(status, "catalog"))?;
        Ok(reply.into_inner().nodes.into_iter().map(Into::into).collect())
    }

    async fn fetch(
        &self,
        node_id: NodeId,
        sequence: Option<Sequence>,
    ) -> Result<Option<SnapshotRecord>> {
        let reply = self
            .client
            .clone()
            .fetch(FetchRequest { node_id, sequence })
            .await
            .map_err(|status| self.failed(status, "fetch"))?;
        Ok(reply.into_inner().record.map(Into::into))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::snapshots_server::{Snapshots, SnapshotsServer};
    use crate::proto::{put_reply, CatalogReply, FetchReply, PutReply};
    use bytes::Bytes;
    use runtime_core::{Nack, NackReason};
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::transport::Server;
    use tonic::{Request, Response, Status};

    type PutScript = fn(proto::SnapshotRecord) -> std::result::Result<PutReply, Status>;

    /// Answers every put with a scripted reply and fetches with a fixed record
    struct ScriptedRemote {
        put: PutScript,
        fetched: Option<proto::SnapshotRecord>,
    }

    #[tonic::async_trait]
    impl Snapshots for ScriptedRemote {
        async fn put(
            &self,
            request: Request<proto::SnapshotRecord>,
        ) -> std::result::Result<Response<PutReply>, Status> {
            (self.put)(request.into_inner()).map(Response::new)
        }

        async fn catalog(
            &self,
            _request: Request<CatalogRequest>,
        ) -> std::result::Result<Response<CatalogReply>, Status> {
            Ok(Response::new(CatalogReply { nodes: Vec::new() }))
        }

        async fn fetch(
            &self,
            _request: Request<FetchRequest>,
        ) -> std::result::Result<Response<FetchReply>, Status> {
            Ok(Response::new(FetchReply {
                record: self.fetched.clone(),
            }))
        }
    }

    async fn serve_limited(remote: ScriptedRemote, max_message_size: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let service = SnapshotsServer::new(remote).max_decoding_message_size(max_message_size);
        tokio::spawn(
            Server::builder()
                .add_service(service)
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );
        addr
    }

    async fn serve(remote: ScriptedRemote) -> String {
        serve_limited(remote, 1 << 20).await
    }

    fn acking() -> ScriptedRemote {
        ScriptedRemote {
            put: |record| {
                Ok(PutReply {
                    outcome: Some(put_reply::Outcome::Ack(proto::Ack {
                        node_id: record.node_id,
                        sequence: record.sequence,
                    })),
                })
            },
            fetched: None,
        }
    }

    #[tokio::test]
    async fn test_put_is_acknowledged() {
        let addr = serve(acking()).await;
        let transport = GrpcTransport::new(addr, Duration::from_secs(2), 1 << 20).unwrap();

        let record = SnapshotRecord::new(3, 1, 1, Bytes::from_static(b"weights"));
        let ack = transport.deliver(&record).await.unwrap();
        assert_eq!(ack, Ack { node_id: 3, sequence: 1 });

        let record = SnapshotRecord::new(3, 2, 2, Bytes::from_static(b"weights"));
        assert_eq!(transport.deliver(&record).await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_corrupt_nack_maps_to_corrupt() {
        let addr = serve(ScriptedRemote {
            put: |record| {
                let nack = Nack {
                    node_id: record.node_id,
                    sequence: record.sequence,
                    reason: NackReason::Corrupt {
                        expected: record.checksum,
                        computed: 0,
                    },
                };
                Ok(PutReply {
                    outcome: Some(put_reply::Outcome::Nack(nack.into())),
                })
            },
            fetched: None,
        })
        .await;

        let transport = GrpcTransport::new(addr, Duration::from_secs(2), 1 << 20).unwrap();
        let record = SnapshotRecord::new(0, 4, 1, Bytes::from_static(b"x"));

        let err = transport.deliver(&record).await.unwrap_err();
        assert!(matches!(err, Error::Corrupt { sequence: 4, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_is_transient() {
        let port = portpicker::pick_unused_port().unwrap();
        let transport = GrpcTransport::new(
            format!("127.0.0.1:{}", port),
            Duration::from_secs(1),
            1 << 20,
        )
        .unwrap();
        let record = SnapshotRecord::new(0, 1, 1, Bytes::new());

        let err = transport.deliver(&record).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    async fn test_oversized_record_is_refused() {
        let addr = serve_limited(acking(), 1024).await;
        let transport = GrpcTransport::new(addr, Duration::from_secs(1), 1 << 20).unwrap();

        let record = SnapshotRecord::new(0, 1, 1, Bytes::from(vec![0u8; 4096]));
        let err = transport.deliver(&record).await.unwrap_err();
        assert!(!err.is_retryable(), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    async fn test_fetch_keeps_remote_checksum() {
        let mut tampered = SnapshotRecord::new(2, 7, 3, Bytes::from_static(b"moments"));
        tampered.checksum ^= 0xFF;

        let addr = serve(ScriptedRemote {
            fetched: Some(proto::SnapshotRecord::from(&tampered)),
            ..acking()
        })
        .await;
        let client =
            GrpcRemoteClient::new(addr, Duration::from_secs(1), Duration::from_secs(1), 1 << 20)
                .unwrap();

        let fetched = client.fetch(2, Some(7)).await.unwrap().unwrap();
        assert_eq!(fetched, tampered);
        assert!(fetched.verify().is_err());
        assert!(client.catalog().await.unwrap().is_empty());
    }

    #[test]
    fn test_invalid_address_rejected() {
        let err = GrpcTransport::new("not an address", Duration::from_secs(1), 1024).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}
