//! Transfer - Moves checkpoint snapshots from training nodes to remote nodes
//!
//! Provides:
//! - [`TransferChannel`]: ordered delivery with bounded exponential backoff
//! - [`Transport`] implementations for in-process and gRPC delivery
//! - The `Snapshots` gRPC service definition shared with the remote node
//! - [`GrpcRemoteClient`] for catalog and fetch queries during recovery

pub mod channel;
pub mod grpc;
pub mod retry;
pub mod transport;
pub mod wire;

// Generated protobuf types and the Snapshots client/server stubs
pub mod proto {
    tonic::include_proto!("transfer");
}

pub use channel::{ChannelStats, TransferChannel};
pub use grpc::{GrpcRemoteClient, GrpcTransport};
pub use retry::RetryPolicy;
pub use transport::{LoopbackTransport, RecordSink, RemoteView, Transport};
