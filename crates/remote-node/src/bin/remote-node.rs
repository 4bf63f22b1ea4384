//! Remote node binary entry point
//!
//! Serves checkpoint snapshots for a training job until Ctrl+C or SIGTERM.
//! Usage: `remote-node [config.json]`

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remote_node::{shutdown_signal, RemoteNodeService};
use runtime_core::RuntimeConfig;
use storage::LocalDirStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "remote_node=info,checkpoint=info,transfer=info,runtime_core=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            tracing::info!(path = %path, "Loading configuration");
            RuntimeConfig::from_json_file(&path)?
        }
        None => RuntimeConfig::default(),
    };

    let store = Arc::new(LocalDirStore::new(&config.storage.base_path));
    let service = RemoteNodeService::start(&config, store).await?;
    tracing::info!(
        address = %service.local_addr(),
        retain_per_node = config.remote.retain_per_node,
        "Remote node ready"
    );

    shutdown_signal().await;
    service.stop().await?;

    Ok(())
}
