//! Owned Tokio runtime for synchronous callers

use crate::{Error, Result, RuntimeConfig};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::broadcast;
use tracing::info;

/// Shutdown signal sender
pub type ShutdownSender = broadcast::Sender<()>;

/// Shutdown signal receiver
pub type ShutdownReceiver = broadcast::Receiver<()>;

/// Runtime manager owning the async machinery behind a blocking API
pub struct RuntimeManager {
    /// Tokio runtime
    runtime: Option<Runtime>,

    /// Shutdown signal sender
    shutdown_tx: ShutdownSender,

    /// Grace period for background tasks on drop
    shutdown_timeout: Duration,
}

impl RuntimeManager {
    /// Create a new runtime manager
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        Self::with_threads(config.io_threads)
    }

    /// Create a runtime manager with an explicit I/O thread count
    pub fn with_threads(io_threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(io_threads.max(1))
            .enable_all()
            .thread_name("ckpt-io")
            .build()
            .map_err(|e| Error::Internal {
                message: format!("Failed to build Tokio runtime: {}", e),
            })?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            runtime: Some(runtime),
            shutdown_tx,
            shutdown_timeout: Duration::from_secs(5),
        })
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime.as_ref().ok_or_else(|| Error::Shutdown {
            component: "runtime manager".to_string(),
        })
    }

    /// Get the runtime handle for spawning tasks
    pub fn handle(&self) -> Result<tokio::runtime::Handle> {
        Ok(self.runtime()?.handle().clone())
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> ShutdownReceiver {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown to all components
    pub fn shutdown(&self) {
        info!("Initiating runtime shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Block on a future until completion
    pub fn block_on<F: std::future::Future>(&self, future: F) -> Result<F::Output> {
        Ok(self.runtime()?.block_on(future))
    }

    /// Spawn a task on the runtime
    pub fn spawn<F>(&self, future: F) -> Result<tokio::task::JoinHandle<F::Output>>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Ok(self.runtime()?.spawn(future))
    }
}

impl Drop for RuntimeManager {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            let _ = self.shutdown_tx.send(());

            // Give in-flight transfers time to finish
            runtime.shutdown_timeout(self.shutdown_timeout);
            info!("Runtime manager shut down");
        }
    }
}

/// Builder for RuntimeManager
pub struct RuntimeManagerBuilder {
    io_threads: usize,
    shutdown_timeout: Duration,
}

impl RuntimeManagerBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            io_threads: RuntimeConfig::default().io_threads,
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Set I/O thread count
    pub fn io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads;
        self
    }

    /// Set how long drop waits for background tasks
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Build the runtime manager
    pub fn build(self) -> Result<RuntimeManager> {
        let mut manager = RuntimeManager::with_threads(self.io_threads)?;
        manager.shutdown_timeout = self.shutdown_timeout;
        Ok(manager)
    }
}

impl Default for RuntimeManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_task() {
        let manager = RuntimeManagerBuilder::new().io_threads(2).build().unwrap();

        let result = manager
            .block_on(async {
                let handle = tokio::spawn(async { 42 });
                handle.await.unwrap()
            })
            .unwrap();

        assert_eq!(result, 42);
    }

    #[test]
    fn test_shutdown_signal_reaches_subscribers() {
        let manager = RuntimeManager::new(&RuntimeConfig::default()).unwrap();
        let mut rx = manager.shutdown_receiver();

        manager.shutdown();

        let received = manager.block_on(async move { rx.recv().await.is_ok() }).unwrap();
        assert!(received);
    }
}
