//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM / SIGINT, then stops the listener and closes every
//! active pair so both sides of each tunnel see their connection end.

use std::time::{Duration, Instant};

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Upper bound for draining active pairs
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast the shutdown signal without waiting for an OS signal
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("Shutdown triggered with no subscribers");
        }
    }

    /// Start listening for shutdown signals (SIGTERM, SIGINT)
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Stop the listener and close every pair, bounded by the shutdown timeout
    pub async fn shutdown_connection_manager(
        &self,
        connection_manager: &ConnectionManager,
    ) -> Result<()> {
        let start_time = Instant::now();

        match tokio::time::timeout(self.timeout, connection_manager.shutdown()).await {
            Ok(result) => result?,
            Err(_) => warn!(
                "Connection manager did not drain within {:?}, {} connections abandoned",
                self.timeout,
                connection_manager.get_active_connections()
            ),
        }

        info!("Connection manager shut down in {:?}", start_time.elapsed());
        Ok(())
    }
}
