//! Connection Manager Implementation

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::bail;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::pairing::{PairingManager, SHUTDOWN_REASON};
use super::stream::{Connection, ConnectionRole};
use crate::config::Config;
use crate::tls::{TlsRole, TlsSessionFactory};
use crate::Result;

/// Accepts inbound connections and hands them to the pairing manager
pub struct ConnectionManager {
    listener: Option<TcpListener>,
    config: Arc<Config>,
    tls: Option<Arc<TlsSessionFactory>>,
    pairing: Arc<PairingManager>,
    connection_slots: Arc<Semaphore>,
    active_connections: Arc<AtomicUsize>,
    next_connection_id: Arc<AtomicUsize>,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionManager {
    /// Create a new ConnectionManager.
    ///
    /// `tls` is the factory for the configured connect mode, if any: a
    /// server-role factory wraps inbound connections here, a client-role one
    /// is passed on to the pairing manager for outbound connections.
    pub fn new(config: Arc<Config>, tls: Option<Arc<TlsSessionFactory>>) -> Result<Self> {
        let (front_tls, back_tls) = match tls {
            Some(factory) if factory.role() == TlsRole::Server => (Some(factory), None),
            Some(factory) => (None, Some(factory)),
            None => (None, None),
        };

        let pairing = Arc::new(PairingManager::new(&config, back_tls)?);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            listener: None,
            connection_slots: Arc::new(Semaphore::new(config.server.max_connections)),
            config,
            tls: front_tls,
            pairing,
            active_connections: Arc::new(AtomicUsize::new(0)),
            next_connection_id: Arc::new(AtomicUsize::new(1)),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        })
    }

    /// Get the pairing manager
    pub fn pairing(&self) -> &Arc<PairingManager> {
        &self.pairing
    }

    /// Bind the listening socket without accepting yet
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let bind_addr = self.config.listen_addr();

        info!("Binding TCP listener to {}", bind_addr);
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!("Successfully bound to {}", local_addr);
        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Start the connection manager and begin accepting connections
    pub async fn start(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }

        self.accept_connections().await
    }

    /// Main connection acceptance loop
    async fn accept_connections(&self) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Listener not initialized"))?;

        info!(
            "Accepting connections, relaying to {}",
            self.pairing.target()
        );
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if self.shutdown_flag.load(Ordering::Relaxed) {
                info!("Shutdown flag set, stopping connection acceptance");
                break;
            }

            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.dispatch(stream, addr),
                        Err(e) if is_fatal_accept_error(&e) => {
                            error!("Unrecoverable error accepting connections: {}", e);
                            return Err(e.into());
                        }
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    self.shutdown_flag.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }

        info!("Connection acceptance loop stopped");
        Ok(())
    }

    /// Spawn the task that owns one inbound connection
    fn dispatch(&self, stream: TcpStream, addr: SocketAddr) {
        debug!("Accepted connection from {}", addr);

        if self.shutdown_flag.load(Ordering::Relaxed) {
            debug!("Rejecting connection from {} due to shutdown", addr);
            return;
        }

        let connection_slot = match Arc::clone(&self.connection_slots).try_acquire_owned() {
            Ok(slot) => slot,
            Err(_) => {
                warn!(
                    "Connection limit ({}) reached, rejecting connection from {}",
                    self.config.server.max_connections, addr
                );
                return;
            }
        };

        let connection_id = format!(
            "conn_{}",
            self.next_connection_id.fetch_add(1, Ordering::Relaxed)
        );

        let tls = self.tls.clone();
        let pairing = Arc::clone(&self.pairing);
        let active_connections = Arc::clone(&self.active_connections);
        active_connections.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let _connection_slot = connection_slot;
            let start_time = Instant::now();

            let result =
                Self::handle_connection(stream, addr, connection_id.clone(), tls, pairing).await;
            if let Err(e) = result {
                debug!(
                    "Connection {} from {} ended with error: {:#}",
                    connection_id, addr, e
                );
            }

            info!(
                "Connection {} from {} closed after {:?}",
                connection_id,
                addr,
                start_time.elapsed()
            );
            active_connections.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Wrap the inbound socket, apply server-role TLS if configured, pair and relay it
    #[instrument(skip(stream, tls, pairing), fields(connection_id = %connection_id, addr = %addr))]
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        connection_id: String,
        tls: Option<Arc<TlsSessionFactory>>,
        pairing: Arc<PairingManager>,
    ) -> Result<()> {
        let front = Connection::new(connection_id, ConnectionRole::Front, stream)?;

        let front = match tls {
            Some(factory) => {
                let wrapped = tokio::select! {
                    biased;
                    _ = pairing.registry().closed() => {
                        bail!("Shutdown during inbound TLS handshake from {}", addr)
                    }
                    wrapped = factory.wrap(front) => wrapped,
                };
                match wrapped {
                    Ok(front) => front,
                    Err(e) => {
                        warn!("Inbound TLS handshake from {} failed: {:#}", addr, e);
                        return Err(e);
                    }
                }
            }
            None => front,
        };

        let stats = pairing.on_accepted(front).await?;
        debug!(
            "Pair {} finished: {} bytes up, {} bytes down",
            stats.pair_id, stats.bytes_up, stats.bytes_down
        );
        Ok(())
    }

    /// Get the number of active inbound connections
    pub fn get_active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Stop accepting new connections
    pub fn initiate_shutdown(&self) {
        info!("Initiating graceful shutdown of connection manager");
        self.shutdown_flag.store(true, Ordering::Relaxed);

        if let Err(e) = self.shutdown_tx.send(()) {
            debug!("No acceptance loop listening for shutdown: {}", e);
        }
    }

    /// Check if shutdown has been initiated
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Close every active pair and wait for connections to drain
    pub async fn wait_for_connections_to_close(&self) -> Result<()> {
        let shutdown_timeout = self.config.server.shutdown_timeout;
        let start_time = Instant::now();

        let registry = self.pairing.registry();
        let closed = registry.close_all(SHUTDOWN_REASON).await;
        for stats in registry.stats().await {
            debug!(
                "Closing pair {} ({} <-> {}) after {} ms, {} bytes relayed",
                stats.pair_id,
                stats.front_addr,
                stats.back_addr,
                stats.duration_ms,
                stats.total_bytes
            );
        }
        info!(
            "Closing {} active pairs, waiting for {} connections (timeout: {:?})",
            closed,
            self.get_active_connections(),
            shutdown_timeout
        );

        while self.get_active_connections() > 0 && start_time.elapsed() < shutdown_timeout {
            debug!(
                "Waiting for {} active connections to close",
                self.get_active_connections()
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.get_active_connections();
        let elapsed = start_time.elapsed();

        if remaining == 0 {
            info!("All connections closed gracefully in {:?}", elapsed);
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} connections still active",
                elapsed, remaining
            );
        }

        Ok(())
    }

    /// Gracefully shutdown the connection manager
    pub async fn shutdown(&self) -> Result<()> {
        self.initiate_shutdown();
        self.wait_for_connections_to_close().await
    }
}

/// Accept errors the listener cannot recover from by retrying
fn is_fatal_accept_error(e: &io::Error) -> bool {
    // EMFILE / ENFILE: descriptor exhaustion
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;
    matches!(e.raw_os_error(), Some(ENFILE) | Some(EMFILE))
}
