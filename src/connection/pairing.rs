//! Pairing Manager
//!
//! Turns each accepted front connection into a session pair: opens exactly
//! one outbound connection to the fixed target, applies TLS toward the target
//! when configured, binds the two together and hands the pair to the relay
//! engine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::stream::{Connection, ConnectionRole};
use crate::config::Config;
use crate::relay::{PairStats, RelayEngine, RelaySession, SessionPair};
use crate::tls::{TlsRole, TlsSessionFactory};
use crate::Result;

pub(crate) const SHUTDOWN_REASON: &str = "proxy shutting down";

/// Tracks the pairs currently relaying.
///
/// Once closed, the registry accepts no new pairs and every pairing still in
/// progress is abandoned.
#[derive(Debug)]
pub struct PairRegistry {
    pairs: RwLock<HashMap<String, Arc<RelaySession>>>,
    closed: watch::Sender<bool>,
}

impl PairRegistry {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            pairs: RwLock::new(HashMap::new()),
            closed,
        }
    }

    /// Track `session`. Returns false, without tracking it, once the
    /// registry is closed.
    pub async fn insert(&self, session: Arc<RelaySession>) -> bool {
        let mut pairs = self.pairs.write().await;
        if self.is_closed() {
            return false;
        }
        pairs.insert(session.pair_id.clone(), session);
        true
    }

    pub async fn remove(&self, pair_id: &str) -> Option<Arc<RelaySession>> {
        let mut pairs = self.pairs.write().await;
        let removed = pairs.remove(pair_id);
        if removed.is_some() {
            debug!("Removed pair {} from active tracking", pair_id);
        }
        removed
    }

    pub async fn active_count(&self) -> usize {
        self.pairs.read().await.len()
    }

    /// Snapshot statistics of every active pair
    pub async fn stats(&self) -> Vec<PairStats> {
        self.pairs
            .read()
            .await
            .values()
            .map(|session| session.to_stats())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the registry has been closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Refuse new pairs and start the close cascade on every active pair.
    /// Returns how many were newly closed.
    pub async fn close_all(&self, reason: &str) -> usize {
        self.closed.send_replace(true);

        self.pairs
            .read()
            .await
            .values()
            .filter(|session| session.close(reason))
            .count()
    }
}

impl Default for PairRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Establishes the back connection for each front connection
pub struct PairingManager {
    target: String,
    connect_timeout: Duration,
    tls: Option<Arc<TlsSessionFactory>>,
    relay: RelayEngine,
    registry: Arc<PairRegistry>,
    next_pair_id: AtomicUsize,
    pairs_established: AtomicU64,
}

impl PairingManager {
    /// Create a pairing manager. `tls`, when given, must be a client-role
    /// factory: it wraps every back connection.
    pub fn new(config: &Config, tls: Option<Arc<TlsSessionFactory>>) -> Result<Self> {
        if let Some(factory) = &tls {
            if factory.role() != TlsRole::Client {
                bail!("Back connections need a client-role TLS factory");
            }
        }

        Ok(Self {
            target: config.target(),
            connect_timeout: config.server.connect_timeout,
            tls,
            relay: RelayEngine::from_config(config),
            registry: Arc::new(PairRegistry::new()),
            next_pair_id: AtomicUsize::new(1),
            pairs_established: AtomicU64::new(0),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn registry(&self) -> &Arc<PairRegistry> {
        &self.registry
    }

    /// Number of pairs ever constructed
    pub fn pairs_established(&self) -> u64 {
        self.pairs_established.load(Ordering::Relaxed)
    }

    /// Handle a newly accepted front connection for its whole lifetime:
    /// pair it, relay it, dispose of it.
    #[instrument(skip(self, front), fields(front_id = %front.id(), peer = %front.peer_addr()))]
    pub async fn on_accepted(&self, front: Connection) -> Result<PairStats> {
        let mut pair = self.establish(front).await?;
        let pair_id = pair.id().to_string();

        if !self.registry.insert(Arc::clone(pair.session())).await {
            debug!("Pair {} established during shutdown, closing it", pair_id);
            pair.close(SHUTDOWN_REASON).await?;
            return Ok(pair.session().to_stats());
        }

        let stats = self.relay.run(pair).await;
        self.registry.remove(&pair_id).await;

        Ok(stats)
    }

    /// Open the back connection for `front` and bind both into an active pair.
    ///
    /// On any failure `front` is closed and no pair is created.
    pub async fn establish(&self, mut front: Connection) -> Result<SessionPair> {
        if front.role() != ConnectionRole::Front {
            bail!("Connection {} is not a front connection", front.id());
        }
        if !front.is_suspended() {
            bail!("Front connection {} was resumed before pairing", front.id());
        }

        let pair_id = format!("pair_{}", self.next_pair_id.fetch_add(1, Ordering::Relaxed));

        let opened = tokio::select! {
            biased;
            _ = self.registry.closed() => Err(anyhow!("{}", SHUTDOWN_REASON)),
            opened = self.open_back(&pair_id) => opened,
        };

        let back = match opened {
            Ok(back) => back,
            Err(e) => {
                warn!(
                    "Failed to establish back connection for {} ({}): {:#}",
                    front.id(),
                    front.peer_addr(),
                    e
                );
                front.close().await?;
                return Err(e);
            }
        };

        let pair = SessionPair::new(pair_id, front, back)?;
        self.pairs_established.fetch_add(1, Ordering::Relaxed);
        info!(
            "Pair {} established: {} <-> {}{}",
            pair.id(),
            pair.front().peer_addr(),
            pair.back().peer_addr(),
            if pair.back().is_tls() { " (TLS)" } else { "" }
        );
        Ok(pair)
    }

    /// Connect to the target and apply client-role TLS if configured
    async fn open_back(&self, pair_id: &str) -> Result<Connection> {
        let (stream, addr) = match timeout(self.connect_timeout, self.connect_to_target()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(anyhow!(
                    "Connection to {} timed out after {:?}",
                    self.target,
                    self.connect_timeout
                ))
            }
        };
        debug!("Connected to target {} (resolved to {})", self.target, addr);

        let back = Connection::new(format!("{}_back", pair_id), ConnectionRole::Back, stream)?;

        match &self.tls {
            Some(factory) => factory.wrap(back).await,
            None => Ok(back),
        }
    }

    /// Resolve the target and try each address in turn
    async fn connect_to_target(&self) -> Result<(TcpStream, SocketAddr)> {
        let addrs: Vec<SocketAddr> = lookup_host(self.target.as_str())
            .await
            .with_context(|| format!("Failed to resolve target {}", self.target))?
            .collect();

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok((stream, addr)),
                Err(e) => {
                    debug!("Failed to connect to {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(anyhow!("Failed to connect to target {}: {}", self.target, e)),
            None => Err(anyhow!(
                "Failed to connect to target {}: no addresses resolved",
                self.target
            )),
        }
    }
}
