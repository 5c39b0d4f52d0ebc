//! Relay Session
//!
//! A [`SessionPair`] owns the front and back connections of one tunnel. The
//! state both relay directions share lives in an `Arc<RelaySession>`: the
//! pair's lifecycle and its traffic counters. Directions hold the session,
//! never each other's connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::bail;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionRole};
use crate::Result;

/// Lifecycle of a session pair. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PairState {
    /// Front exists, back not yet established
    Pairing,
    /// Both connections open, both directions running
    Active,
    /// One side went away, the other is being closed
    Closing,
    /// Both connections closed, both directions stopped
    Closed,
}

/// Who started the close cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    Connection(ConnectionRole),
    /// The proxy itself, e.g. on shutdown
    Proxy,
}

/// Shared state of an active pair
#[derive(Debug)]
pub struct RelaySession {
    pub pair_id: String,
    pub front_addr: SocketAddr,
    pub back_addr: SocketAddr,
    pub start_time: Instant,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
    state: watch::Sender<PairState>,
}

/// Statistics for a pair, produced when it is disposed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairStats {
    pub pair_id: String,
    pub front_addr: SocketAddr,
    pub back_addr: SocketAddr,
    pub start_time: SystemTime,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
    pub state: PairState,
}

impl RelaySession {
    /// Create a new session in the `Pairing` state
    pub fn new(pair_id: String, front_addr: SocketAddr, back_addr: SocketAddr) -> Self {
        debug!(
            "Creating new relay session: {} ({} -> {})",
            pair_id, front_addr, back_addr
        );

        let (state, _) = watch::channel(PairState::Pairing);
        Self {
            pair_id,
            front_addr,
            back_addr,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            state,
        }
    }

    pub fn state(&self) -> PairState {
        *self.state.borrow()
    }

    /// `Pairing -> Active`. Returns false if the pair already moved on.
    pub fn activate(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == PairState::Pairing {
                *state = PairState::Active;
                true
            } else {
                false
            }
        })
    }

    /// Enter `Closing`. Exactly one caller wins and decides the cascade;
    /// every later call is a no-op and returns false.
    pub fn begin_close(&self, initiator: CloseInitiator, reason: &str) -> bool {
        let won = self.state.send_if_modified(|state| {
            if *state < PairState::Closing {
                *state = PairState::Closing;
                true
            } else {
                false
            }
        });

        if won {
            match initiator {
                CloseInitiator::Connection(role) => debug!(
                    "Pair {} closing: {} side {}, closing {} side",
                    self.pair_id,
                    role,
                    reason,
                    role.peer()
                ),
                CloseInitiator::Proxy => {
                    debug!("Pair {} closing: {}", self.pair_id, reason)
                }
            }
        }
        won
    }

    /// Close the pair from outside the relay
    pub fn close(&self, reason: &str) -> bool {
        self.begin_close(CloseInitiator::Proxy, reason)
    }

    /// Mark both connections closed and both directions stopped
    pub fn finish(&self) {
        self.state.send_modify(|state| *state = PairState::Closed);
    }

    pub fn is_closing(&self) -> bool {
        self.state() >= PairState::Closing
    }

    /// Resolves once the pair has entered `Closing` (or `Closed`)
    pub async fn closing(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|state| *state >= PairState::Closing).await;
    }

    /// Get bytes transferred upstream (front to back)
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Get bytes transferred downstream (back to front)
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Generate pair statistics
    pub fn to_stats(&self) -> PairStats {
        let duration = self.duration();
        let start_time = SystemTime::now() - duration;

        PairStats {
            pair_id: self.pair_id.clone(),
            front_addr: self.front_addr,
            back_addr: self.back_addr,
            start_time,
            duration_ms: duration.as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            total_bytes: self.total_bytes(),
            state: self.state(),
        }
    }

    /// Log pair statistics
    pub fn log_stats(&self) {
        info!(
            pair_id = %self.pair_id,
            front_addr = %self.front_addr,
            back_addr = %self.back_addr,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            total_bytes = self.total_bytes(),
            "Session pair closed"
        );
    }
}

/// The front and back connection of one tunnel, bound together for life
#[derive(Debug)]
pub struct SessionPair {
    session: Arc<RelaySession>,
    front: Connection,
    back: Connection,
}

impl SessionPair {
    /// Bind `front` and `back` together, resume both and mark the pair active.
    pub fn new(pair_id: String, mut front: Connection, mut back: Connection) -> Result<Self> {
        if front.role() != ConnectionRole::Front || back.role() != ConnectionRole::Back {
            bail!(
                "Pair {} needs a front and a back connection, got {} and {}",
                pair_id,
                front.role(),
                back.role()
            );
        }
        if front.is_closed() || back.is_closed() {
            bail!("Pair {} cannot be built from a closed connection", pair_id);
        }

        let session = Arc::new(RelaySession::new(
            pair_id,
            front.peer_addr(),
            back.peer_addr(),
        ));

        front.resume();
        back.resume();
        session.activate();

        Ok(Self {
            session,
            front,
            back,
        })
    }

    pub fn id(&self) -> &str {
        &self.session.pair_id
    }

    pub fn session(&self) -> &Arc<RelaySession> {
        &self.session
    }

    pub fn state(&self) -> PairState {
        self.session.state()
    }

    pub fn front(&self) -> &Connection {
        &self.front
    }

    pub fn back(&self) -> &Connection {
        &self.back
    }

    /// Close both connections without relaying. Idempotent.
    pub async fn close(&mut self, reason: &str) -> Result<()> {
        self.session.close(reason);
        self.front.close().await?;
        self.back.close().await?;
        self.session.finish();
        Ok(())
    }

    pub fn into_parts(self) -> (Arc<RelaySession>, Connection, Connection) {
        (self.session, self.front, self.back)
    }
}
