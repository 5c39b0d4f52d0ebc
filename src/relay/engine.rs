//! Relay Engine

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use super::session::{CloseInitiator, PairStats, RelaySession, SessionPair};
use crate::config::Config;
use crate::connection::ConnectionRole;

/// Default per-direction relay buffer
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Moves bytes between the two connections of a session pair
#[derive(Debug, Clone)]
pub struct RelayEngine {
    buffer_size: usize,
    close_grace: Duration,
    log_payload: bool,
}

/// Why a relay direction stopped
#[derive(Debug)]
pub enum DirectionOutcome {
    /// The source signalled end-of-stream
    EndOfStream,
    /// Reading the source failed
    ReadError(io::Error),
    /// Writing the destination failed
    WriteError(io::Error),
    /// The pair was closed by the other direction or by the proxy
    Cancelled,
}

impl DirectionOutcome {
    fn close_reason(&self) -> String {
        match self {
            DirectionOutcome::EndOfStream => "reached end-of-stream".to_string(),
            DirectionOutcome::ReadError(e) => format!("read failed: {}", e),
            DirectionOutcome::WriteError(e) => format!("write failed: {}", e),
            DirectionOutcome::Cancelled => "cancelled".to_string(),
        }
    }
}

/// One one-way forwarding task between a source and a destination connection
pub struct RelayDirection {
    session: Arc<RelaySession>,
    source: ConnectionRole,
    buffer_size: usize,
    close_grace: Duration,
    log_payload: bool,
}

impl fmt::Display for RelayDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.source.peer())
    }
}

impl RelayDirection {
    /// Forward `src` into `dst` until either side stops or the pair closes.
    ///
    /// At most one buffer of data is in flight: the next read is not issued
    /// until the previous chunk has been fully written.
    pub async fn run<R, W>(self, mut src: R, mut dst: W) -> DirectionOutcome
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(self.buffer_size);

        let outcome = loop {
            buf.clear();

            let read = tokio::select! {
                biased;
                _ = self.session.closing() => break DirectionOutcome::Cancelled,
                read = src.read_buf(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => break DirectionOutcome::EndOfStream,
                Ok(n) => n,
                Err(e) => break DirectionOutcome::ReadError(e),
            };

            if self.log_payload {
                self.log_chunk(&buf[..n]);
            }

            let written = tokio::select! {
                biased;
                _ = self.session.closing() => break DirectionOutcome::Cancelled,
                written = write_chunk(&mut dst, &buf[..n]) => written,
            };

            if let Err(e) = written {
                break DirectionOutcome::WriteError(e);
            }

            match self.source {
                ConnectionRole::Front => self.session.add_bytes_up(n as u64),
                ConnectionRole::Back => self.session.add_bytes_down(n as u64),
            }
        };

        match &outcome {
            DirectionOutcome::Cancelled => {}
            DirectionOutcome::EndOfStream | DirectionOutcome::ReadError(_) => {
                self.session.begin_close(
                    CloseInitiator::Connection(self.source),
                    &outcome.close_reason(),
                );
            }
            DirectionOutcome::WriteError(_) => {
                self.session.begin_close(
                    CloseInitiator::Connection(self.source.peer()),
                    &outcome.close_reason(),
                );
            }
        }

        // Drain what was already handed to the destination, then close it.
        match timeout(self.close_grace, dst.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Pair {} {}: shutdown reported {}", self.session.pair_id, self, e),
            Err(_) => debug!(
                "Pair {} {}: abandoned pending writes after {:?}",
                self.session.pair_id, self, self.close_grace
            ),
        }

        debug!(
            "Pair {} {} stopped: {}",
            self.session.pair_id,
            self,
            outcome.close_reason()
        );
        outcome
    }

    fn log_chunk(&self, chunk: &[u8]) {
        if let Ok(text) = std::str::from_utf8(chunk) {
            trace!(pair_id = %self.session.pair_id, direction = %self, "{}", text);
        }
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(dst: &mut W, chunk: &[u8]) -> io::Result<()> {
    dst.write_all(chunk).await?;
    dst.flush().await
}

impl RelayEngine {
    /// Create a new relay engine with default settings
    pub fn new() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            close_grace: Duration::from_secs(5),
            log_payload: false,
        }
    }

    /// Create a new relay engine from configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            buffer_size: config.server.buffer_size,
            close_grace: config.server.close_grace,
            log_payload: config.monitoring.log_payload,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn with_close_grace(mut self, close_grace: Duration) -> Self {
        self.close_grace = close_grace;
        self
    }

    pub fn with_payload_logging(mut self, log_payload: bool) -> Self {
        self.log_payload = log_payload;
        self
    }

    /// Build the forwarding task for one direction of `session`
    pub fn direction(&self, session: Arc<RelaySession>, source: ConnectionRole) -> RelayDirection {
        RelayDirection {
            session,
            source,
            buffer_size: self.buffer_size,
            close_grace: self.close_grace,
            log_payload: self.log_payload,
        }
    }

    /// Relay an established pair until it is torn down
    pub async fn run(&self, pair: SessionPair) -> PairStats {
        let (session, front, back) = pair.into_parts();

        let front_halves = front.into_split();
        let back_halves = back.into_split();
        let ((front_rd, front_wr), (back_rd, back_wr)) = match (front_halves, back_halves) {
            (Ok(front), Ok(back)) => (front, back),
            (Err(e), _) | (_, Err(e)) => {
                error!("Pair {} could not start relaying: {}", session.pair_id, e);
                session.close("relay setup failed");
                session.finish();
                return session.to_stats();
            }
        };

        self.relay(session, front_rd, front_wr, back_rd, back_wr).await
    }

    /// Relay between already split halves. Both directions run as independent
    /// tasks; this returns once both have stopped.
    pub async fn relay<FR, FW, BR, BW>(
        &self,
        session: Arc<RelaySession>,
        front_rd: FR,
        front_wr: FW,
        back_rd: BR,
        back_wr: BW,
    ) -> PairStats
    where
        FR: AsyncRead + Unpin + Send + 'static,
        FW: AsyncWrite + Unpin + Send + 'static,
        BR: AsyncRead + Unpin + Send + 'static,
        BW: AsyncWrite + Unpin + Send + 'static,
    {
        info!(
            "Relaying pair {} ({} <-> {})",
            session.pair_id, session.front_addr, session.back_addr
        );

        let upstream = self.direction(Arc::clone(&session), ConnectionRole::Front);
        let downstream = self.direction(Arc::clone(&session), ConnectionRole::Back);

        let upstream = tokio::spawn(upstream.run(front_rd, back_wr));
        let downstream = tokio::spawn(downstream.run(back_rd, front_wr));

        for (name, handle) in [("front->back", upstream), ("back->front", downstream)] {
            if let Err(e) = handle.await {
                warn!("Pair {} {} task failed: {}", session.pair_id, name, e);
                session.close("relay task failed");
            }
        }

        session.finish();
        session.log_stats();
        session.to_stats()
    }
}

impl Default for RelayEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::PairState;
    use tokio::io::duplex;

    fn session() -> Arc<RelaySession> {
        let session = Arc::new(RelaySession::new(
            "pair_unit".to_string(),
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
        ));
        session.activate();
        session
    }

    #[tokio::test]
    async fn test_direction_preserves_order_across_chunks() {
        let session = session();
        let engine = RelayEngine::new().with_buffer_size(7);

        let (mut client, src) = duplex(3);
        let (dst, mut target) = duplex(5);

        let direction = engine.direction(Arc::clone(&session), ConnectionRole::Front);
        let task = tokio::spawn(direction.run(src, dst));

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            for chunk in payload.chunks(13) {
                client.write_all(chunk).await.unwrap();
            }
            client.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        target.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();

        assert_eq!(received, expected);
        assert!(matches!(task.await.unwrap(), DirectionOutcome::EndOfStream));
        assert_eq!(session.bytes_up(), 5000);
        assert_eq!(session.state(), PairState::Closing);
    }

    #[tokio::test]
    async fn test_stalled_destination_suspends_reads() {
        let session = session();
        let engine = RelayEngine::new()
            .with_buffer_size(16)
            .with_close_grace(Duration::from_millis(50));

        let (mut client, src) = duplex(64);
        // Destination never read: only 32 bytes fit
        let (dst, _target) = duplex(32);

        let direction = engine.direction(Arc::clone(&session), ConnectionRole::Front);
        let task = tokio::spawn(direction.run(src, dst));

        // Push far more than the destination, the relay buffer and the source
        // pipe can hold together; the writer must block rather than the relay
        // buffering it.
        let writer = tokio::spawn(async move {
            let data = vec![0x42u8; 4096];
            let _ = client.write_all(&data).await;
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!writer.is_finished(), "source should be back-pressured");
        assert!(session.bytes_up() <= 32 + 16);

        session.close("test teardown");
        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, DirectionOutcome::Cancelled));
        writer.abort();
    }

    #[tokio::test]
    async fn test_eof_on_one_side_closes_both() {
        let session = session();
        let engine = RelayEngine::new();

        let (mut client, front) = duplex(1024);
        let (back, mut target) = duplex(1024);
        let (front_rd, front_wr) = tokio::io::split(front);
        let (back_rd, back_wr) = tokio::io::split(back);

        let relay = tokio::spawn({
            let engine = engine.clone();
            let session = Arc::clone(&session);
            async move {
                engine
                    .relay(session, front_rd, front_wr, back_rd, back_wr)
                    .await
            }
        });

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        target.write_all(b"world").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        // Target goes away: the client must see its side closed too
        drop(target);

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        let stats = tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.bytes_up, 5);
        assert_eq!(stats.bytes_down, 5);
        assert_eq!(stats.state, PairState::Closed);
    }

    #[tokio::test]
    async fn test_payload_logging_tolerates_binary() {
        let session = session();
        let engine = RelayEngine::new().with_payload_logging(true);

        let (mut client, src) = duplex(64);
        let (dst, mut target) = duplex(64);
        let task = tokio::spawn(engine.direction(session, ConnectionRole::Back).run(src, dst));

        let data = [0xffu8, 0xfe, 0x00, b'o', b'k'];
        client.write_all(&data).await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        target.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, data);
        assert!(matches!(task.await.unwrap(), DirectionOutcome::EndOfStream));
    }
}
