//! Connection abstraction
//!
//! A [`Connection`] is one network endpoint of a session pair: the inbound
//! (front) or outbound (back) socket, optionally wrapped in TLS. Connections
//! start out suspended and refuse to hand out their I/O halves until the
//! pairing manager resumes them, so no application byte can move before the
//! pair exists.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use anyhow::{bail, Context};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;
use tracing::debug;

use crate::tls::TlsSessionFactory;
use crate::Result;

/// Which side of a session pair a connection belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Inbound, client-facing
    Front,
    /// Outbound, target-facing
    Back,
}

impl ConnectionRole {
    pub fn peer(&self) -> ConnectionRole {
        match self {
            ConnectionRole::Front => ConnectionRole::Back,
            ConnectionRole::Back => ConnectionRole::Front,
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Front => f.write_str("front"),
            ConnectionRole::Back => f.write_str("back"),
        }
    }
}

/// Byte stream underneath a connection
pub enum ProxyStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ProxyStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, ProxyStream::Tls(_))
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ProxyStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ProxyStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ProxyStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ProxyStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One endpoint of a session pair
pub struct Connection {
    id: String,
    role: ConnectionRole,
    peer_addr: SocketAddr,
    stream: ProxyStream,
    suspended: bool,
    closed: bool,
}

impl Connection {
    /// Wrap a freshly accepted or connected socket. The connection starts suspended.
    pub fn new(id: impl Into<String>, role: ConnectionRole, stream: TcpStream) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .context("Failed to get peer address")?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", peer_addr, e);
        }

        Ok(Self {
            id: id.into(),
            role,
            peer_addr,
            stream: ProxyStream::Plain(stream),
            suspended: true,
            closed: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Allow application I/O on this connection.
    pub(crate) fn resume(&mut self) {
        self.suspended = false;
    }

    /// Replace the plain socket with a TLS session produced by `factory`.
    ///
    /// The handshake runs here, before any application byte is exchanged, so
    /// unencrypted payload can never reach a TLS-wrapped connection.
    pub async fn upgrade_tls(self, factory: &TlsSessionFactory) -> Result<Self> {
        let Connection {
            id,
            role,
            peer_addr,
            stream,
            suspended,
            closed,
        } = self;

        if closed {
            bail!("Connection {} is closed", id);
        }

        let tcp = match stream {
            ProxyStream::Plain(tcp) => tcp,
            ProxyStream::Tls(_) => bail!("Connection {} is already TLS-wrapped", id),
        };

        let tls = factory
            .handshake(tcp)
            .await
            .with_context(|| format!("TLS handshake failed on {} connection {}", role, id))?;

        debug!(
            "TLS {} session established on {} connection {} ({})",
            factory.role(),
            role,
            id,
            peer_addr
        );

        Ok(Self {
            id,
            role,
            peer_addr,
            stream: ProxyStream::Tls(Box::new(tls)),
            suspended,
            closed,
        })
    }

    /// Close the connection. Closing an already closed connection is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown of {} connection {} reported: {}", self.role, self.id, e);
        }
        debug!("Closed {} connection {} ({})", self.role, self.id, self.peer_addr);
        Ok(())
    }

    /// Split into read and write halves for relaying. Fails while suspended.
    pub fn into_split(self) -> Result<(ReadHalf<ProxyStream>, WriteHalf<ProxyStream>)> {
        if self.closed {
            bail!("{} connection {} is closed", self.role, self.id);
        }
        if self.suspended {
            bail!(
                "{} connection {} is suspended until it is paired",
                self.role,
                self.id
            );
        }
        Ok(tokio::io::split(self.stream))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer_addr", &self.peer_addr)
            .field("tls", &self.is_tls())
            .field("suspended", &self.suspended)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_new_connection_is_suspended() {
        let (_client, server) = socket_pair().await;
        let conn = Connection::new("conn_1", ConnectionRole::Front, server).unwrap();

        assert!(conn.is_suspended());
        assert!(!conn.is_closed());
        assert!(!conn.is_tls());
        assert_eq!(conn.role(), ConnectionRole::Front);
        assert!(conn.into_split().is_err());
    }

    #[tokio::test]
    async fn test_resumed_connection_splits() {
        let (_client, server) = socket_pair().await;
        let mut conn = Connection::new("conn_2", ConnectionRole::Back, server).unwrap();
        conn.resume();
        assert!(conn.into_split().is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut client, server) = socket_pair().await;
        let mut conn = Connection::new("conn_3", ConnectionRole::Front, server).unwrap();

        assert!(conn.close().await.is_ok());
        assert!(conn.is_closed());
        assert!(conn.close().await.is_ok());
        assert!(conn.is_closed());

        // Peer observes end-of-stream
        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_role_peer() {
        assert_eq!(ConnectionRole::Front.peer(), ConnectionRole::Back);
        assert_eq!(ConnectionRole::Back.peer(), ConnectionRole::Front);
        assert_eq!(ConnectionRole::Front.to_string(), "front");
    }
}
