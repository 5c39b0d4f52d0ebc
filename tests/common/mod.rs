//! Shared helpers for the tunnel integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rcgen::CertifiedKey;
use rusttunnel::{Config, ConnectionManager, PairingManager, TlsSessionFactory};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A tunnel running in the background
pub struct TestTunnel {
    pub addr: SocketAddr,
    pub pairing: Arc<PairingManager>,
    pub handle: JoinHandle<rusttunnel::Result<()>>,
}

/// Tunnel configuration listening on an ephemeral loopback port
pub fn tunnel_config(target: SocketAddr) -> Config {
    let mut config = Config::default();
    config.server.bind_ip = "127.0.0.1".parse().unwrap();
    config.server.listener_port = 0;
    config.server.remote_ip = target.ip().to_string();
    config.server.remote_port = target.port();
    config.server.close_grace = Duration::from_secs(1);
    config
}

pub async fn start_tunnel(config: Config) -> TestTunnel {
    let tls = TlsSessionFactory::from_config(&config).unwrap();
    let mut manager = ConnectionManager::new(Arc::new(config), tls).unwrap();
    let addr = manager.bind().await.unwrap();
    let pairing = Arc::clone(manager.pairing());
    let handle = tokio::spawn(async move { manager.start().await });

    TestTunnel {
        addr,
        pairing,
        handle,
    }
}

/// Echo every byte back until the peer closes, then report the close
pub async fn echo<S>(mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Plain TCP echo target. Every finished connection sends one message on the channel.
pub async fn spawn_echo_target() -> (SocketAddr, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                echo(stream).await;
                let _ = closed_tx.send(());
            });
        }
    });

    (addr, closed_rx)
}

/// An address nothing listens on
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Read until EOF or error, bounded by `limit`. Returns what was read
/// before the connection ended, or None if it never ended.
pub async fn read_until_closed<S>(stream: &mut S, limit: Duration) -> Option<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    let read_all = async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
    };

    match tokio::time::timeout(limit, read_all).await {
        Ok(()) => Some(received),
        Err(_) => None,
    }
}

/// Self-signed certificate for `localhost`, written as PEM files into `dir`
pub fn write_localhost_cert(dir: &Path) -> (CertifiedKey, PathBuf, PathBuf) {
    write_cert(dir, "localhost")
}

/// Self-signed certificate for `name`, written as `<name>.pem` and
/// `<name>.key.pem` into `dir`
pub fn write_cert(dir: &Path, name: &str) -> (CertifiedKey, PathBuf, PathBuf) {
    let certified = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
    let cert_path = dir.join(format!("{}.pem", name));
    let key_path = dir.join(format!("{}.key.pem", name));
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
    (certified, cert_path, key_path)
}
