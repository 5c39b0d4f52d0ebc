//! TLS Session Factory
//!
//! Builds the rustls client or server context once at startup and hands out
//! TLS sessions for individual connections.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, SupportedProtocolVersion};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, info};

use crate::config::{Config, ConnectMode, TlsConfig};
use crate::connection::Connection;
use crate::Result;

/// Side of the TLS handshake the tunnel plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    /// Originates TLS toward the target
    Client,
    /// Terminates TLS from inbound clients
    Server,
}

impl fmt::Display for TlsRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsRole::Client => f.write_str("client"),
            TlsRole::Server => f.write_str("server"),
        }
    }
}

enum Handshaker {
    Client {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
    Server {
        acceptor: TlsAcceptor,
    },
}

/// Produces TLS sessions for connections, in a fixed role
pub struct TlsSessionFactory {
    handshaker: Handshaker,
    handshake_timeout: Duration,
}

impl TlsSessionFactory {
    /// Build the factory the configured connect mode needs, if any
    pub fn from_config(config: &Config) -> Result<Option<Arc<Self>>> {
        let factory = match config.tls.connect_mode {
            ConnectMode::Plain => None,
            ConnectMode::TlsClient => {
                let server_name = config
                    .tls
                    .server_name
                    .as_deref()
                    .unwrap_or(&config.server.remote_ip);
                Some(Self::client(&config.tls, server_name)?)
            }
            ConnectMode::TlsServer => Some(Self::server(&config.tls)?),
        };

        if let Some(factory) = &factory {
            info!(
                "TLS {} context initialized (protocol: {}, handshake timeout: {:?})",
                factory.role(),
                config.tls.protocol,
                factory.handshake_timeout
            );
        }

        Ok(factory.map(Arc::new))
    }

    /// Client-role factory: TLS toward the target
    pub fn client(tls: &TlsConfig, server_name: &str) -> Result<Self> {
        let versions = protocol_versions(&tls.protocol)?;
        let roots = match &tls.trust_store_path {
            Some(path) => load_root_store(path)?,
            None => {
                debug!("No trust store configured, using bundled web PKI roots");
                RootCertStore {
                    roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
                }
            }
        };

        let builder = rustls::ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(versions)
            .context("Unsupported TLS protocol versions")?
            .with_root_certificates(roots);

        let client_config = match (&tls.cert_path, &tls.key_path) {
            (Some(cert_path), Some(key_path)) => builder
                .with_client_auth_cert(load_certs(cert_path)?, load_private_key(key_path)?)
                .context("Failed to configure TLS client certificate")?,
            _ => builder.with_no_client_auth(),
        };

        let server_name = ServerName::try_from(server_name.to_string())
            .with_context(|| format!("Invalid TLS server name: {}", server_name))?;

        Ok(Self {
            handshaker: Handshaker::Client {
                connector: TlsConnector::from(Arc::new(client_config)),
                server_name,
            },
            handshake_timeout: tls.session_timeout,
        })
    }

    /// Server-role factory: TLS from inbound clients
    pub fn server(tls: &TlsConfig) -> Result<Self> {
        let (cert_path, key_path) = match (&tls.cert_path, &tls.key_path) {
            (Some(cert), Some(key)) => (cert, key),
            _ => bail!("TLS server role requires cert_path and key_path"),
        };
        let versions = protocol_versions(&tls.protocol)?;

        let builder = rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(versions)
            .context("Unsupported TLS protocol versions")?;

        let builder = if tls.need_client_auth {
            let trust_store = tls
                .trust_store_path
                .as_ref()
                .ok_or_else(|| anyhow!("need_client_auth requires trust_store_path"))?;
            let roots = Arc::new(load_root_store(trust_store)?);
            let verifier = WebPkiClientVerifier::builder_with_provider(roots, crypto_provider())
                .build()
                .context("Failed to build TLS client certificate verifier")?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let server_config = builder
            .with_single_cert(load_certs(cert_path)?, load_private_key(key_path)?)
            .context("Failed to build TLS server config")?;

        Ok(Self {
            handshaker: Handshaker::Server {
                acceptor: TlsAcceptor::from(Arc::new(server_config)),
            },
            handshake_timeout: tls.session_timeout,
        })
    }

    pub fn role(&self) -> TlsRole {
        match self.handshaker {
            Handshaker::Client { .. } => TlsRole::Client,
            Handshaker::Server { .. } => TlsRole::Server,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Decorate a connection with a TLS session in this factory's role
    pub async fn wrap(&self, conn: Connection) -> Result<Connection> {
        conn.upgrade_tls(self).await
    }

    /// Run the handshake over a plain socket, bounded by the handshake timeout
    pub async fn handshake(&self, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
        let handshake = async {
            match &self.handshaker {
                Handshaker::Client {
                    connector,
                    server_name,
                } => connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map(TlsStream::Client),
                Handshaker::Server { acceptor } => acceptor.accept(tcp).await.map(TlsStream::Server),
            }
        };

        match timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(anyhow!("TLS {} handshake failed: {}", self.role(), e)),
            Err(_) => Err(anyhow!(
                "TLS {} handshake timed out after {:?}",
                self.role(),
                self.handshake_timeout
            )),
        }
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    static INSTANCE: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| Arc::new(rustls::crypto::ring::default_provider()))
        .clone()
}

/// Map a protocol name to rustls protocol versions
pub fn protocol_versions(name: &str) -> Result<&'static [&'static SupportedProtocolVersion]> {
    static TLS12_ONLY: [&SupportedProtocolVersion; 1] = [&rustls::version::TLS12];
    static TLS13_ONLY: [&SupportedProtocolVersion; 1] = [&rustls::version::TLS13];

    match name.to_ascii_lowercase().as_str() {
        "tls" => Ok(rustls::ALL_VERSIONS),
        "tlsv1.2" => Ok(&TLS12_ONLY),
        "tlsv1.3" => Ok(&TLS13_ONLY),
        other => bail!("Unsupported TLS protocol: {}", other),
    }
}

/// Load a PEM certificate chain
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("Failed to open cert file: {}", path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse PEM certificates in {}", path.display()))?;
    if certs.is_empty() {
        bail!("No certificates found in {}", path.display());
    }
    debug!("Loaded {} certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

/// Load a PEM private key
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("Failed to open key file: {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("Failed to parse PEM private key in {}", path.display()))?
        .ok_or_else(|| anyhow!("No private key found in {}", path.display()))
}

/// Load a PEM bundle of trusted certificates
fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .with_context(|| format!("Invalid trust anchor in {}", path.display()))?;
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_self_signed(dir: &TempDir) -> (PathBuf, PathBuf) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn test_protocol_versions() {
        assert_eq!(protocol_versions("TLS").unwrap().len(), rustls::ALL_VERSIONS.len());
        assert_eq!(protocol_versions("TLSv1.2").unwrap().len(), 1);
        assert_eq!(protocol_versions("tlsv1.3").unwrap().len(), 1);
        assert!(protocol_versions("SSLv3").is_err());
    }

    #[test]
    fn test_plain_mode_has_no_factory() {
        let config = Config::default();
        assert!(TlsSessionFactory::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_client_factory_without_trust_store() {
        let mut config = Config::default();
        config.tls.connect_mode = ConnectMode::TlsClient;
        config.server.remote_ip = "example.com".to_string();

        let factory = TlsSessionFactory::from_config(&config).unwrap().unwrap();
        assert_eq!(factory.role(), TlsRole::Client);
        assert_eq!(factory.handshake_timeout(), config.tls.session_timeout);
    }

    #[test]
    fn test_server_factory_from_pem_files() {
        let dir = TempDir::new().unwrap();
        let (cert_path, key_path) = write_self_signed(&dir);

        let mut tls = TlsConfig::default();
        tls.cert_path = Some(cert_path.clone());
        tls.key_path = Some(key_path);
        let factory = TlsSessionFactory::server(&tls).unwrap();
        assert_eq!(factory.role(), TlsRole::Server);

        tls.need_client_auth = true;
        tls.trust_store_path = Some(cert_path);
        assert!(TlsSessionFactory::server(&tls).is_ok());
    }

    #[test]
    fn test_server_factory_missing_files() {
        let mut tls = TlsConfig::default();
        tls.cert_path = Some(PathBuf::from("/nonexistent/cert.pem"));
        tls.key_path = Some(PathBuf::from("/nonexistent/key.pem"));
        assert!(TlsSessionFactory::server(&tls).is_err());

        assert!(TlsSessionFactory::server(&TlsConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_handshake_roundtrip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let dir = TempDir::new().unwrap();
        let (cert_path, key_path) = write_self_signed(&dir);

        let mut server_tls = TlsConfig::default();
        server_tls.cert_path = Some(cert_path.clone());
        server_tls.key_path = Some(key_path);
        let server = TlsSessionFactory::server(&server_tls).unwrap();

        let mut client_tls = TlsConfig::default();
        client_tls.trust_store_path = Some(cert_path);
        let client = TlsSessionFactory::client(&client_tls, "localhost").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut tls = server.handshake(tcp).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
            tls.flush().await.unwrap();
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut tls = client.handshake(tcp).await.unwrap();
        tls.write_all(b"ping").await.unwrap();
        tls.flush().await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server_task.await.unwrap();
    }
}
