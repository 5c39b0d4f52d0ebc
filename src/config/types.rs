//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub monitoring: MonitoringConfig,
}

/// Listener and target configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    #[serde(alias = "listenerPort")]
    pub listener_port: u16,
    #[serde(alias = "remoteIP")]
    pub remote_ip: String,
    #[serde(alias = "remotePort")]
    pub remote_port: u16,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub buffer_size: usize,
    #[serde(with = "humantime_serde")]
    pub close_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub max_connections: usize,
}

/// TLS configuration, consumed only by the TLS session factory
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    #[serde(alias = "connectMode")]
    pub connect_mode: ConnectMode,
    #[serde(alias = "keyStorePath")]
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    #[serde(alias = "trustStorePath")]
    pub trust_store_path: Option<PathBuf>,
    pub protocol: String,
    #[serde(alias = "sessionTimeout", with = "humantime_serde")]
    pub session_timeout: Duration,
    #[serde(alias = "needClientAuth")]
    pub need_client_auth: bool,
    pub server_name: Option<String>,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub log_payload: bool,
}

/// Where TLS is applied, if anywhere
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConnectMode {
    /// Bytes pass through untouched on both sides
    #[default]
    Plain,
    /// The tunnel originates TLS toward the target
    TlsClient,
    /// The tunnel terminates TLS from inbound clients
    TlsServer,
}

impl ConnectMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectMode::Plain => "plain",
            ConnectMode::TlsClient => "tls-client",
            ConnectMode::TlsServer => "tls-server",
        }
    }
}

impl fmt::Display for ConnectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "plain" | "general" | "none" => Ok(ConnectMode::Plain),
            "client" | "sslclient" | "tlsclient" | "tls-client" => Ok(ConnectMode::TlsClient),
            "server" | "sslserver" | "tlsserver" | "tls-server" => Ok(ConnectMode::TlsServer),
            other => Err(anyhow::anyhow!(
                "unknown connect mode '{}' (expected plain, client or server)",
                other
            )),
        }
    }
}

impl TryFrom<String> for ConnectMode {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConnectMode> for String {
    fn from(mode: ConnectMode) -> Self {
        mode.as_str().to_string()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            listener_port: 8443,
            remote_ip: "127.0.0.1".to_string(),
            remote_port: 443,
            connect_timeout: Duration::from_secs(30),
            buffer_size: 8192,
            close_grace: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            max_connections: 1000,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            connect_mode: ConnectMode::Plain,
            cert_path: None,
            key_path: None,
            trust_store_path: None,
            protocol: "TLS".to_string(),
            session_timeout: Duration::from_secs(30),
            need_client_auth: false,
            server_name: None,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_payload: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_mode_parsing() {
        assert_eq!("plain".parse::<ConnectMode>().unwrap(), ConnectMode::Plain);
        assert_eq!("General".parse::<ConnectMode>().unwrap(), ConnectMode::Plain);
        assert_eq!("client".parse::<ConnectMode>().unwrap(), ConnectMode::TlsClient);
        assert_eq!("SSLClient".parse::<ConnectMode>().unwrap(), ConnectMode::TlsClient);
        assert_eq!("server".parse::<ConnectMode>().unwrap(), ConnectMode::TlsServer);
        assert_eq!("sslserver".parse::<ConnectMode>().unwrap(), ConnectMode::TlsServer);
        assert!("bogus".parse::<ConnectMode>().is_err());
    }

    #[test]
    fn test_connect_mode_display_parses_back() {
        for mode in [ConnectMode::Plain, ConnectMode::TlsClient, ConnectMode::TlsServer] {
            assert_eq!(mode.to_string().parse::<ConnectMode>().unwrap(), mode);
        }
        assert_eq!(String::from(ConnectMode::TlsServer), "tls-server");
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.tls.connect_mode, ConnectMode::Plain);
        assert!(!config.monitoring.log_payload);
    }
}
