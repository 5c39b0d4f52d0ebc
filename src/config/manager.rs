//! Configuration Manager

use super::{Config, ConnectMode};
use crate::Result;
use anyhow::{bail, Context};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Protocol names accepted in `tls.protocol`
pub const SUPPORTED_TLS_PROTOCOLS: [&str; 3] = ["TLS", "TLSv1.2", "TLSv1.3"];

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config = Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse configuration from TOML text without validating it
    pub fn parse(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        Self::apply_env(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Override configuration values with `RUSTTUNNEL_*` environment variables
    pub fn apply_env(config: &mut Config) -> Result<()> {
        if let Ok(port) = std::env::var("RUSTTUNNEL_LISTENER_PORT") {
            config.server.listener_port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid RUSTTUNNEL_LISTENER_PORT: {}", port))?;
        }

        if let Ok(remote_ip) = std::env::var("RUSTTUNNEL_REMOTE_IP") {
            config.server.remote_ip = remote_ip;
        }

        if let Ok(port) = std::env::var("RUSTTUNNEL_REMOTE_PORT") {
            config.server.remote_port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid RUSTTUNNEL_REMOTE_PORT: {}", port))?;
        }

        if let Ok(mode) = std::env::var("RUSTTUNNEL_CONNECT_MODE") {
            config.tls.connect_mode = mode
                .parse::<ConnectMode>()
                .with_context(|| format!("Invalid RUSTTUNNEL_CONNECT_MODE: {}", mode))?;
        }

        if let Ok(timeout) = std::env::var("RUSTTUNNEL_CONNECT_TIMEOUT") {
            config.server.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid RUSTTUNNEL_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Ok(buffer_size) = std::env::var("RUSTTUNNEL_BUFFER_SIZE") {
            config.server.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid RUSTTUNNEL_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Ok(log_level) = std::env::var("RUSTTUNNEL_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        Ok(())
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_tls_config()
            .with_context(|| "TLS configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.listener_port == 0 {
            bail!("listener_port must be greater than 0");
        }

        if self.server.remote_ip.trim().is_empty() {
            bail!("remote_ip must not be empty");
        }

        if self.server.remote_port == 0 {
            bail!("remote_port must be greater than 0");
        }

        if self.server.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.server.buffer_size < 1024 {
            bail!("buffer_size must be at least 1024 bytes");
        }

        if self.server.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.server.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        Ok(())
    }

    fn validate_tls_config(&self) -> Result<()> {
        let tls = &self.tls;

        if !SUPPORTED_TLS_PROTOCOLS
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&tls.protocol))
        {
            bail!(
                "tls.protocol must be one of: {}",
                SUPPORTED_TLS_PROTOCOLS.join(", ")
            );
        }

        if tls.session_timeout.is_zero() {
            bail!("tls.session_timeout must be greater than 0");
        }

        if tls.cert_path.is_some() != tls.key_path.is_some() {
            bail!("tls.cert_path and tls.key_path must be configured together");
        }

        match tls.connect_mode {
            ConnectMode::Plain => {}
            ConnectMode::TlsClient => {
                if let Some(name) = &tls.server_name {
                    if name.trim().is_empty() {
                        bail!("tls.server_name must not be empty when set");
                    }
                }
            }
            ConnectMode::TlsServer => {
                if tls.cert_path.is_none() {
                    bail!("server connect mode requires tls.cert_path and tls.key_path");
                }
                if tls.need_client_auth && tls.trust_store_path.is_none() {
                    bail!("tls.need_client_auth requires tls.trust_store_path");
                }
            }
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Address the listener binds to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.bind_ip, self.server.listener_port)
    }

    /// The fixed target as `host:port`
    pub fn target(&self) -> String {
        match self.server.remote_ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.server.remote_port),
            _ => format!("{}:{}", self.server.remote_ip, self.server.remote_port),
        }
    }

    /// Merge with CLI arguments
    #[allow(clippy::too_many_arguments)]
    pub fn merge_with_cli_args(
        &mut self,
        port: Option<u16>,
        remote_ip: Option<&str>,
        remote_port: Option<u16>,
        connect_mode: Option<ConnectMode>,
        connect_timeout: Option<u64>,
        buffer_size: Option<usize>,
        log_payload: bool,
    ) {
        if let Some(port) = port {
            self.server.listener_port = port;
            tracing::info!("CLI override: listener port set to {}", port);
        }

        if let Some(remote_ip) = remote_ip {
            self.server.remote_ip = remote_ip.to_string();
            tracing::info!("CLI override: remote ip set to {}", remote_ip);
        }

        if let Some(remote_port) = remote_port {
            self.server.remote_port = remote_port;
            tracing::info!("CLI override: remote port set to {}", remote_port);
        }

        if let Some(mode) = connect_mode {
            self.tls.connect_mode = mode;
            tracing::info!("CLI override: connect mode set to {}", mode);
        }

        if let Some(timeout_secs) = connect_timeout {
            self.server.connect_timeout = Duration::from_secs(timeout_secs);
            tracing::info!("CLI override: connect timeout set to {}s", timeout_secs);
        }

        if let Some(buffer_size) = buffer_size {
            self.server.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if log_payload {
            self.monitoring.log_payload = true;
            tracing::info!("CLI override: payload logging enabled");
        }
    }
}
