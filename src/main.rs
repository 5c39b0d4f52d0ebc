//! RustTunnel - TCP Tunneling Proxy
//!
//! Accepts connections on a local port and relays each one to a fixed remote
//! target, optionally terminating or originating TLS on the way.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use rusttunnel::{
    config::{ConfigManager, ConnectMode},
    Config, ConnectionManager, ShutdownCoordinator, TlsSessionFactory,
};

/// CLI arguments for RustTunnel
#[derive(Parser, Debug)]
#[command(name = "rusttunnel")]
#[command(about = "RustTunnel - TCP tunneling proxy with optional TLS")]
#[command(version)]
#[command(long_about = "
RustTunnel - TCP tunneling proxy with optional TLS

Every inbound connection is paired with one new connection to the configured
target. Bytes are relayed both ways until either side closes, then the other
side is closed as well.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  RUSTTUNNEL_LISTENER_PORT    - Port to accept connections on
  RUSTTUNNEL_REMOTE_IP        - Target host
  RUSTTUNNEL_REMOTE_PORT      - Target port
  RUSTTUNNEL_CONNECT_MODE     - plain, client (TLS to target) or server (TLS from clients)
  RUSTTUNNEL_CONNECT_TIMEOUT  - Target connect timeout (e.g. 30s)
  RUSTTUNNEL_BUFFER_SIZE      - Relay buffer size in bytes
  RUSTTUNNEL_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Listener port (overrides config file)
    #[arg(short, long, help = "Port to accept connections on")]
    pub port: Option<u16>,

    /// Target host (overrides config file)
    #[arg(long, help = "Target host to relay to")]
    pub remote_ip: Option<String>,

    /// Target port (overrides config file)
    #[arg(long, help = "Target port to relay to")]
    pub remote_port: Option<u16>,

    /// Where TLS is applied
    #[arg(long, help = "Connect mode: plain, client or server")]
    pub connect_mode: Option<ConnectMode>,

    /// Target connect timeout in seconds
    #[arg(long, help = "Target connect timeout in seconds")]
    pub connect_timeout: Option<u64>,

    /// Buffer size in bytes
    #[arg(long, help = "Relay buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Log relayed payloads that are valid UTF-8 at trace level
    #[arg(long, help = "Log relayed UTF-8 payloads at trace level")]
    pub log_payload: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let filter_handle = init_tracing(&args)?;

    info!("Starting RustTunnel v{}", env!("CARGO_PKG_VERSION"));

    // CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.port,
        args.remote_ip.as_deref(),
        args.remote_port,
        args.connect_mode,
        args.connect_timeout,
        args.buffer_size,
        args.log_payload,
    );
    let cli_level = cli_log_level(&args);
    if let Some(level) = &cli_level {
        config.monitoring.log_level = level.clone();
    }

    config
        .validate()
        .context("Final configuration validation failed")?;

    // RUST_LOG and the CLI win over the configured level
    if cli_level.is_none() && std::env::var_os(EnvFilter::DEFAULT_ENV).is_none() {
        filter_handle
            .reload(EnvFilter::new(&config.monitoring.log_level))
            .context("Failed to apply configured log level")?;
    }

    if args.validate_config {
        info!("Configuration is valid");
        log_summary(&config);
        return Ok(());
    }

    log_summary(&config);

    let tls = TlsSessionFactory::from_config(&config).context("Failed to set up TLS")?;
    let config = Arc::new(config);

    let shutdown_coordinator = Arc::new(ShutdownCoordinator::new(config.server.shutdown_timeout));

    let mut connection_manager = ConnectionManager::new(Arc::clone(&config), tls)?;
    let bind_addr = connection_manager
        .bind()
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr()))?;

    let mut server_handle = {
        let coordinator = Arc::clone(&shutdown_coordinator);
        let mut shutdown_rx = coordinator.subscribe();

        tokio::spawn(async move {
            let mut manager = connection_manager;

            tokio::select! {
                result = manager.start() => result,
                _ = shutdown_rx.recv() => {
                    info!("Server task received shutdown signal");
                    coordinator.shutdown_connection_manager(&manager).await
                }
            }
        })
    };

    info!("RustTunnel listening on {}, relaying to {}", bind_addr, config.target());
    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    tokio::select! {
        result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = result {
                error!("Error setting up signal handlers: {}", e);
                shutdown_coordinator.trigger();
            }
        }
        result = &mut server_handle => {
            // The listener stopped on its own: only an unrecoverable accept error does that
            let result = result.context("Server task panicked")?;
            result.context("Listener failed")?;
            return Ok(());
        }
    }

    info!("Initiating graceful shutdown...");
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Error during shutdown: {:#}", e),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!("Server task failed: {}", e),
    }

    info!("Server shutdown complete");
    Ok(())
}

fn log_summary(config: &Config) {
    info!("Configuration summary:");
    info!("  Listen address: {}", config.listen_addr());
    info!("  Target: {}", config.target());
    info!("  Connect mode: {}", config.tls.connect_mode);
    info!("  Connect timeout: {:?}", config.server.connect_timeout);
    info!("  Buffer size: {} bytes", config.server.buffer_size);
    info!("  Max connections: {}", config.server.max_connections);
    info!(
        "  Payload logging: {}",
        if config.monitoring.log_payload {
            "enabled"
        } else {
            "disabled"
        }
    );
}

/// Log level requested on the command line, if any
fn cli_log_level(args: &CliArgs) -> Option<String> {
    if args.verbose {
        Some("debug".to_string())
    } else {
        args.log_level.as_ref().map(|level| level.to_ascii_lowercase())
    }
}

/// Initialize tracing/logging.
///
/// Runs before the configuration is loaded. The returned handle swaps in the
/// configured level once it is known.
fn init_tracing(args: &CliArgs) -> Result<reload::Handle<EnvFilter, Registry>> {
    let log_level = cli_log_level(args).unwrap_or_else(|| "info".to_string());

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let (filter, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .init();

    Ok(handle)
}
