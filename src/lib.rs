//! RustTunnel Library
//!
//! TCP tunneling proxy: every inbound connection is paired with exactly one
//! outbound connection to a fixed target, and bytes are relayed between the
//! two until either side goes away. TLS can be terminated on the inbound side
//! or originated toward the target.

pub mod config;
pub mod connection;
pub mod relay;
pub mod shutdown;
pub mod tls;

pub use config::Config;
pub use connection::{ConnectionManager, PairingManager};
pub use shutdown::ShutdownCoordinator;
pub use tls::TlsSessionFactory;

/// Common error type for the tunnel
pub type Result<T> = anyhow::Result<T>;
