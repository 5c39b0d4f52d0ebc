//! Connection Management Module
//!
//! Handles TCP connection acceptance, pairing with the target and the
//! lifecycle of the connections on both sides of a tunnel.

pub mod manager;
pub mod pairing;
pub mod stream;

pub use manager::ConnectionManager;
pub use pairing::{PairRegistry, PairingManager};
pub use stream::{Connection, ConnectionRole, ProxyStream};
