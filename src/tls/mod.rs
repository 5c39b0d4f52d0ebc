//! TLS Module
//!
//! TLS termination and origination for tunnel connections.

pub mod factory;

pub use factory::{TlsRole, TlsSessionFactory};
