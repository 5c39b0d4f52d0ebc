//! Data Relay Module
//!
//! Handles bidirectional data relay between the two connections of a pair.

pub mod engine;
pub mod session;

pub use engine::{DirectionOutcome, RelayDirection, RelayEngine};
pub use session::{CloseInitiator, PairState, PairStats, RelaySession, SessionPair};
