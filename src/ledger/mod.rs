//! Practice session ledger
//!
//! Durable record of every finished practice session.

pub mod schema;
pub mod store;

pub use schema::{InvalidSession, RecordingSession};
pub use store::{load_all, LedgerError, LedgerResult, SessionLedger};
