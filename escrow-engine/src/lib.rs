//! Escrow marketplace engine
//!
//! This crate implements the settlement core of a buyer/seller escrow
//! marketplace:
//! - Transaction state machine with per-row compare-and-swap transitions
//! - Append-only, idempotent double-entry ledger
//! - Dispute arbitration with binary resolution
//! - Stale-resource reaper for timeout-driven eviction
//! - Realtime fan-out plus client-side reconciliation of deliveries

pub mod admin;
pub mod audit;
pub mod chat;
pub mod config;
pub mod deposits;
pub mod dispute;
pub mod error;
pub mod ip_gate;
pub mod ledger;
pub mod live_view;
pub mod logging;
pub mod models;
pub mod node;
pub mod realtime;
pub mod reaper;
pub mod time;
pub mod transaction_manager;
pub mod withdrawals;

pub use config::EscrowSettings;
pub use error::{ErrorKind, EscrowError};
pub use node::EscrowNode;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
