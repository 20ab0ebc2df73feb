//! Tracing subscriber setup for binaries embedding the engine

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{error::EscrowError, EscrowResult};

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directives` (e.g. `"info"` or `"escrow_engine=debug"`).
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(default_directives: &str) -> EscrowResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives))
        .map_err(|e| EscrowError::config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| EscrowError::internal(format!("Failed to install subscriber: {}", e)))
}
