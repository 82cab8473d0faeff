//! Tracing setup for embedders and tests.

use tracing_subscriber::EnvFilter;

/// Initializes a global `tracing` subscriber honoring `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops. Embedders that
/// install their own subscriber should simply not call this.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
