//! Structured logging configuration.

use tracing_subscriber::EnvFilter;

/// Install a global tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops. Intended for
/// binaries and integration tests — library code only emits events.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .try_init();
}
