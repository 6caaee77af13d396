//! Diagnostic tracing for the runtime.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: heartbeats, worker activity and git/process
//!   detail via `RUST_LOG`, written to stderr. Not persisted.
//!
//! - **Task events (`io/store`)**: the sampled, durable `task.*` events that
//!   `orchestrator logs` reads back. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_level` (`info` for `serve`,
/// `warn` for one-shot commands). Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=orchestrator=debug orchestrator serve
/// ```
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
