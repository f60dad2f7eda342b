//! Diagnostic tracing for the loop.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: leveled diagnostics via `RUST_LOG`, written to
//!   stderr. Never part of the product output.
//!
//! - **Loop artifacts**: the progress log, agent transcripts and verification
//!   logs under `.taskloop/`. Always written, unaffected by `RUST_LOG`.
//!
//! Stdout is reserved for the final completion or failure line.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "taskloop=info";

/// Initialize the global subscriber.
///
/// Reads `RUST_LOG`; defaults to `taskloop=info`. Output: stderr, compact.
///
/// # Example
/// ```bash
/// RUST_LOG=taskloop=debug taskloop 5
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
