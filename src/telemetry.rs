//! Logging setup for binaries and tests built on this crate. The library itself only emits
//! `tracing` events.

use tracing_subscriber::{
    fmt,
    EnvFilter,
};

/// Install a formatting subscriber filtered by `RUST_LOG`, or by `default_directive` (e.g.
/// `"feconfig=info"`) when that is unset or unparsable.
///
/// Returns `false` if a global subscriber was already installed, which makes repeated calls
/// harmless.
pub fn init_logging(default_directive: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}
