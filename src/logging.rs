//! stderr logging for the CLI.
//!
//! The library only emits `tracing` events; binaries opt in to output here.
//! stdout stays reserved for manifests.

use crate::config::ENV_LOG;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn";

/// Install a stderr subscriber filtered by `LOADTRACE_LOG` (default `warn`).
///
/// `verbosity` raises the floor: 1 enables `info`, 2 or more `debug`.
/// Installing twice is a no-op.
pub fn init(verbosity: u8) {
    let fallback = match verbosity {
        0 => DEFAULT_FILTER,
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
