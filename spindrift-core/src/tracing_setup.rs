//! Tracing setup for Spindrift.

use tracing_subscriber::EnvFilter;

/// Initializes console tracing with an env-filter override.
///
/// `RUST_LOG` takes precedence; `default_directives` applies otherwise
/// (e.g. `"spindrift_core=debug,info"`). Safe to call once per process.
pub fn init_tracing(default_directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
