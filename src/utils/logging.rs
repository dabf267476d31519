//! Tracing subscriber setup for the binaries

use tracing_subscriber::{fmt, EnvFilter};

/// Default filter directive for the given verbosity
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// Install a global `fmt` subscriber
///
/// `RUST_LOG` takes precedence over the `debug` flag. Calling this twice is
/// harmless; the second installation is ignored.
pub fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}
