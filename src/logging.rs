//! Tracing subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

/// Log to stderr, filtered by `RUST_LOG` when set, otherwise `info`
/// (`debug` with `verbose`).
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // a second init (e.g. in tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
