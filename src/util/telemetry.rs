//! Telemetry helpers for structured logging.

use tracing_subscriber::EnvFilter;

/// Install a default env-filtered subscriber unless one is already set.
///
/// Filtering follows `RUST_LOG`; without it, engine internals log at info
/// level and everything else at warn.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,jobflow=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
