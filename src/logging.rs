use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber. `RUST_LOG` takes precedence over `filter`.
///
/// Returns false when a global subscriber was already installed, e.g. by the host.
pub fn init_logging(filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).try_init().is_ok()
}
