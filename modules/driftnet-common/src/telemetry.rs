use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins; otherwise the
/// engine logs at info.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("driftnet=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
