use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// The level passed on the command line acts as the default directive;
/// `RUST_LOG` still takes precedence when set, so individual modules can be
/// tuned without touching the CLI.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
