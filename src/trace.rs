use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. `levels` accepts anything
/// `EnvFilter` understands, e.g. "info" or "hetzner_sd=debug".
pub fn init(color: bool, levels: &str) {
    let filter = EnvFilter::try_new(levels).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(color)
        .with_target(false)
        .init();
}
