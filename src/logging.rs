//! Process-wide tracing subscriber setup.

/// Initialize the global tracing subscriber. Safe to call once at process
/// start; subsequent calls are a no-op if a subscriber is already set.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "perpfeed=debug,tower_http=info".into());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
