/// Initialize tracing/logging for an embedding application or a test run.
///
/// The library itself only emits `tracing` events; installing a subscriber is
/// left to the process boundary. This uses a simple `with_max_level`
/// configuration based on `default_level`.
pub fn init(default_level: &str) {
    let lvl = match default_level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    // try_init so tests and embedding apps can call this more than once
    let _ = tracing_subscriber::fmt()
        .with_max_level(lvl)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}
