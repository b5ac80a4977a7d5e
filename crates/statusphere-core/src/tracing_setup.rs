use std::fs::OpenOptions;

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

pub fn init_tracing() {
    init_tracing_with_service("statusphere");
}

/// Install the global subscriber: stderr output filtered by `RUST_LOG`
/// (default `info`), plus a debug-level file log when `STATUSPHERE_LOG_FILE`
/// is set. Calling it twice is harmless.
pub fn init_tracing_with_service(service_name: &str) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter);

    let registry = tracing_subscriber::registry().with(stderr_layer);

    let file_layer = std::env::var("STATUSPHERE_LOG_FILE").ok().and_then(|log_path| {
        match OpenOptions::new().create(true).append(true).open(&log_path) {
            Ok(file) => {
                eprintln!("File logging enabled: {}", log_path);
                Some(
                    fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_filter(LevelFilter::DEBUG),
                )
            }
            Err(e) => {
                eprintln!("Failed to open log file {}: {}", log_path, e);
                None
            }
        }
    });

    if registry.with(file_layer).try_init().is_ok() {
        tracing::debug!(service = service_name, "Tracing initialized");
    }
}
