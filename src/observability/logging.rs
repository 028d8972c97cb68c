use std::fs;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes logging: formatted console output always, plus daily-rotated
/// JSON files when BANKPIPE_LOG_DIR is set.
pub fn init_logging() {
    // JSON file layer only when a log directory is configured
    let file_layer = std::env::var("BANKPIPE_LOG_DIR").ok().map(|dir| {
        let _ = fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::daily(dir, "bankpipe.log");
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
        // Keep the guard alive for the process lifetime so logs flush on exit
        std::mem::forget(guard);
        fmt::layer().json().with_writer(non_blocking_writer)
    });

    let console_layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stdout);

    // Respect RUST_LOG if set; otherwise default to verbose for our crate
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bankpipe=debug,info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();
}
