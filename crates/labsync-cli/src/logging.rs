use std::env;
use std::path::Path;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Stdout plus file logging. `loglevel` wins over `TRACING_LEVEL`. Keep the
/// returned guard alive until exit or buffered file lines are lost.
pub fn init_logger(loglevel: Option<&str>) -> WorkerGuard {
    let filter = loglevel
        .map(str::to_string)
        .or_else(|| env::var("TRACING_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    let filter_layer = EnvFilter::new(filter);

    let log_file_path =
        env::var("LOG_FILE_PATH").unwrap_or_else(|_| "./logs/labsync.log".to_string());
    let log_file_path = Path::new(&log_file_path);
    let directory = log_file_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_file_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "labsync.log".into());

    let file_appender = tracing_appender::rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time()
                .with_ansi(true),
        )
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(filter_layer)
        .init();

    debug!("Logging to stderr and {}", log_file_path.display());

    guard
}
