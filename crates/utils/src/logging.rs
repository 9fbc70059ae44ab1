//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Environment variable naming an optional log file.
pub const LOG_PATH_ENV: &str = "VGPU_LOG_PATH";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// Logs always go to stderr. When `VGPU_LOG_PATH` names a file, a daily
/// rotated copy without ANSI colors is written next to it; the returned guard
/// must be held until exit so buffered lines are flushed.
pub fn init() -> Option<WorkerGuard> {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let log_path = std::env::var_os(LOG_PATH_ENV);
    let file_writer = log_path
        .as_deref()
        .map(Path::new)
        .and_then(|path| match rolling_appender(path) {
            Ok(appender) => Some(tracing_appender::non_blocking(appender)),
            Err(err) => {
                eprintln!("failed to open log file {}: {err}", path.display());
                None
            }
        });

    match file_writer {
        Some((writer, guard)) => {
            let file_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter());
            registry().with(fmt_layer).with(file_layer).init();
            Some(guard)
        }
        None => {
            registry().with(fmt_layer).init();
            None
        }
    }
}

fn rolling_appender(
    path: &Path,
) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("vgpu-manager.log");

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
}
