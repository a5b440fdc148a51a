//! provides logging helpers

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber
///
/// Always installs a stderr layer honoring `RUST_LOG` (INFO default). When
/// `log_file` is given, decision logs are additionally written to a daily
/// rolling file; the returned guard must be held for the process lifetime to
/// flush the non-blocking writer.
pub fn init<P: AsRef<Path>>(log_file: Option<P>) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter);

    let Some(log_file) = log_file else {
        registry().with(fmt_layer).init();
        return Ok(None);
    };

    let log_file = log_file.as_ref();
    let dir = match log_file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file = log_file
        .file_name()
        .context("log file path has no file name")?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file.to_string_lossy())
        .max_log_files(3)
        .build(dir)
        .context("failed to create rolling file appender")?;

    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let file_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::LevelFilter::INFO);

    registry().with(fmt_layer).with(file_layer).init();
    Ok(Some(file_guard))
}
