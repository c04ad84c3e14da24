use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Environment variable overriding the log directory.
pub const LOG_DIR_ENV: &str = "LOGDIR";
const ROOT_LOG_DIR: &str = "/var/log";

/// Directory the log file goes to: config, then `$LOGDIR` if writable, then
/// `/var/log` for root, then the invoking user's home directory.
pub fn resolve_log_dir(config: &LoggingConfig, is_root: bool) -> PathBuf {
    select_log_dir(config, std::env::var_os(LOG_DIR_ENV), is_root)
}

fn select_log_dir(config: &LoggingConfig, env_dir: Option<OsString>, is_root: bool) -> PathBuf {
    if let Some(dir) = &config.dir {
        return dir.clone();
    }
    if let Some(dir) = env_dir.filter(|d| !d.is_empty()).map(PathBuf::from) {
        if is_writable(&dir) {
            return dir;
        }
        eprintln!("{} {:?} is not writable, ignoring it", LOG_DIR_ENV, dir);
    }
    if is_root {
        return PathBuf::from(ROOT_LOG_DIR);
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn is_writable(dir: &Path) -> bool {
    tempfile::tempfile_in(dir).is_ok()
}

fn env_filter(config: &LoggingConfig, verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { config.level.as_str() };
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn file_appender(config: &LoggingConfig, dir: &Path) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(config.file.as_str())
        .build(dir)
        .with_context(|| format!("Failed to open log file {:?}", dir.join(&config.file)))
}

/// Install the global subscriber: JSON lines to the log file and compact
/// warnings to stderr. The returned guard flushes the file on drop.
///
/// Falls back to stderr only when the log file cannot be opened.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let is_root = nix::unistd::geteuid().is_root();
    let dir = resolve_log_dir(config, is_root);

    let (file_layer, guard, file_err) = match file_appender(config, &dir) {
        Ok(appender) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_filter(env_filter(config, verbose));
            (Some(layer), Some(guard), None)
        }
        Err(err) => (None, None, Some(err)),
    };

    let console_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_writer(io::stderr)
        .with_filter(EnvFilter::new(if verbose { "debug" } else { "warn" }));

    Registry::default()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if let Some(err) = file_err {
        tracing::warn!("⚠️ Logging to stderr only: {:#}", err);
    }
    Ok(guard)
}
