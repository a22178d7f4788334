//! Logging setup for hosts that want the client's diagnostics
//!
//! The client only emits `tracing` events; it never installs a subscriber on
//! its own. A host that already owns the global subscriber keeps it. Hosts
//! without one can call [`init`], which scopes output to this workspace's
//! targets so the reqwest and hyper internals stay quiet at `debug`.

use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};

/// Rolling file name prefix inside [`Config::state_dir`]
pub const LOG_FILE_PREFIX: &str = "apptilaus.log";

const LOG_TARGETS: [&str; 2] = ["apptilaus_core", "apptilaus"];

/// Install a daily-rolling file subscriber, optionally echoed to stderr.
///
/// `RUST_LOG` overrides the configured level when set. An invalid level in
/// config is an error here rather than a silent fallback.
pub fn init(config: &LoggingConfig, echo_stderr: bool) -> Result<LoggingGuard> {
    let level = parse_level(&config.level)?;
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(level)));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);

    let stderr_layer = echo_stderr.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
    });

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
    {
        tracing::debug!(error = %e, "Global subscriber already set");
    }

    tracing::info!(log_dir = %log_dir.display(), level = %level, "Logging initialized");

    Ok(LoggingGuard { _guard: guard })
}

/// Parse a config level name (`trace` through `error`, any case)
pub fn parse_level(raw: &str) -> Result<Level> {
    Level::from_str(raw.trim())
        .map_err(|_| Error::Config(format!("unknown log level '{}'", raw)))
}

fn filter_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    LOG_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Keeps the background file writer alive; flushes on drop
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}
