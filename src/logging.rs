//! Logging setup.
//!
//! Events go to systemd's journal on Linux when it is reachable, otherwise to
//! a daily rolling file. `verbose` additionally mirrors them to stderr, which
//! is what the CLI uses for `--verbose`.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "PHOTOCAT_LOG";

const SYSLOG_IDENTIFIER: &str = "photocat";

/// Flushes the file writer when the process exits.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the global subscriber.
///
/// `PHOTOCAT_LOG` accepts any `EnvFilter` directive (`debug`,
/// `photocat::db=trace,warn`, ...) and defaults to `info`. Fails if a
/// subscriber is already installed.
pub fn init(log_dir: Option<PathBuf>, verbose: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = verbose.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

    #[cfg(target_os = "linux")]
    if let Ok(journald) = tracing_journald::layer() {
        tracing_subscriber::registry()
            .with(journald.with_syslog_identifier(SYSLOG_IDENTIFIER.to_string()).and_then(stderr).with_filter(env_filter))
            .try_init()?;
        tracing::debug!("Logging to journald");
        return Ok(());
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "photocat.log"));
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .and_then(stderr)
                .with_filter(env_filter),
        )
        .try_init()?;

    tracing::debug!(log_dir = %log_dir.display(), "Logging to file");
    Ok(())
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photocat")
        .join("logs")
}
