//! Logging bootstrap.
//!
//! Initializes tracing-subscriber with an env-filter and either pretty or
//! JSON output; with a log directory configured, output also rotates to
//! daily files via tracing-appender.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

use crate::infrastructure::config::LoggingSettings;

/// Keep the returned guard alive for the process lifetime; dropping it
/// flushes and stops the background writer.
pub fn init_logging(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .context("invalid log filter")?;

    match settings.directory.as_deref() {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "arbiter.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if settings.format == "json" {
                fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .json()
                    .try_init()
                    .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;
            } else {
                fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .try_init()
                    .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;
            }
            Ok(Some(guard))
        }
        None => {
            if settings.format == "json" {
                fmt()
                    .with_env_filter(filter)
                    .json()
                    .try_init()
                    .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;
            } else {
                fmt()
                    .with_env_filter(filter)
                    .try_init()
                    .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;
            }
            Ok(None)
        }
    }
}
