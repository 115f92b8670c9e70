use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingConfig;

/// Initializes console logging, plus a daily-rotated file under `logs_dir`
/// when the config asks for one.
///
/// The returned guard (if any) must be kept alive for the duration of the
/// process.
pub fn init_logging(config: &LoggingConfig, logs_dir: &Path) -> Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let (file_layer, guard) = if config.to_file {
        std::fs::create_dir_all(logs_dir)?;
        let file_appender = tracing_appender::rolling::daily(logs_dir, "kite");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(false)
            .with_writer(non_blocking);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact(),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let logs_dir = tmp.path().join("nested").join("logs");
        let config = LoggingConfig {
            filter: "warn".into(),
            to_file: true,
            dir: Some(logs_dir.clone()),
        };

        // Only one global subscriber per process; a second install fails
        // but the directory is still created first.
        let result = init_logging(&config, &logs_dir);
        assert!(logs_dir.exists());
        if let Err(e) = result {
            assert!(e.to_string().contains("logging"), "unexpected error: {e}");
        }
    }

    #[test]
    fn test_console_only_does_not_touch_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let logs_dir = tmp.path().join("unused");
        let config = LoggingConfig {
            to_file: false,
            ..LoggingConfig::default()
        };

        if let Ok(guard) = init_logging(&config, &logs_dir) {
            assert!(guard.is_none());
        }
        assert!(!logs_dir.exists());
    }
}
