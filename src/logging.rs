//! Diagnostic tracing for the engine.
//!
//! Tracing output is controlled by `RUST_LOG` and is not a product artifact.
//! Rollback audit logs, agent outputs and validation reports are written as
//! files under the run directory regardless of the filter.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_FILTER: &str = "ratchet=info,warn";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub format: LogFormat,
    /// Also write plain-text logs into this directory.
    pub log_dir: Option<PathBuf>,
    pub file_name: String,
    /// Used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            log_dir: None,
            file_name: "ratchet.log".to_string(),
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process, or buffered
/// file output is lost. Calling this twice returns an error.
pub fn init(options: LogOptions) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));

    let stderr_layer = match options.format {
        LogFormat::Compact => fmt::layer().with_writer(std::io::stderr).compact().boxed(),
        LogFormat::Json => fmt::layer().with_writer(std::io::stderr).json().boxed(),
    };

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, &options.file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_once_then_error() {
        let dir = tempdir().unwrap();
        let options = LogOptions {
            log_dir: Some(dir.path().join("logs")),
            ..LogOptions::default()
        };
        let guard = init(options.clone()).unwrap();
        assert!(guard.is_some());
        assert!(dir.path().join("logs").is_dir());

        assert!(init(options).is_err());
    }
}
