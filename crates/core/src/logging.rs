//! Tracing subscriber setup

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::fmt::{self, writer::BoxMakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Output format of log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::InvalidConfig(format!(
                "Unknown log format '{}' (expected pretty, compact or json)",
                other
            ))),
        }
    }
}

/// Build the level filter; `RUST_LOG` wins over the configured level
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("b2pilot_core={}", config.level)))
        .map_err(|e| Error::InvalidConfig(format!("Failed to create log filter: {}", e)))
}

/// Install the global subscriber.
///
/// Logs go to stderr unless `file` is set, in which case they are appended
/// to that file without ANSI colors. Fails if a subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let format = LogFormat::from_str(&config.format)?;
    let filter = env_filter(config)?;

    let (writer, ansi) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::Config(format!("Failed to open log file {}: {}", path, e)))?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_writer(writer).with_ansi(ansi))
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(true)
                    .with_writer(writer)
                    .with_ansi(ansi),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .try_init(),
    };

    installed.map_err(|e| Error::Config(format!("Failed to install logger: {}", e)))
}
