//! Structured logging initialization.
//!
//! `RUST_LOG` takes precedence over the configured level.

use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive, `info` or `orbkit=debug,info`.
    pub level: String,
    pub format: LogFormat,
    /// Include the event target (module path).
    pub target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Pretty,
            target: true,
        }
    }
}

impl LoggingConfig {
    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

fn filter(config: &LoggingConfig) -> EnvFilter {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(&config.level).unwrap_or_else(|err| {
            eprintln!("invalid log level {:?} ({err}), falling back to info", config.level);
            EnvFilter::new("info")
        })
    }
}

/// Installs the global subscriber. Returns `false` when one was already
/// installed, in which case nothing changes.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let registry = tracing_subscriber::registry().with(filter(config));
    let installed = match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(config.target))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_target(config.target))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(config.target))
            .try_init(),
    };
    installed.is_ok()
}
