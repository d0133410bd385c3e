//! Logging setup shared by the autopost binaries
//!
//! Everything goes to stderr so `autopost-queue --format json` output on
//! stdout stays machine readable. The format and level come from the command
//! line first, then `AUTOPOST_LOG_FORMAT` / `AUTOPOST_LOG_LEVEL`, and a
//! `RUST_LOG` directive overrides the level entirely.
//!
//! ```no_run
//! use libautopost::logging::{LogFormat, LoggingConfig};
//!
//! LoggingConfig::from_env(false).with_format(LogFormat::Json).init();
//! ```

use std::str::FromStr;
use tracing_subscriber::EnvFilter;

pub const FORMAT_ENV: &str = "AUTOPOST_LOG_FORMAT";
pub const LEVEL_ENV: &str = "AUTOPOST_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain lines without colors
    #[default]
    Text,
    /// One JSON object per line
    Json,
    /// Multi-line with colors, for development
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: impl Into<String>) -> Self {
        Self {
            format,
            level: level.into(),
        }
    }

    /// Read format and level from the environment; `verbose` forces debug
    ///
    /// An unparseable format falls back to text rather than refusing to start.
    pub fn from_env(verbose: bool) -> Self {
        let format = std::env::var(FORMAT_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let level = if verbose {
            "debug".to_string()
        } else {
            std::env::var(LEVEL_ENV).unwrap_or_else(|_| "info".to_string())
        };

        Self { format, level }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }

    /// Install the global subscriber
    ///
    /// Returns `false` if one was already installed (tests, embedding).
    pub fn init(&self) -> bool {
        let filter = self.filter();

        let result = match self.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .flatten_event(true)
                .with_target(true)
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_line_number(true)
                .with_file(true)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(false)
                .try_init(),
        };

        result.is_ok()
    }
}
