//! Tracing initialisation for rig applications.
//!
//! Sets up a `tracing-subscriber` registry with one `fmt` layer in the
//! configured [`OutputFormat`]. `RUST_LOG`, when set, overrides the configured
//! level.
//!
//! # Example
//! ```no_run
//! use rust_ephys::logging::{self, OutputFormat, TracingConfig};
//! use tracing::{info, Level};
//!
//! # fn main() -> anyhow::Result<()> {
//! logging::init(&TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Compact))?;
//! info!(device = "pipette1", "rig ready");
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, coloured output for development.
    #[default]
    Pretty,
    /// One line per event, no colours.
    Compact,
    /// JSON objects for log aggregation.
    Json,
}

/// Logging options, usually the `[logging]` table of the rig config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`.
    pub level: String,
    /// Output format.
    pub format: OutputFormat,
    /// Include thread names. Task and state-handler threads are named after
    /// their device, so this is on by default.
    pub with_thread_names: bool,
    /// Include source file and line.
    pub with_file_and_line: bool,
    /// Colour pretty output.
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: OutputFormat::Pretty,
            with_thread_names: true,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level: level.as_str().to_lowercase(),
            ..Default::default()
        }
    }

    /// Set the output format.
    #[must_use]
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colours.
    #[must_use]
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// The configured level.
    pub fn level(&self) -> Result<Level> {
        parse_log_level(&self.level)
    }
}

/// Install the global subscriber.
///
/// Calling it again after a subscriber is installed is not an error, so tests
/// and embedding applications can call it freely.
pub fn init(config: &TracingConfig) -> Result<()> {
    let level = config.level()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let layer = fmt::layer()
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);
    let layer = match config.format {
        OutputFormat::Pretty => layer.pretty().with_ansi(config.with_ansi).with_filter(filter).boxed(),
        OutputFormat::Compact => layer.compact().with_ansi(false).with_filter(filter).boxed(),
        OutputFormat::Json => layer.json().with_ansi(false).with_filter(filter).boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("a global default trace dispatcher has already been set") => Ok(()),
        Err(e) => Err(anyhow!("failed to initialize tracing: {e}")),
    }
}

/// Parse a case-insensitive level name.
pub fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow!(
            "invalid log level '{level}'; must be one of: trace, debug, info, warn, error"
        )),
    }
}
