//! Logging initialization.
//!
//! All diagnostics go through `tracing`. The subscriber is installed once in
//! `main` from the `[log]` section, with `LOG_LEVEL` / `LOG_FORMAT` taking
//! precedence when set. Command summaries are still printed to stdout.

use anyhow::Result;
use serde::Deserialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(anyhow::anyhow!("Invalid log level: {}", s)),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

/// Apply `LOG_LEVEL` and `LOG_FORMAT` over the configured values.
pub fn effective_settings(settings: &LogSettings) -> Result<LogSettings> {
    let mut out = settings.clone();
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        out.level = level.parse()?;
    }
    if let Ok(format) = std::env::var("LOG_FORMAT") {
        out.format = format.parse()?;
    }
    Ok(out)
}

/// Build the filter: base level plus any extra directives.
pub fn build_filter(settings: &LogSettings) -> Result<EnvFilter> {
    let mut directives = settings.level.to_string();
    if let Some(extra) = &settings.filter {
        directives.push(',');
        directives.push_str(extra);
    }
    Ok(EnvFilter::try_new(directives)?)
}

/// Install the global subscriber. Logs go to stderr so stdout stays clean
/// for command output.
pub fn init_logging(settings: &LogSettings) -> Result<()> {
    let settings = effective_settings(settings)?;
    let filter = build_filter(&settings)?;

    let registry = tracing_subscriber::registry().with(filter);
    match settings.format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
    }
    Ok(())
}
