//! Logging setup for the gateway daemon
//!
//! Configuration comes from the environment:
//!
//! | variable     | values                       | default |
//! |--------------|------------------------------|---------|
//! | `LOG_LEVEL`  | error, warn, info, debug, trace | info |
//! | `LOG_FORMAT` | json, pretty, compact        | json    |
//! | `LOG_SPANS`  | true / false                 | false   |
//! | `RUST_LOG`   | full `EnvFilter` directives, replaces the level and the dependency quieting | |
//!
//! JSON output flattens event fields to the top level so gateway log shippers
//! can index `delivery_id`, `app_id` and `topic` directly.

use std::env;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Chatty dependencies kept at warn unless `RUST_LOG` says otherwise
const QUIET_DEPENDENCIES: [&str; 3] = ["rumqttc=warn", "mio=warn", "tokio=warn"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Resolved logging settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
    /// Raw `RUST_LOG`, used verbatim when present
    pub directives: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            include_spans: false,
            directives: None,
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source; unparsable values keep their defaults
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let defaults = Self::default();
        Self {
            level: lookup("LOG_LEVEL")
                .and_then(|v| Level::from_str(v.trim()).ok())
                .unwrap_or(defaults.level),
            format: lookup("LOG_FORMAT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.format),
            include_spans: lookup("LOG_SPANS")
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.include_spans),
            directives: lookup("RUST_LOG").filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn filter(&self) -> EnvFilter {
        if let Some(directives) = &self.directives {
            return EnvFilter::new(directives);
        }
        QUIET_DEPENDENCIES
            .iter()
            .filter_map(|directive| directive.parse().ok())
            .fold(EnvFilter::new(self.level.to_string()), |filter, directive| {
                filter.add_directive(directive)
            })
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TryInitError> {
    let registry = tracing_subscriber::registry().with(config.filter());

    match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(config.include_spans)
                    .with_span_list(false)
                    .with_span_events(config.span_events()),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_span_events(config.span_events()))
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_span_events(config.span_events()),
            )
            .try_init(),
    }
}

pub fn init_default_logging() -> Result<(), TryInitError> {
    init_logging(&LoggingConfig::from_env())
}

/// Span around a coordinator operation (publish, request dispatch)
#[macro_export]
macro_rules! cloud_span {
    ($($field:tt)*) => {
        tracing::info_span!("cloud", $($field)*)
    };
}

/// Span around the MQTT supervisor and its broker session
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt", $($field)*)
    };
}

/// Span around a birth, disconnect or app-list certificate
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle", $($field)*)
    };
}

pub use {cloud_span, lifecycle_span, mqtt_span};
