//! Observability: structured logging setup and span macros

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat, LoggingConfig};

// Span macros for structured logging
pub use logging::{cloud_span, lifecycle_span, mqtt_span};
