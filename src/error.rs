//! Error types for the cloud connection core
//!
//! Each layer owns a focused error enum (`ConfigError`, `CodecError`,
//! `TransportError`); `CloudError` is the umbrella returned by the public
//! coordinator API.

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for cloud connection operations
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Payload codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Message verification failed on topic {topic}")]
    Validation { topic: String },

    #[error("Invalid destination: {message}")]
    InvalidDestination { message: String },

    #[error("Cloud connection has been shut down")]
    ShutDown,
}

impl CloudError {
    /// Create validation error
    pub fn validation<S: Into<String>>(topic: S) -> Self {
        Self::Validation {
            topic: topic.into(),
        }
    }

    /// Create invalid destination error
    pub fn invalid_destination<S: Into<String>>(message: S) -> Self {
        Self::InvalidDestination {
            message: message.into(),
        }
    }

    /// True when the failure originates from the transport connection
    pub fn is_connection_error(&self) -> bool {
        matches!(self, CloudError::Transport(_))
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("valid secret pattern")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("valid path pattern")
});

const MAX_REPORTED_MESSAGE_LEN: usize = 500;

/// Sanitize an error message before it leaves the gateway in a reply payload
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_REPORTED_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_REPORTED_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for cloud connection operations
pub type CloudResult<T> = Result<T, CloudError>;
