//! Gateway configuration
//!
//! `ConnectionOptions` is the immutable snapshot the coordinator reads on every
//! publish and inbound message. `GatewayConfig` is the TOML file the binary loads;
//! it wraps the options together with the broker and device sections.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::transport::QoS;

/// Payload encoding used for every outbound message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadEncoding {
    /// Protobuf-wire compatible binary payload
    #[default]
    KuraProtobuf,
    /// JSON payload `{sentOn, position, metrics, body}`
    SimpleJson,
}

impl PayloadEncoding {
    /// Name advertised in the birth certificate
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadEncoding::KuraProtobuf => "kura-protobuf",
            PayloadEncoding::SimpleJson => "simple-json",
        }
    }
}

/// Cloud connection options, replaced wholesale on reconfiguration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionOptions {
    /// First segment of every control topic
    pub control_prefix: String,
    pub topic_separator: String,
    /// Placeholder substituted with the account name by the transport
    pub account_token: String,
    /// Placeholder substituted with the client id by the transport
    pub client_id_token: String,
    pub topic_wildcard: String,
    pub payload_encoding: PayloadEncoding,
    pub encode_gzip: bool,
    pub enable_default_subscriptions: bool,
    pub republish_birth_on_gps_lock: bool,
    pub republish_birth_on_tamper: bool,
    pub lifecycle_qos: u8,
    pub lifecycle_retain: bool,
    pub lifecycle_priority: u8,
    pub birth_suffix: String,
    pub disconnect_suffix: String,
    /// Defaults to the birth suffix: the application list is a resent birth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_list_suffix: Option<String>,
    /// Debounce window for birth and app-list republishes
    pub republish_delay_secs: u64,
    /// Upper bound on the wait for a tracked delivery confirmation
    pub delivery_wait_ms: u64,
    /// Grace period handed to the transport on disconnect
    pub disconnect_grace_secs: u64,
    /// Worker tasks executing request handlers
    pub dispatch_workers: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            control_prefix: "$EDC".to_string(),
            topic_separator: "/".to_string(),
            account_token: "#account-name".to_string(),
            client_id_token: "#client-id".to_string(),
            topic_wildcard: "#".to_string(),
            payload_encoding: PayloadEncoding::default(),
            encode_gzip: true,
            enable_default_subscriptions: true,
            republish_birth_on_gps_lock: false,
            republish_birth_on_tamper: true,
            lifecycle_qos: 1,
            lifecycle_retain: false,
            lifecycle_priority: 0,
            birth_suffix: "MQTT/BIRTH".to_string(),
            disconnect_suffix: "MQTT/DC".to_string(),
            app_list_suffix: None,
            republish_delay_secs: 30,
            delivery_wait_ms: 1000,
            disconnect_grace_secs: 10,
            dispatch_workers: 2,
        }
    }
}

impl ConnectionOptions {
    /// Reject options the coordinator cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control_prefix.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "control_prefix must not be empty".to_string(),
            ));
        }
        if self.topic_separator.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "topic_separator must not be empty".to_string(),
            ));
        }
        if self.control_prefix.contains(&self.topic_separator) {
            return Err(ConfigError::InvalidConfig(format!(
                "control_prefix '{}' must not contain the topic separator",
                self.control_prefix
            )));
        }
        if self.account_token.is_empty() || self.client_id_token.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "account and client id tokens must not be empty".to_string(),
            ));
        }
        if QoS::try_from(self.lifecycle_qos).is_err() {
            return Err(ConfigError::InvalidConfig(format!(
                "lifecycle_qos must be 0, 1 or 2, got {}",
                self.lifecycle_qos
            )));
        }
        for (name, suffix) in [
            ("birth_suffix", self.birth_suffix.as_str()),
            ("disconnect_suffix", self.disconnect_suffix.as_str()),
            ("app_list_suffix", self.app_list_suffix()),
        ] {
            if suffix.is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must not be empty"
                )));
            }
        }
        if self.dispatch_workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "dispatch_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn app_list_suffix(&self) -> &str {
        self.app_list_suffix.as_deref().unwrap_or(&self.birth_suffix)
    }

    pub fn lifecycle_qos(&self) -> QoS {
        QoS::try_from(self.lifecycle_qos).unwrap_or(QoS::AtLeastOnce)
    }

    pub fn republish_delay(&self) -> Duration {
        Duration::from_secs(self.republish_delay_secs)
    }

    pub fn delivery_wait(&self) -> Duration {
        Duration::from_millis(self.delivery_wait_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// MQTT client identifier, substituted for the client id token
    pub client_id: String,
    /// Account the gateway belongs to, substituted for the account token
    pub account_name: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
}

fn default_keep_alive() -> u64 {
    30
}

fn default_clean_session() -> bool {
    true
}

/// Static device identity used when no platform provider is wired in
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceSection {
    pub display_name: Option<String>,
    pub model_name: Option<String>,
    pub model_id: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub connection_interface: Option<String>,
}

/// Top-level gateway configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub cloud: ConnectionOptions,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub device: DeviceSection,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid client id format: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GatewayConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cloud.validate()?;
        validate_topic_level("client_id", &self.mqtt.client_id)?;
        validate_topic_level("account_name", &self.mqtt.account_name)?;

        let url = url::Url::parse(&self.mqtt.broker_url)
            .map_err(|e| ConfigError::InvalidBrokerUrl(format!("{}: {e}", self.mqtt.broker_url)))?;
        if !matches!(url.scheme(), "mqtt" | "tcp" | "mqtts" | "ssl") {
            return Err(ConfigError::InvalidBrokerUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidBrokerUrl(format!(
                "missing host in '{}'",
                self.mqtt.broker_url
            )));
        }
        Ok(())
    }

    /// Get MQTT username from environment variable
    pub fn mqtt_username(&self) -> Option<String> {
        Self::env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn mqtt_password(&self) -> Option<String> {
        Self::env_var_optional(self.mqtt.password_env.as_ref())
    }

    fn env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }
}

/// Client ids and account names become topic levels, so wildcard and separator
/// characters are rejected.
fn validate_topic_level(field: &str, value: &str) -> Result<(), ConfigError> {
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' || c == ':');

    if value.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "{field} '{value}' must match pattern [a-zA-Z0-9._:-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[cloud]
control_prefix = "$EDC"
payload_encoding = "simple-json"
encode_gzip = false
republish_delay_secs = 5

[mqtt]
broker_url = "mqtt://localhost:1883"
client_id = "gw-01"
account_name = "acme"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"

[device]
display_name = "Yard gateway"
serial_number = "SN-1234"
"#;

        let config: GatewayConfig = toml::from_str(toml_content).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.cloud.payload_encoding, PayloadEncoding::SimpleJson);
        assert!(!config.cloud.encode_gzip);
        assert_eq!(config.cloud.republish_delay(), Duration::from_secs(5));
        assert_eq!(config.cloud.birth_suffix, "MQTT/BIRTH");
        assert_eq!(config.mqtt.keep_alive_secs, 30);
        assert_eq!(config.device.display_name.as_deref(), Some("Yard gateway"));
        assert_eq!(config.device.model_name, None);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let toml_content = r#"
[mqtt]
broker_url = "mqtt://broker.local:1883"
client_id = "gw-02"
account_name = "acme"
"#;

        let config: GatewayConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.cloud, ConnectionOptions::default());
        assert_eq!(config.cloud.lifecycle_qos(), QoS::AtLeastOnce);
        assert_eq!(config.cloud.delivery_wait(), Duration::from_millis(1000));
        assert_eq!(config.cloud.dispatch_workers, 2);
        assert_eq!(config.device, DeviceSection::default());
    }

    #[test]
    fn test_invalid_client_id() {
        assert!(validate_topic_level("client_id", "gw/01").is_err());
        assert!(validate_topic_level("client_id", "gw+01").is_err());
        assert!(validate_topic_level("client_id", "").is_err());
        assert!(validate_topic_level("client_id", "00:11:22:AA:BB:CC").is_ok());
    }

    #[test]
    fn test_options_validation() {
        let mut options = ConnectionOptions::default();
        assert!(options.validate().is_ok());

        options.lifecycle_qos = 3;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));

        let mut options = ConnectionOptions::default();
        options.control_prefix = "$EDC/x".to_string();
        assert!(options.validate().is_err());

        let mut options = ConnectionOptions::default();
        options.dispatch_workers = 0;
        assert!(options.validate().is_err());

        let mut options = ConnectionOptions::default();
        options.app_list_suffix = Some(String::new());
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_broker_url_validation() {
        let toml_content = r#"
[mqtt]
broker_url = "http://localhost:1883"
client_id = "gw-01"
account_name = "acme"
"#;
        let config: GatewayConfig = toml::from_str(toml_content).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_missing_mqtt_section_fails_to_parse() {
        let result: Result<GatewayConfig, _> = toml::from_str("[cloud]\nencode_gzip = true\n");
        assert!(result.is_err());
    }
}
