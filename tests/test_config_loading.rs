//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.

use cloudlink::config::{ConfigError, GatewayConfig, PayloadEncoding};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[cloud]
control_prefix = "$EDC"
payload_encoding = "kura-protobuf"
republish_delay_secs = 15
enable_default_subscriptions = false

[mqtt]
broker_url = "mqtts://broker.example.com"
client_id = "00:11:22:AA:BB:CC"
account_name = "acme"
username_env = "MQTT_USER"
password_env = "MQTT_PASS"

[device]
display_name = "Yard gateway"
"#,
    );

    let config = GatewayConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.cloud.payload_encoding, PayloadEncoding::KuraProtobuf);
    assert_eq!(config.cloud.republish_delay(), Duration::from_secs(15));
    assert!(!config.cloud.enable_default_subscriptions);
    assert_eq!(config.mqtt.client_id, "00:11:22:AA:BB:CC");
    assert_eq!(config.mqtt.username_env.as_deref(), Some("MQTT_USER"));
    assert_eq!(config.device.display_name.as_deref(), Some("Yard gateway"));
}

#[test]
fn test_config_missing_file_is_a_read_error() {
    let result = GatewayConfig::load_from_file(std::path::Path::new("/nonexistent/cloudlink.toml"));

    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_malformed_toml_is_a_parse_error() {
    let temp_file = write_config("[mqtt\nbroker_url = ");

    let result = GatewayConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_rejects_wildcards_in_client_id() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
client_id = "gw/#"
account_name = "acme"
"#,
    );

    let result = GatewayConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidClientId(_))));
}

#[test]
fn test_config_rejects_invalid_cloud_options() {
    let temp_file = write_config(
        r#"
[cloud]
lifecycle_qos = 5

[mqtt]
broker_url = "mqtt://localhost:1883"
client_id = "gw-01"
account_name = "acme"
"#,
    );

    let result = GatewayConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_credentials_come_from_environment() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
client_id = "gw-01"
account_name = "acme"
username_env = "CLOUDLINK_TEST_USER_7F3A"
password_env = "CLOUDLINK_TEST_PASS_UNSET_7F3A"
"#,
    );
    std::env::set_var("CLOUDLINK_TEST_USER_7F3A", "gateway");

    let config = GatewayConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt_username().as_deref(), Some("gateway"));
    assert_eq!(config.mqtt_password(), None);
}
