//! Pure connection configuration, link state and reconnection policy
//!
//! Everything here is free of I/O so it can be tested without a broker.

use crate::config::{ConnectionOptions, MqttSection};
use crate::transport::{QoS, TransportError};
use rumqttc::v5::{mqttbytes::QoS as MqttQoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;

/// How long `connect` waits for the broker's ConnAck
pub const CONNACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Request channel capacity between the client handle and the event loop
pub const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Link state as seen by the adapter
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    /// No connection requested yet
    Idle,
    Connecting,
    Connected,
    Disconnected(String),
    Reconnecting(u32),
    /// Reconnection attempts exhausted
    PermanentlyDisconnected(String),
}

impl LinkState {
    pub fn can_publish(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

/// Reconnection backoff configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay used once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![250, 500, 1000, 2500, 5000],
            sustained_delay: 10_000,
        }
    }
}

/// Decision for the next reconnection attempt
#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

impl ReconnectConfig {
    /// Delay before the given 1-based attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    pub fn decide(&self, current_attempts: u32, shutdown_requested: bool) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if let Some(max_attempts) = self.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }
        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: self.calculate_backoff_delay(attempt),
        }
    }
}

/// Broker-facing replacement of the account and client placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTokens {
    separator: String,
    account_token: String,
    client_token: String,
    account: String,
    client_id: String,
}

impl TopicTokens {
    pub fn new(options: &ConnectionOptions, mqtt: &MqttSection) -> Self {
        Self {
            separator: options.topic_separator.clone(),
            account_token: options.account_token.clone(),
            client_token: options.client_id_token.clone(),
            account: mqtt.account_name.clone(),
            client_id: mqtt.client_id.clone(),
        }
    }

    /// Replace whole levels equal to a placeholder
    pub fn substitute(&self, topic: &str) -> String {
        topic
            .split(self.separator.as_str())
            .map(|level| {
                if level == self.account_token {
                    self.account.as_str()
                } else if level == self.client_token {
                    self.client_id.as_str()
                } else {
                    level
                }
            })
            .collect::<Vec<_>>()
            .join(&self.separator)
    }
}

pub fn to_mqtt_qos(qos: QoS) -> MqttQoS {
    match qos {
        QoS::AtMostOnce => MqttQoS::AtMostOnce,
        QoS::AtLeastOnce => MqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => MqttQoS::ExactlyOnce,
    }
}

pub fn from_mqtt_qos(qos: MqttQoS) -> QoS {
    match qos {
        MqttQoS::AtMostOnce => QoS::AtMostOnce,
        MqttQoS::AtLeastOnce => QoS::AtLeastOnce,
        MqttQoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn is_tls_scheme(scheme: &str) -> bool {
    matches!(scheme, "mqtts" | "ssl")
}

/// Build rumqttc options from the `[mqtt]` section
pub fn configure_mqtt_options(config: &MqttSection) -> Result<MqttOptions, TransportError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| TransportError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let tls = is_tls_scheme(url.scheme());
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(config.client_id.clone(), host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(username, password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    mqtt_options.set_clean_start(config.clean_session);
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mqtt_section(broker_url: &str) -> MqttSection {
        MqttSection {
            broker_url: broker_url.to_string(),
            client_id: "gw-01".to_string(),
            account_name: "acme".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 30,
            clean_session: true,
        }
    }

    #[test]
    fn test_backoff_pattern_then_sustained() {
        let config = ReconnectConfig::default();

        assert_eq!(config.calculate_backoff_delay(1), 250);
        assert_eq!(config.calculate_backoff_delay(5), 5000);
        assert_eq!(config.calculate_backoff_delay(6), 10_000);
        assert_eq!(config.calculate_backoff_delay(100), 10_000);
    }

    #[test]
    fn test_reconnection_decision() {
        let config = ReconnectConfig {
            max_attempts: Some(2),
            ..Default::default()
        };

        assert_eq!(
            config.decide(0, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 250
            }
        );
        assert_eq!(config.decide(2, false), ReconnectionDecision::AbortMaxAttemptsExceeded);
        assert_eq!(config.decide(0, true), ReconnectionDecision::AbortShutdownRequested);
        assert!(matches!(
            ReconnectConfig::default().decide(1000, false),
            ReconnectionDecision::Proceed { attempt: 1001, .. }
        ));
    }

    #[test]
    fn test_token_substitution_is_level_wise() {
        let tokens = TopicTokens::new(&ConnectionOptions::default(), &mqtt_section("mqtt://h"));

        assert_eq!(
            tokens.substitute("$EDC/#account-name/#client-id/MQTT/BIRTH"),
            "$EDC/acme/gw-01/MQTT/BIRTH"
        );
        assert_eq!(tokens.substitute("#account-name/console/#"), "acme/console/#");
        assert_eq!(tokens.substitute("a/x#account-name/b"), "a/x#account-name/b");
    }

    #[test]
    fn test_qos_mapping() {
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
            assert_eq!(from_mqtt_qos(to_mqtt_qos(qos)), qos);
        }
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = configure_mqtt_options(&mqtt_section("mqtt://broker.local:1884")).unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.client_id(), "gw-01");
    }

    #[test]
    fn test_tls_default_port() {
        let options = configure_mqtt_options(&mqtt_section("mqtts://broker.local")).unwrap();
        assert_eq!(options.broker_address().1, 8883);
    }

    #[test]
    fn test_invalid_broker_url() {
        let result = configure_mqtt_options(&mqtt_section("invalid-url"));
        assert!(matches!(result, Err(TransportError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_link_state_publishable() {
        assert!(LinkState::Connected.can_publish());
        assert!(!LinkState::Reconnecting(2).can_publish());
        assert!(!LinkState::Idle.can_publish());
    }
}
