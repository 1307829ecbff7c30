//! Transport layer for the cloud connection
//!
//! This module provides the transport abstraction the coordinator drives and the
//! callback interface the transport reports back through. The MQTT
//! implementation lives in [`mqtt`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Weak;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

/// Delivery guarantee requested for a publish or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(TransportError::InvalidQos(other)),
        }
    }
}

/// Identifier the transport assigns to every accepted publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeliveryId(pub u64);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Publishing to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("Subscription to {filter} failed: {reason}")]
    SubscriptionFailed { filter: String, reason: String },
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),
    #[error("Permanently disconnected: {0}")]
    PermanentlyDisconnected(String),
}

/// Publish/subscribe connection driven by the coordinator
///
/// Implementations report connection and delivery events through the
/// [`TransportListener`] installed with [`Transport::set_listener`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the broker; completion is reported via `on_connection_established`
    async fn connect(&self) -> Result<(), TransportError>;

    /// Disconnect, allowing in-flight deliveries up to `grace` to complete
    async fn disconnect(&self, grace: Duration) -> Result<(), TransportError>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Hand a message to the transport; returns the delivery id used in later callbacks
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        priority: u8,
    ) -> Result<DeliveryId, TransportError>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Install the callback target. Held weakly so the transport never keeps its owner alive.
    fn set_listener(&self, listener: Weak<dyn TransportListener>);
}

/// Callbacks raised by a [`Transport`]
#[async_trait::async_trait]
pub trait TransportListener: Send + Sync {
    async fn on_connection_established(&self);

    /// Raised before a requested disconnect, while publishing is still possible
    async fn on_disconnecting(&self);

    async fn on_disconnected(&self);

    async fn on_connection_lost(&self, cause: String);

    async fn on_message_arrived(&self, topic: &str, payload: &[u8], qos: QoS, retained: bool);

    /// The message left the client
    async fn on_message_published(&self, id: DeliveryId, topic: &str);

    /// The broker acknowledged the message (QoS > 0)
    async fn on_message_confirmed(&self, id: DeliveryId, topic: &str);
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_conversion() {
        assert_eq!(QoS::try_from(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(QoS::try_from(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(QoS::try_from(3), Err(TransportError::InvalidQos(3))));
        assert_eq!(QoS::ExactlyOnce.as_u8(), 2);
    }

    #[test]
    fn test_transport_error_display() {
        let errors = vec![
            TransportError::NotConnected,
            TransportError::ConnectionFailed("refused".to_string()),
            TransportError::PublishFailed {
                topic: "a/b".to_string(),
                reason: "queue full".to_string(),
            },
            TransportError::SubscriptionFailed {
                filter: "a/#".to_string(),
                reason: "denied".to_string(),
            },
            TransportError::InvalidBrokerUrl("nope".to_string()),
            TransportError::PermanentlyDisconnected("gave up".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
