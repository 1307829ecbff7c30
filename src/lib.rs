//! Cloudlink - cloud connection core for IoT edge gateways
//!
//! A gateway keeps exactly one MQTT connection to its cloud platform and shares
//! it between local applications. This crate provides:
//! - Topic grammar for control and data topics with placeholder substitution
//! - Payload codecs (protobuf-wire with optional gzip, simple JSON)
//! - Birth, disconnect and application-list lifecycle certificates
//! - Debounced certificate republishing
//! - Bounded tracking of confirmed publishes
//! - Request dispatch to registered application handlers with replies
//! - An MQTT v5 transport with reconnection backoff
//!
//! # Quick Start
//!
//! ```rust
//! use cloudlink::config::ConnectionOptions;
//! use cloudlink::protocol::{CloudMessage, Payload, Topic};
//!
//! let options = ConnectionOptions::default();
//!
//! // Outbound: data message for an application, resolved against the options
//! let message = CloudMessage::to_app("HEATER", "temperature", Payload::now().with_metric("celsius", 21.5));
//! let topic = message.destination.resolve(&options).unwrap();
//! assert_eq!(topic, "#account-name/#client-id/HEATER/temperature");
//!
//! // Inbound: control topics are split into their levels
//! let topic = Topic::parse("$EDC/acme/gw-01/CONF-V1/GET/configurations", &options);
//! assert_eq!(topic.app_id, "CONF-V1");
//! assert!(topic.is_control(&options));
//! ```

pub mod cloud;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use cloud::{CloudConnection, ConnectionState, GatewayEvent, MessageVerifier, RequestHandler};
pub use config::*;
pub use error::{CloudError, CloudResult};
pub use protocol::*;
pub use transport::mqtt::MqttClient;
pub use transport::{DeliveryId, QoS, Transport};
