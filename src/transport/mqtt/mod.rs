//! MQTT transport backed by rumqttc (MQTT v5)
//!
//! This module separates pure functions from I/O operations for better
//! testability.
//!
//! # Architecture
//!
//! - [`connection`] - Pure connection configuration, link state and reconnection policy
//! - [`message_handler`] - Pure event routing and delivery-id bookkeeping
//! - [`client`] - Impure I/O operations and the reconnecting event loop
//!
//! # Usage
//!
//! ```rust,no_run
//! use cloudlink::config::{ConnectionOptions, MqttSection};
//! use cloudlink::transport::mqtt::MqttClient;
//! use cloudlink::transport::Transport;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mqtt = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     client_id: "gw-01".to_string(),
//!     account_name: "acme".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     keep_alive_secs: 30,
//!     clean_session: true,
//! };
//!
//! let client = MqttClient::new(&mqtt, &ConnectionOptions::default())?;
//! client.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

// Re-export public types for convenience
pub use client::MqttClient;
pub use connection::{LinkState, ReconnectConfig, ReconnectionDecision, TopicTokens};
pub use message_handler::{DeliveryQueue, EventRoute, MessageHandler};
