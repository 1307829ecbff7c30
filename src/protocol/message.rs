//! Outbound and inbound message envelopes

use crate::config::ConnectionOptions;
use crate::error::{CloudError, CloudResult};
use crate::protocol::payload::Payload;
use crate::protocol::topics::{encode_topic, Topic};
use crate::transport::QoS;

/// Where an outbound message goes
#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    /// Fully qualified topic, sent as is apart from placeholder substitution
    Topic(String),
    /// Application topic resolved against the connection options
    App {
        app_id: String,
        app_topic: String,
        control: bool,
        /// Target device level; `None` addresses this gateway
        device_id: Option<String>,
    },
}

impl Destination {
    /// Resolve to a full topic
    pub fn resolve(&self, options: &ConnectionOptions) -> CloudResult<String> {
        match self {
            Destination::Topic(topic) if topic.is_empty() => {
                Err(CloudError::invalid_destination("empty topic"))
            }
            Destination::Topic(topic) => Ok(topic.clone()),
            Destination::App { app_id, .. } if app_id.is_empty() => {
                Err(CloudError::invalid_destination("empty application id"))
            }
            Destination::App {
                app_id,
                app_topic,
                control,
                device_id,
            } => Ok(encode_topic(
                options,
                device_id.as_deref(),
                app_id,
                app_topic,
                *control,
            )),
        }
    }
}

/// Message handed to the coordinator for publishing
#[derive(Debug, Clone, PartialEq)]
pub struct CloudMessage {
    pub payload: Payload,
    pub destination: Destination,
    pub qos: QoS,
    pub retain: bool,
    pub priority: u8,
}

impl CloudMessage {
    /// Data message on `<account>/<client>/<app_id>/<app_topic>`
    pub fn to_app(app_id: &str, app_topic: &str, payload: Payload) -> Self {
        Self {
            payload,
            destination: Destination::App {
                app_id: app_id.to_string(),
                app_topic: app_topic.to_string(),
                control: false,
                device_id: None,
            },
            qos: QoS::AtMostOnce,
            retain: false,
            priority: 5,
        }
    }

    /// Message on an explicit topic
    pub fn to_topic(topic: &str, payload: Payload) -> Self {
        Self {
            payload,
            destination: Destination::Topic(topic.to_string()),
            qos: QoS::AtMostOnce,
            retain: false,
            priority: 5,
        }
    }

    /// Route through the control prefix
    pub fn control(mut self) -> Self {
        if let Destination::App { control, .. } = &mut self.destination {
            *control = true;
        }
        self
    }

    /// Address another device instead of this gateway
    pub fn for_device(mut self, device: &str) -> Self {
        if let Destination::App { device_id, .. } = &mut self.destination {
            *device_id = Some(device.to_string());
        }
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retained(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Decoded inbound message delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub topic: Topic,
    pub payload: Payload,
    pub qos: QoS,
    pub retained: bool,
}
