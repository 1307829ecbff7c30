//! Pure routing of rumqttc events and delivery-id bookkeeping
//!
//! rumqttc reports outgoing publishes by packet id, which is only assigned
//! inside the event loop. [`DeliveryQueue`] pairs those reports with the
//! delivery ids handed out by `publish`, relying on the event loop emitting
//! publishes in request order.

use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use super::connection::from_mqtt_qos;
use crate::transport::{DeliveryId, QoS};

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    /// A publish left the client with this packet id (0 for QoS 0)
    PublishSent { packet_id: u16 },
    /// QoS 1 PubAck or QoS 2 PubComp
    PublishConfirmed { packet_id: u16 },
    /// Broker sent DISCONNECT
    Disconnected,
    /// Our DISCONNECT went out
    DisconnectSent,
    SubscriptionConfirmed { packet_id: u16, failed: bool },
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                    qos: from_mqtt_qos(publish.qos),
                    retain: publish.retain,
                },
                Packet::PubAck(puback) => EventRoute::PublishConfirmed {
                    packet_id: puback.pkid,
                },
                Packet::PubComp(pubcomp) => EventRoute::PublishConfirmed {
                    packet_id: pubcomp.pkid,
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    failed: suback
                        .return_codes
                        .iter()
                        .any(|code| !matches!(code, SubscribeReasonCode::Success(_))),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(packet_id)) => EventRoute::PublishSent {
                packet_id: *packet_id,
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Queued {
    id: DeliveryId,
    topic: String,
    qos: QoS,
}

/// Publishes handed to rumqttc, in request order, and those awaiting a broker ack
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    queued: VecDeque<Queued>,
    in_flight: HashMap<u16, (DeliveryId, String)>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a publish about to be handed to the client
    pub fn push(&mut self, id: DeliveryId, topic: &str, qos: QoS) {
        self.queued.push_back(Queued {
            id,
            topic: topic.to_string(),
            qos,
        });
    }

    /// Forget a publish the client refused
    pub fn remove(&mut self, id: DeliveryId) {
        self.queued.retain(|queued| queued.id != id);
    }

    /// The oldest queued publish went out as `packet_id`
    pub fn on_sent(&mut self, packet_id: u16) -> Option<(DeliveryId, String)> {
        let queued = self.queued.pop_front()?;
        if queued.qos != QoS::AtMostOnce {
            self.in_flight
                .insert(packet_id, (queued.id, queued.topic.clone()));
        }
        Some((queued.id, queued.topic))
    }

    /// The broker confirmed `packet_id`
    pub fn on_confirmed(&mut self, packet_id: u16) -> Option<(DeliveryId, String)> {
        let confirmed = self.in_flight.remove(&packet_id);
        if confirmed.is_none() {
            debug!(packet_id, "Confirmation for an untracked packet");
        }
        confirmed
    }

    /// Publishes not yet confirmed
    pub fn pending(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    /// Drop everything; used when the session is torn down
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending();
        self.queued.clear();
        self.in_flight.clear();
        dropped
    }
}
