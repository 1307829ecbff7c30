//! Mock implementations for testing
//!
//! Provides a recording [`Transport`], recording listeners and a scriptable
//! [`RequestHandler`] so the coordinator can be exercised without a broker.

use crate::cloud::{
    ConnectionListener, DeliveryListener, RequestContext, RequestError, RequestHandler,
    SubscriberListener,
};
use crate::protocol::{Payload, ReceivedMessage};
use crate::transport::{DeliveryId, QoS, Transport, TransportError, TransportListener};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A publish handed to [`MockTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub id: DeliveryId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub priority: u8,
}

/// Mock transport for testing
///
/// Connection callbacks are awaited inline so tests observe their effects as
/// soon as `connect`/`disconnect` return. With auto-confirm enabled every
/// publish is acknowledged from a spawned task, never from inside `publish`.
pub struct MockTransport {
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    auto_confirm: AtomicBool,
    next_id: AtomicU64,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    published: Mutex<Vec<PublishedMessage>>,
    subscribed: Mutex<Vec<(String, QoS)>>,
    unsubscribed: Mutex<Vec<String>>,
    listener: RwLock<Option<Weak<dyn TransportListener>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            auto_confirm: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            listener: RwLock::new(None),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes are only acknowledged through [`confirm`](Self::confirm)
    pub fn manual() -> Self {
        let transport = Self::default();
        transport.auto_confirm.store(false, Ordering::SeqCst);
        transport
    }

    pub fn with_failure() -> Self {
        let transport = Self::default();
        transport.fail_connect.store(true, Ordering::SeqCst);
        transport.fail_publish.store(true, Ordering::SeqCst);
        transport
    }

    /// Flip the connected flag without raising callbacks
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_publish_failure(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_subscribe_failure(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Id handed out by the next publish
    pub fn set_next_id(&self, id: u64) {
        self.next_id.store(id, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    pub fn published_topics(&self) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .map(|message| message.topic.clone())
            .collect()
    }

    /// Published messages whose topic ends with `suffix`
    pub fn published_to(&self, suffix: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .iter()
            .filter(|message| message.topic.ends_with(suffix))
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscribed.lock().clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.unsubscribed.lock().clone()
    }

    pub fn clear_history(&self) {
        self.published.lock().clear();
        self.subscribed.lock().clear();
        self.unsubscribed.lock().clear();
    }

    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }

    // ========== CALLBACK HELPERS ==========

    /// Simulate the broker accepting the connection
    pub async fn establish(&self) {
        self.set_connected(true);
        if let Some(listener) = self.listener() {
            listener.on_connection_established().await;
        }
    }

    /// Simulate the link dropping
    pub async fn lose_connection(&self, cause: &str) {
        self.set_connected(false);
        if let Some(listener) = self.listener() {
            listener.on_connection_lost(cause.to_string()).await;
        }
    }

    /// Deliver an inbound message
    pub async fn arrive(&self, topic: &str, payload: &[u8]) {
        if let Some(listener) = self.listener() {
            listener
                .on_message_arrived(topic, payload, QoS::AtLeastOnce, false)
                .await;
        }
    }

    pub async fn mark_published(&self, id: DeliveryId, topic: &str) {
        if let Some(listener) = self.listener() {
            listener.on_message_published(id, topic).await;
        }
    }

    pub async fn confirm(&self, id: DeliveryId, topic: &str) {
        if let Some(listener) = self.listener() {
            listener.on_message_confirmed(id, topic).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "Mock connection failure".to_string(),
            ));
        }
        self.establish().await;
        Ok(())
    }

    async fn disconnect(&self, _grace: Duration) -> Result<(), TransportError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let listener = self.listener();
        if let Some(listener) = &listener {
            listener.on_disconnecting().await;
        }
        self.set_connected(false);
        if let Some(listener) = &listener {
            listener.on_disconnected().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        priority: u8,
    ) -> Result<DeliveryId, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: "Mock publish failure".to_string(),
            });
        }

        let id = DeliveryId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.published.lock().push(PublishedMessage {
            id,
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            priority,
        });

        if self.auto_confirm.load(Ordering::SeqCst) {
            if let Some(listener) = self.listener() {
                let topic = topic.to_string();
                tokio::spawn(async move {
                    listener.on_message_published(id, &topic).await;
                    if qos != QoS::AtMostOnce {
                        listener.on_message_confirmed(id, &topic).await;
                    }
                });
            }
        }
        Ok(id)
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::SubscriptionFailed {
                filter: filter.to_string(),
                reason: "Mock subscribe failure".to_string(),
            });
        }
        self.subscribed.lock().push((filter.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.unsubscribed.lock().push(filter.to_string());
        Ok(())
    }

    fn set_listener(&self, listener: Weak<dyn TransportListener>) {
        *self.listener.write() = Some(listener);
    }
}

/// Subscriber that keeps every message it receives
#[derive(Default)]
pub struct RecordingSubscriber {
    messages: Mutex<Vec<ReceivedMessage>>,
}

impl RecordingSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<ReceivedMessage> {
        self.messages.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }
}

impl SubscriberListener for RecordingSubscriber {
    fn on_message_arrived(&self, message: &ReceivedMessage) {
        self.messages.lock().push(message.clone());
    }
}

/// Connection listener that records callback names in order
#[derive(Default)]
pub struct RecordingConnectionListener {
    events: Mutex<Vec<&'static str>>,
}

impl RecordingConnectionListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }
}

impl ConnectionListener for RecordingConnectionListener {
    fn on_connection_established(&self) {
        self.events.lock().push("established");
    }

    fn on_disconnected(&self) {
        self.events.lock().push("disconnected");
    }

    fn on_connection_lost(&self) {
        self.events.lock().push("lost");
    }
}

/// Delivery listener that records hand-offs and confirmations
#[derive(Default)]
pub struct RecordingDeliveryListener {
    published: Mutex<Vec<(DeliveryId, String)>>,
    confirmed: Mutex<Vec<(DeliveryId, String)>>,
}

impl RecordingDeliveryListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published(&self) -> Vec<(DeliveryId, String)> {
        self.published.lock().clone()
    }

    pub fn confirmed(&self) -> Vec<(DeliveryId, String)> {
        self.confirmed.lock().clone()
    }
}

impl DeliveryListener for RecordingDeliveryListener {
    fn on_message_published(&self, id: DeliveryId, topic: &str) {
        self.published.lock().push((id, topic.to_string()));
    }

    fn on_message_confirmed(&self, id: DeliveryId, topic: &str) {
        self.confirmed.lock().push((id, topic.to_string()));
    }
}

#[derive(Debug, Clone)]
enum Behaviour {
    Reply(Payload),
    BadRequest(String),
    NotFound(String),
    Fail(String),
    Panic,
}

/// Request handler with a scripted answer that records what it was asked
pub struct MockRequestHandler {
    behaviour: Behaviour,
    delay: Option<Duration>,
    requests: Mutex<Vec<(RequestContext, Payload)>>,
}

impl MockRequestHandler {
    fn with_behaviour(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(payload: Payload) -> Self {
        Self::with_behaviour(Behaviour::Reply(payload))
    }

    pub fn bad_request(message: &str) -> Self {
        Self::with_behaviour(Behaviour::BadRequest(message.to_string()))
    }

    pub fn not_found(message: &str) -> Self {
        Self::with_behaviour(Behaviour::NotFound(message.to_string()))
    }

    pub fn failing(message: &str) -> Self {
        Self::with_behaviour(Behaviour::Fail(message.to_string()))
    }

    pub fn panicking() -> Self {
        Self::with_behaviour(Behaviour::Panic)
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<(RequestContext, Payload)> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl RequestHandler for MockRequestHandler {
    async fn handle(
        &self,
        context: &RequestContext,
        request: Payload,
    ) -> Result<Payload, RequestError> {
        self.requests.lock().push((context.clone(), request));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.behaviour {
            Behaviour::Reply(payload) => Ok(payload.clone()),
            Behaviour::BadRequest(message) => Err(RequestError::BadRequest(message.clone())),
            Behaviour::NotFound(message) => Err(RequestError::NotFound(message.clone())),
            Behaviour::Fail(message) => Err(RequestError::Internal(message.clone())),
            Behaviour::Panic => panic!("mock handler panicked"),
        }
    }
}
