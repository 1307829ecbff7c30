//! Cloud connection coordinator
//!
//! [`CloudConnection`] owns the single transport connection and shares it
//! between application components. It keeps the lifecycle certificates in step
//! with connection transitions, tracks confirmed publishes, dispatches control
//! requests to registered handlers and fans inbound messages out to
//! subscribers.

pub mod debounce;
pub mod delivery;
pub mod dispatch;
pub mod lifecycle;
pub mod listeners;
pub mod subscriptions;

pub use debounce::{LifecycleSink, RepublishDebouncer};
pub use delivery::{Ack, DeliveryOutcome, DeliveryTracker};
pub use dispatch::{
    build_reply, DispatchError, DispatchPool, RequestContext, RequestError, RequestHandler,
};
pub use lifecycle::{LifecycleFactory, LifecycleKind, LifecycleMessage};
pub use listeners::{ConnectionListener, DeliveryListener, ListenerSet, SubscriberListener};
pub use subscriptions::{SubscriptionRecord, SubscriptionRegistry};

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use crate::codec::{decode_payload, encode_payload};
use crate::config::{ConfigError, ConnectionOptions};
use crate::device::DeviceInfoProvider;
use crate::error::{CloudError, CloudResult};
use crate::protocol::{default_subscription, CloudMessage, Payload, ReceivedMessage, Topic};
use crate::transport::{DeliveryId, QoS, Transport, TransportListener};
use listeners::notify_isolated;

/// Application ids used by the broker for its own feedback topics
const BROKER_FEEDBACK_APP_IDS: [&str; 2] = ["MQTT", "BA"];

/// How long a QoS 0 publish holds its caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pacing {
    /// Return as soon as the transport accepted the message
    Handoff,
    /// Wait for the published callback, bounded by the delivery wait
    Tracked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Platform events that change what the birth certificate reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    PositionLocked,
    TamperDetected,
    PackageInstalled(String),
    PackageUninstalled(String),
}

/// Signature check applied to inbound control messages
pub trait MessageVerifier: Send + Sync {
    fn verify(&self, topic: &Topic, payload: &Payload) -> bool;
}

/// Coordinator for the gateway's cloud connection
pub struct CloudConnection {
    options: RwLock<Arc<ConnectionOptions>>,
    transport: Arc<dyn Transport>,
    factory: LifecycleFactory,
    verifier: Option<Arc<dyn MessageVerifier>>,
    state: watch::Sender<ConnectionState>,
    tracker: DeliveryTracker,
    debouncer: RepublishDebouncer,
    pool: DispatchPool,
    handlers: RwLock<BTreeMap<String, Arc<dyn RequestHandler>>>,
    applications: RwLock<BTreeSet<String>>,
    subscriptions: SubscriptionRegistry,
    /// Serialises registry changes with the matching transport calls
    subscription_lock: tokio::sync::Mutex<()>,
    default_subscription: tokio::sync::Mutex<Option<String>>,
    connection_listeners: ListenerSet<dyn ConnectionListener>,
    delivery_listeners: ListenerSet<dyn DeliveryListener>,
    stopping: AtomicBool,
    self_ref: Weak<CloudConnection>,
}

impl CloudConnection {
    /// Wire the coordinator to its collaborators and register it as the
    /// transport's listener. Must be called from within a tokio runtime.
    pub fn new(
        options: ConnectionOptions,
        transport: Arc<dyn Transport>,
        device: Arc<dyn DeviceInfoProvider>,
        verifier: Option<Arc<dyn MessageVerifier>>,
    ) -> CloudResult<Arc<Self>> {
        options.validate()?;
        let workers = options.dispatch_workers;

        let connection = Arc::new_cyclic(|self_ref: &Weak<CloudConnection>| {
            let (state, _) = watch::channel(ConnectionState::Disconnected);
            CloudConnection {
                options: RwLock::new(Arc::new(options)),
                transport,
                factory: LifecycleFactory::new(device),
                verifier,
                state,
                tracker: DeliveryTracker::new(),
                debouncer: RepublishDebouncer::new(),
                pool: DispatchPool::new(workers),
                handlers: RwLock::new(BTreeMap::new()),
                applications: RwLock::new(BTreeSet::new()),
                subscriptions: SubscriptionRegistry::new(),
                subscription_lock: tokio::sync::Mutex::new(()),
                default_subscription: tokio::sync::Mutex::new(None),
                connection_listeners: ListenerSet::new("connection"),
                delivery_listeners: ListenerSet::new("delivery"),
                stopping: AtomicBool::new(false),
                self_ref: self_ref.clone(),
            }
        });

        let listener: Weak<dyn TransportListener> = connection.self_ref.clone();
        connection.transport.set_listener(listener);

        Ok(connection)
    }

    /// Current options snapshot
    pub fn options(&self) -> Arc<ConnectionOptions> {
        self.options.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Delivery id a publish is currently waiting on
    pub fn tracked_delivery(&self) -> Option<DeliveryId> {
        self.tracker.tracked()
    }

    /// Ids of every registered request handler and publisher-only application
    pub fn application_ids(&self) -> Vec<String> {
        let mut ids: BTreeSet<String> = self.handlers.read().keys().cloned().collect();
        ids.extend(self.applications.read().iter().cloned());
        ids.into_iter().collect()
    }

    // ========== CONNECTION CONTROL ==========

    /// Bring the connection up. When the transport is already connected the
    /// birth certificate and subscriptions are set up directly.
    pub async fn start(&self) -> CloudResult<()> {
        self.ensure_running()?;
        if self.transport.is_connected() {
            info!("Transport already connected at startup");
            self.set_state(ConnectionState::Connected);
            self.setup_cloud_connection(true).await;
            return Ok(());
        }
        self.connect().await
    }

    pub async fn connect(&self) -> CloudResult<()> {
        self.ensure_running()?;
        self.transition(&[ConnectionState::Disconnected], ConnectionState::Connecting);
        if let Err(e) = self.transport.connect().await {
            error!(error = %e, "Failed to connect to the broker");
            self.transition(&[ConnectionState::Connecting], ConnectionState::Disconnected);
            return Err(e.into());
        }
        Ok(())
    }

    /// Disconnect within the configured grace period; the disconnect
    /// certificate is published from the disconnecting callback.
    pub async fn disconnect(&self) -> CloudResult<()> {
        if !self.transport.is_connected() {
            debug!("Disconnect requested while not connected");
            return Ok(());
        }
        let grace = self.options().disconnect_grace();
        self.transport.disconnect(grace).await?;
        Ok(())
    }

    /// Replace the options wholesale. Rejected options leave the previous ones in place.
    ///
    /// The dispatch pool is sized once at construction, so a different
    /// `dispatch_workers` is rejected.
    pub async fn configure(&self, options: ConnectionOptions) -> CloudResult<()> {
        options.validate()?;
        if options.dispatch_workers != self.pool.size() {
            return Err(ConfigError::InvalidConfig(format!(
                "dispatch_workers cannot change from {} to {} after construction",
                self.pool.size(),
                options.dispatch_workers
            ))
            .into());
        }
        {
            let mut current = self.options.write();
            *current = Arc::new(options);
        }
        info!("Connection options updated");

        if self.transport.is_connected() {
            self.setup_cloud_connection(false).await;
        }
        Ok(())
    }

    /// Stop publishing, disconnect and drain in-flight request handlers.
    /// A shut down coordinator cannot be started again.
    pub async fn shutdown(&self) {
        info!("Shutting down cloud connection");
        self.stopping.store(true, Ordering::SeqCst);
        self.debouncer.cancel();

        if let Err(e) = self.disconnect().await {
            warn!(error = %e, "Disconnect during shutdown failed");
        }

        self.pool.shutdown(self.options().disconnect_grace()).await;
        info!("Cloud connection shut down");
    }

    // ========== PUBLISHING ==========

    /// Publish a message. QoS 0 returns `None` right after handoff; higher
    /// QoS waits (bounded) for the broker confirmation and returns the id.
    pub async fn publish(&self, message: CloudMessage) -> CloudResult<Option<DeliveryId>> {
        Ok(self.publish_with_outcome(message).await?.map(|(id, _)| id))
    }

    /// Like [`publish`](Self::publish), also reporting how the wait ended
    pub async fn publish_with_outcome(
        &self,
        message: CloudMessage,
    ) -> CloudResult<Option<(DeliveryId, DeliveryOutcome)>> {
        if self.stopping.load(Ordering::SeqCst) {
            warn!("Publish ignored, cloud connection is shutting down");
            return Ok(None);
        }
        self.publish_message(message, Pacing::Handoff).await
    }

    async fn publish_message(
        &self,
        message: CloudMessage,
        pacing: Pacing,
    ) -> CloudResult<Option<(DeliveryId, DeliveryOutcome)>> {
        let options = self.options();
        let topic = message.destination.resolve(&options)?;
        let bytes = encode_payload(&options, &message.payload)?;

        let span = crate::cloud_span!(operation = "publish", topic = %topic, qos = message.qos.as_u8());
        self.publish_encoded(&topic, bytes.to_vec(), &message, &options, pacing)
            .instrument(span)
            .await
    }

    async fn publish_encoded(
        &self,
        topic: &str,
        bytes: Vec<u8>,
        message: &CloudMessage,
        options: &ConnectionOptions,
        pacing: Pacing,
    ) -> CloudResult<Option<(DeliveryId, DeliveryOutcome)>> {
        if message.qos == QoS::AtMostOnce && pacing == Pacing::Handoff {
            let id = self
                .transport
                .publish(topic, bytes, message.qos, message.retain, message.priority)
                .await?;
            debug!(delivery_id = %id, "Published");
            return Ok(None);
        }

        let ticket = self.tracker.arm(message.qos);
        let id = match self
            .transport
            .publish(topic, bytes, message.qos, message.retain, message.priority)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.tracker.disarm(ticket);
                return Err(e.into());
            }
        };

        let outcome = self
            .tracker
            .track_and_wait(ticket, id, options.delivery_wait())
            .await;
        debug!(delivery_id = %id, outcome = ?outcome, "Tracked publish finished");
        Ok(Some((id, outcome)))
    }

    async fn publish_lifecycle_now(&self, kind: LifecycleKind) {
        let options = self.options();
        let built = self.factory.build(kind, &options, &self.application_ids());
        self.publish_lifecycle_message(built).await;
    }

    async fn publish_lifecycle_message(&self, built: LifecycleMessage) {
        let kind = built.kind;
        let span = crate::lifecycle_span!(operation = "publish", kind = kind.as_str());
        async {
            match self.publish_message(built.message, Pacing::Tracked).await {
                Ok(_) => info!("Lifecycle certificate published"),
                Err(e) => warn!(error = %e, "Failed to publish lifecycle certificate"),
            }
        }
        .instrument(span)
        .await
    }

    fn schedule_lifecycle(&self, kind: LifecycleKind) {
        let options = self.options();
        let built = self.factory.build(kind, &options, &self.application_ids());
        let sink: Weak<dyn LifecycleSink> = self.self_ref.clone();
        self.debouncer
            .schedule_republish(built, options.republish_delay(), sink);
    }

    // ========== REGISTRATION ==========

    /// Register the handler for `app_id`, replacing any previous one
    pub fn register_request_handler(&self, app_id: &str, handler: Arc<dyn RequestHandler>) {
        if self
            .handlers
            .write()
            .insert(app_id.to_string(), handler)
            .is_some()
        {
            warn!(app_id, "Request handler replaced");
        } else {
            info!(app_id, "Request handler registered");
        }
        self.application_list_changed();
    }

    pub fn unregister_request_handler(&self, app_id: &str) -> bool {
        let removed = self.handlers.write().remove(app_id).is_some();
        if removed {
            info!(app_id, "Request handler unregistered");
            self.application_list_changed();
        }
        removed
    }

    /// Add a publisher-only application to the advertised application list
    pub fn register_application(&self, app_id: &str) {
        if self.applications.write().insert(app_id.to_string()) {
            info!(app_id, "Application registered");
            self.application_list_changed();
        }
    }

    pub fn unregister_application(&self, app_id: &str) -> bool {
        let removed = self.applications.write().remove(app_id);
        if removed {
            info!(app_id, "Application unregistered");
            self.application_list_changed();
        }
        removed
    }

    fn application_list_changed(&self) {
        if self.transport.is_connected() {
            self.schedule_lifecycle(LifecycleKind::AppList);
        }
    }

    /// Attach a subscriber to a (filter, QoS) key. The transport subscription
    /// is made when the key gains its first listener.
    pub async fn register_subscriber(
        &self,
        record: SubscriptionRecord,
        listener: Arc<dyn SubscriberListener>,
    ) -> CloudResult<()> {
        let _guard = self.subscription_lock.lock().await;
        if !self.subscriptions.add(record.clone(), listener) {
            debug!(filter = %record.filter, "Listener added to existing subscription");
            return Ok(());
        }
        if !self.transport.is_connected() {
            debug!(filter = %record.filter, "Subscription recorded, applied on connect");
            return Ok(());
        }
        if let Err(e) = self.transport.subscribe(&record.filter, record.qos).await {
            warn!(
                filter = %record.filter,
                error = %e,
                "Subscribe failed, retried on next connection"
            );
        }
        Ok(())
    }

    /// Detach a subscriber everywhere, unsubscribing keys left without listeners
    pub async fn unregister_subscriber(&self, listener: &Arc<dyn SubscriberListener>) {
        let _guard = self.subscription_lock.lock().await;
        let emptied = self.subscriptions.remove_listener(listener);
        if !self.transport.is_connected() {
            return;
        }
        for record in emptied {
            if let Err(e) = self.transport.unsubscribe(&record.filter).await {
                warn!(filter = %record.filter, error = %e, "Unsubscribe failed");
            }
        }
    }

    pub fn subscription_records(&self) -> Vec<SubscriptionRecord> {
        self.subscriptions.records()
    }

    pub fn register_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> bool {
        self.connection_listeners.add(listener)
    }

    pub fn unregister_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.connection_listeners.remove(listener)
    }

    pub fn register_delivery_listener(&self, listener: Arc<dyn DeliveryListener>) -> bool {
        self.delivery_listeners.add(listener)
    }

    pub fn unregister_delivery_listener(&self, listener: &Arc<dyn DeliveryListener>) -> bool {
        self.delivery_listeners.remove(listener)
    }

    /// React to a platform event with a debounced birth, if enabled
    pub fn handle_event(&self, event: GatewayEvent) {
        if !self.transport.is_connected() {
            debug!(event = ?event, "Gateway event while disconnected, ignored");
            return;
        }
        let options = self.options();
        let enabled = match &event {
            GatewayEvent::PositionLocked => options.republish_birth_on_gps_lock,
            GatewayEvent::TamperDetected => options.republish_birth_on_tamper,
            GatewayEvent::PackageInstalled(_) | GatewayEvent::PackageUninstalled(_) => true,
        };
        if enabled {
            info!(event = ?event, "Gateway event triggers birth republish");
            self.schedule_lifecycle(LifecycleKind::Birth);
        }
    }

    // ========== CONNECTION SETUP ==========

    async fn setup_cloud_connection(&self, new_connection: bool) {
        let span = crate::lifecycle_span!(operation = "setup", new_connection);
        async {
            if new_connection {
                // A fresh birth carries everything pending republishes would
                self.debouncer.cancel();
                self.publish_lifecycle_now(LifecycleKind::Birth).await;
            } else {
                self.schedule_lifecycle(LifecycleKind::Birth);
            }

            self.reconcile_default_subscription(new_connection).await;

            if new_connection {
                self.resubscribe_records().await;
            }
        }
        .instrument(span)
        .await
    }

    /// A new connection always re-subscribes; a reconfiguration only when the filter changed
    async fn reconcile_default_subscription(&self, new_connection: bool) {
        let options = self.options();
        let desired = options
            .enable_default_subscriptions
            .then(|| default_subscription(&options));

        let mut current = self.default_subscription.lock().await;
        if let Some(previous) = current.as_ref() {
            if desired.as_ref() != Some(previous) {
                if let Err(e) = self.transport.unsubscribe(previous).await {
                    warn!(filter = %previous, error = %e, "Failed to drop default subscription");
                }
            }
        }

        match &desired {
            Some(filter) if !new_connection && current.as_ref() == Some(filter) => {
                debug!(filter = %filter, "Default subscription unchanged")
            }
            Some(filter) => match self.transport.subscribe(filter, QoS::AtLeastOnce).await {
                Ok(()) => debug!(filter = %filter, "Default subscription in place"),
                Err(e) => warn!(filter = %filter, error = %e, "Default subscription failed"),
            },
            None => debug!("Default subscriptions disabled"),
        }
        *current = desired;
    }

    async fn resubscribe_records(&self) {
        let _guard = self.subscription_lock.lock().await;
        for record in self.subscriptions.records() {
            if let Err(e) = self.transport.subscribe(&record.filter, record.qos).await {
                warn!(filter = %record.filter, error = %e, "Re-subscribe failed");
            }
        }
    }

    // ========== STATE ==========

    fn ensure_running(&self) -> CloudResult<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(CloudError::ShutDown);
        }
        Ok(())
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_replace(next);
    }

    /// Move to `next`, logging when the current state is not one of `expected`
    fn transition(&self, expected: &[ConnectionState], next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if !expected.contains(&previous) {
            warn!(from = %previous, to = %next, "Unexpected connection state transition");
        } else {
            debug!(from = %previous, to = %next, "Connection state changed");
        }
    }

    // ========== INBOUND ==========

    fn dispatch_request(&self, message: &ReceivedMessage, options: &ConnectionOptions) {
        let app_id = message.topic.app_id.as_str();
        let Some(handler) = self.handlers.read().get(app_id).cloned() else {
            debug!(app_id, "No request handler registered");
            return;
        };

        let context = RequestContext::from_message(message, options);
        let request = message.payload.clone();
        let connection = self.self_ref.clone();
        let span = crate::cloud_span!(operation = "request", app_id = %context.app_id, topic = %context.topic);

        let job = async move {
            let result = handler.handle(&context, request).await;
            if let Err(e) = &result {
                warn!(error = %e, code = e.response_code(), "Request handler failed");
            }
            let Some(reply) = dispatch::build_reply(&context, result) else {
                return;
            };
            let Some(connection) = connection.upgrade() else {
                return;
            };
            if let Err(e) = connection.publish(reply).await {
                warn!(error = %e, "Failed to publish reply");
            }
        }
        .instrument(span);

        if let Err(e) = self.pool.submit(Box::pin(job)) {
            warn!(app_id, error = %e, "Request dropped");
        }
    }
}

#[async_trait::async_trait]
impl LifecycleSink for CloudConnection {
    async fn publish_lifecycle(&self, message: LifecycleMessage) {
        if self.stopping.load(Ordering::SeqCst) {
            debug!(kind = message.kind.as_str(), "Shutting down, lifecycle flush skipped");
            return;
        }
        self.publish_lifecycle_message(message).await;
    }
}

#[async_trait::async_trait]
impl TransportListener for CloudConnection {
    async fn on_connection_established(&self) {
        info!("Connection established");
        self.transition(
            &[ConnectionState::Connecting, ConnectionState::Disconnected],
            ConnectionState::Connected,
        );
        self.setup_cloud_connection(true).await;
        self.connection_listeners
            .notify(|l| l.on_connection_established());
    }

    async fn on_disconnecting(&self) {
        self.transition(&[ConnectionState::Connected], ConnectionState::Disconnecting);
        self.debouncer.cancel();
        self.publish_lifecycle_now(LifecycleKind::Disconnect).await;
    }

    async fn on_disconnected(&self) {
        info!("Disconnected");
        self.transition(&[ConnectionState::Disconnecting], ConnectionState::Disconnected);
        self.connection_listeners.notify(|l| l.on_disconnected());
    }

    async fn on_connection_lost(&self, cause: String) {
        warn!(cause = %cause, "Connection lost");
        self.transition(
            &[ConnectionState::Connected, ConnectionState::Connecting],
            ConnectionState::Disconnected,
        );
        self.connection_listeners.notify(|l| l.on_connection_lost());
    }

    async fn on_message_arrived(&self, topic: &str, payload: &[u8], qos: QoS, retained: bool) {
        let options = self.options();
        let topic = Topic::parse(topic, &options);

        if BROKER_FEEDBACK_APP_IDS.contains(&topic.app_id.as_str()) {
            debug!(topic = %topic, "Ignoring broker feedback message");
            return;
        }

        let payload = decode_payload(&options, payload);
        let control = topic.is_control(&options);

        if control {
            if let Some(verifier) = &self.verifier {
                if !verifier.verify(&topic, &payload) {
                    warn!(error = %CloudError::validation(topic.full.as_str()), "Dropping message");
                    return;
                }
            }
        }

        let message = ReceivedMessage {
            topic,
            payload,
            qos,
            retained,
        };

        if control && !message.topic.is_reply(&options) {
            self.dispatch_request(&message, &options);
        }

        for listener in self.subscriptions.matching(&options, &message.topic.full) {
            notify_isolated("subscriber", || listener.on_message_arrived(&message));
        }
    }

    async fn on_message_published(&self, id: DeliveryId, topic: &str) {
        if self.tracker.resolve(id, Ack::Published) {
            debug!(delivery_id = %id, topic, "Tracked delivery published");
        }
        self.delivery_listeners
            .notify(|l| l.on_message_published(id, topic));
    }

    async fn on_message_confirmed(&self, id: DeliveryId, topic: &str) {
        if self.tracker.resolve(id, Ack::Confirmed) {
            debug!(delivery_id = %id, topic, "Tracked delivery confirmed");
        }
        self.delivery_listeners
            .notify(|l| l.on_message_confirmed(id, topic));
    }
}
