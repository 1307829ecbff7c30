//! Impure I/O operations for the MQTT transport
//!
//! Owns the rumqttc client and a supervisor task that polls the event loop,
//! turns events into [`TransportListener`] callbacks and reconnects with
//! backoff when the link drops.

use super::connection::{
    configure_mqtt_options, to_mqtt_qos, LinkState, ReconnectConfig, ReconnectionDecision,
    TopicTokens, CONNACK_TIMEOUT, REQUEST_CHANNEL_CAPACITY,
};
use super::message_handler::{DeliveryQueue, EventRoute, MessageHandler};
use crate::config::{ConnectionOptions, MqttSection};
use crate::transport::{DeliveryId, QoS, Transport, TransportError, TransportListener};
use async_trait::async_trait;
use rumqttc::v5::{AsyncClient, ConnectionError, EventLoop};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Poll interval while waiting for in-flight deliveries before disconnecting
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// State shared between the client handle and the supervisor task
struct Shared {
    mqtt: MqttSection,
    client: Mutex<Option<AsyncClient>>,
    deliveries: parking_lot::Mutex<DeliveryQueue>,
    listener: parking_lot::RwLock<Option<Weak<dyn TransportListener>>>,
    state_tx: watch::Sender<LinkState>,
    /// Set while a requested disconnect is in progress
    disconnecting: AtomicBool,
    reconnect_config: ReconnectConfig,
}

impl Shared {
    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state_tx.send_replace(state.clone());
        if previous != state {
            debug!(from = ?previous, to = ?state, "MQTT link state changed");
        }
    }
}

/// MQTT transport backed by rumqttc
pub struct MqttClient {
    shared: Arc<Shared>,
    tokens: TopicTokens,
    next_delivery: AtomicU64,
    shutdown_tx: parking_lot::Mutex<Option<watch::Sender<bool>>>,
    event_loop_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    /// Create the adapter. Placeholders in topics are substituted with the
    /// account and client id from `mqtt`, using the tokens in `options`.
    pub fn new(mqtt: &MqttSection, options: &ConnectionOptions) -> Result<Self, TransportError> {
        // Fail early on a bad URL rather than at connect time
        configure_mqtt_options(mqtt)?;

        let (state_tx, _) = watch::channel(LinkState::Idle);
        Ok(Self {
            shared: Arc::new(Shared {
                mqtt: mqtt.clone(),
                client: Mutex::new(None),
                deliveries: parking_lot::Mutex::new(DeliveryQueue::new()),
                listener: parking_lot::RwLock::new(None),
                state_tx,
                disconnecting: AtomicBool::new(false),
                reconnect_config: ReconnectConfig::default(),
            }),
            tokens: TopicTokens::new(options, mqtt),
            next_delivery: AtomicU64::new(0),
            shutdown_tx: parking_lot::Mutex::new(None),
            event_loop_handle: parking_lot::Mutex::new(None),
        })
    }

    /// Replace the reconnection policy; takes effect on the next connect
    pub fn with_reconnect_config(mut self, config: ReconnectConfig) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.reconnect_config = config;
        }
        self
    }

    /// Get current link state
    pub fn link_state(&self) -> LinkState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(self.link_state(), LinkState::PermanentlyDisconnected(_))
    }

    /// Create a client and event loop for one connection attempt
    fn create_connection(mqtt: &MqttSection) -> Result<(AsyncClient, EventLoop), TransportError> {
        let mqtt_options = configure_mqtt_options(mqtt)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
    }

    /// Wait for ConnAck (or a terminal state) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<LinkState>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    LinkState::Connected => return Ok(()),
                    LinkState::PermanentlyDisconnected(reason) => {
                        return Err(TransportError::PermanentlyDisconnected(reason.clone()));
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::ConnectionFailed(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::ConnectionFailed(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Supervisor: poll the event loop until shutdown, reconnecting on errors
    async fn run_event_loop(
        shared: Arc<Shared>,
        mut event_loop: EventLoop,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(client_id = %shared.mqtt.client_id, "Starting MQTT event loop");
        let mut reconnect_attempts = 0u32;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT event loop");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    let keep_running = match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            Self::process_event_route(route, &shared, &mut reconnect_attempts).await
                        }
                        Err(e) => {
                            Self::handle_event_loop_error(
                                e,
                                &shared,
                                &mut reconnect_attempts,
                                &mut event_loop,
                                shutdown_rx.clone(),
                            )
                            .await
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }
        info!(client_id = %shared.mqtt.client_id, "MQTT event loop stopped");
    }

    /// Returns false when the supervisor should stop
    async fn process_event_route(
        route: EventRoute,
        shared: &Arc<Shared>,
        reconnect_attempts: &mut u32,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                info!(reconnect_attempts = *reconnect_attempts, "MQTT connection acknowledged");
                *reconnect_attempts = 0;
                shared.set_state(LinkState::Connected);
                if let Some(listener) = shared.listener() {
                    // Spawned: setup publishes and waits on acks this loop must deliver
                    tokio::spawn(async move { listener.on_connection_established().await });
                }
                true
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                qos,
                retain,
            } => {
                debug!(topic = %topic, bytes = payload.len(), "MQTT message received");
                if let Some(listener) = shared.listener() {
                    listener
                        .on_message_arrived(&topic, &payload, qos, retain)
                        .await;
                }
                true
            }
            EventRoute::PublishSent { packet_id } => {
                let sent = shared.deliveries.lock().on_sent(packet_id);
                if let (Some((id, topic)), Some(listener)) = (sent, shared.listener()) {
                    listener.on_message_published(id, &topic).await;
                }
                true
            }
            EventRoute::PublishConfirmed { packet_id } => {
                let confirmed = shared.deliveries.lock().on_confirmed(packet_id);
                if let (Some((id, topic)), Some(listener)) = (confirmed, shared.listener()) {
                    listener.on_message_confirmed(id, &topic).await;
                }
                true
            }
            EventRoute::Disconnected => {
                warn!("MQTT broker closed the connection");
                Self::connection_lost(shared, "Disconnected by broker".to_string());
                true
            }
            EventRoute::DisconnectSent => {
                shared.set_state(LinkState::Disconnected("Client disconnected".to_string()));
                false
            }
            EventRoute::SubscriptionConfirmed { packet_id, failed } => {
                if failed {
                    warn!(packet_id, "Broker rejected subscription");
                } else {
                    debug!(packet_id, "Subscription confirmed");
                }
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Report a dropped link once and forget what was in flight
    fn connection_lost(shared: &Arc<Shared>, cause: String) {
        let was_connected = shared.state_tx.borrow().can_publish();
        shared.set_state(LinkState::Disconnected(cause.clone()));

        let dropped = shared.deliveries.lock().clear();
        if dropped > 0 {
            warn!(dropped, "Unconfirmed deliveries dropped with the connection");
        }

        if was_connected {
            if let Some(listener) = shared.listener() {
                tokio::spawn(async move { listener.on_connection_lost(cause).await });
            }
        }
    }

    /// Returns true to continue the loop (after reconnection), false to stop
    async fn handle_event_loop_error(
        error: ConnectionError,
        shared: &Arc<Shared>,
        reconnect_attempts: &mut u32,
        event_loop: &mut EventLoop,
        shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        if shared.disconnecting.load(Ordering::SeqCst) {
            debug!(error = %error, "Event loop closed during requested disconnect");
            shared.set_state(LinkState::Disconnected("Client disconnected".to_string()));
            return false;
        }

        error!(error = %error, "MQTT event loop error");
        Self::connection_lost(shared, error.to_string());

        let shutdown_requested = *shutdown_rx.borrow();
        match shared
            .reconnect_config
            .decide(*reconnect_attempts, shutdown_requested)
        {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                *reconnect_attempts = attempt;
                shared.set_state(LinkState::Reconnecting(attempt));

                let max_display = shared
                    .reconnect_config
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(attempt, max = %max_display, delay_ms, "Attempting MQTT reconnection");

                if !Self::interruptible_sleep(shutdown_rx, delay_ms).await {
                    return false;
                }
                Self::apply_new_connection(shared, event_loop).await;
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!("Max reconnection attempts ({reconnect_attempts}) exceeded");
                error!(reason = %reason, "Giving up on the MQTT connection");
                shared.set_state(LinkState::PermanentlyDisconnected(reason));
                false
            }
        }
    }

    /// Returns false when shutdown was requested during the delay
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Start over with a fresh client and session state
    async fn apply_new_connection(shared: &Arc<Shared>, event_loop: &mut EventLoop) {
        match Self::create_connection(&shared.mqtt) {
            Ok((client, new_event_loop)) => {
                *event_loop = new_event_loop;
                *shared.client.lock().await = Some(client);
                shared.set_state(LinkState::Connecting);
                debug!("Created new MQTT connection for reconnection attempt");
            }
            Err(e) => error!(error = %e, "Failed to create new MQTT connection"),
        }
    }

    /// Wait until every accepted publish is confirmed or `grace` runs out
    async fn drain_deliveries(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let pending = self.shared.deliveries.lock().pending();
            if pending == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(pending, "Disconnecting with unconfirmed deliveries");
                return;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    fn stop_supervisor(&self) -> Option<JoinHandle<()>> {
        if let Some(shutdown_tx) = self.shutdown_tx.lock().take() {
            let _ = shutdown_tx.send(true);
        }
        self.event_loop_handle.lock().take()
    }
}

#[async_trait]
impl Transport for MqttClient {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.event_loop_handle.lock().is_some() {
            debug!("MQTT event loop already running");
            return Ok(());
        }

        let (client, event_loop) = Self::create_connection(&self.shared.mqtt)?;
        *self.shared.client.lock().await = Some(client);
        self.shared.disconnecting.store(false, Ordering::SeqCst);
        self.shared.set_state(LinkState::Connecting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let span = crate::mqtt_span!(
            broker = %self.shared.mqtt.broker_url,
            client_id = %self.shared.mqtt.client_id
        );
        let handle = tokio::spawn(
            Self::run_event_loop(Arc::clone(&self.shared), event_loop, shutdown_rx).instrument(span),
        );
        *self.event_loop_handle.lock() = Some(handle);

        Self::wait_for_connection_confirmation(self.shared.state_tx.subscribe(), CONNACK_TIMEOUT)
            .await
    }

    async fn disconnect(&self, grace: Duration) -> Result<(), TransportError> {
        if self.shared.client.lock().await.is_none() {
            return Err(TransportError::NotConnected);
        }

        if let Some(listener) = self.shared.listener() {
            listener.on_disconnecting().await;
        }
        self.drain_deliveries(grace).await;

        self.shared.disconnecting.store(true, Ordering::SeqCst);
        let disconnect_result = match self.shared.client.lock().await.take() {
            Some(client) => client
                .disconnect()
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string())),
            None => Ok(()),
        };

        // Give the event loop a moment to flush DISCONNECT before stopping it
        let handle = self.event_loop_handle.lock().take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(Duration::from_secs(2), &mut handle).await {
                Ok(Ok(())) => info!("MQTT event loop shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "MQTT event loop ended with error"),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("MQTT event loop didn't shut down gracefully, aborting");
                    handle.abort();
                }
            }
        }
        if let Some(handle) = self.stop_supervisor() {
            handle.abort();
        }

        self.shared.deliveries.lock().clear();
        self.shared
            .set_state(LinkState::Disconnected("Client disconnected".to_string()));

        if let Some(listener) = self.shared.listener() {
            listener.on_disconnected().await;
        }
        info!("MQTT client disconnected");
        disconnect_result
    }

    fn is_connected(&self) -> bool {
        self.shared.state_tx.borrow().can_publish()
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
        let topic = self.tokens.substitute(topic);

        // Queue order must match the order requests reach the event loop
        let client_guard = self.shared.client.lock().await;
        let client = client_guard.as_ref().ok_or(TransportError::NotConnected)?;

        let id = DeliveryId(self.next_delivery.fetch_add(1, Ordering::SeqCst) + 1);
        self.shared.deliveries.lock().push(id, &topic, qos);

        if let Err(e) = client
            .publish(topic.clone(), to_mqtt_qos(qos), retain, payload)
            .await
        {
            self.shared.deliveries.lock().remove(id);
            return Err(TransportError::PublishFailed {
                topic,
                reason: e.to_string(),
            });
        }

        debug!(delivery_id = %id, topic = %topic, qos = qos.as_u8(), retain, priority, "Publish handed to MQTT client");
        Ok(id)
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        let filter = self.tokens.substitute(filter);
        let client_guard = self.shared.client.lock().await;
        let client = client_guard.as_ref().ok_or(TransportError::NotConnected)?;
        client
            .subscribe(filter.clone(), to_mqtt_qos(qos))
            .await
            .map_err(|e| TransportError::SubscriptionFailed {
                filter: filter.clone(),
                reason: e.to_string(),
            })?;
        info!(filter = %filter, qos = qos.as_u8(), "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let filter = self.tokens.substitute(filter);
        let client_guard = self.shared.client.lock().await;
        let client = client_guard.as_ref().ok_or(TransportError::NotConnected)?;
        client
            .unsubscribe(filter.clone())
            .await
            .map_err(|e| TransportError::SubscriptionFailed {
                filter: filter.clone(),
                reason: e.to_string(),
            })?;
        info!(filter = %filter, "Unsubscribed");
        Ok(())
    }

    fn set_listener(&self, listener: Weak<dyn TransportListener>) {
        *self.shared.listener.write() = Some(listener);
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(handle) = self.stop_supervisor() {
            handle.abort();
        }
    }
}
