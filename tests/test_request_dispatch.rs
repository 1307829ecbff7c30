//! Inbound control requests: verification, handler dispatch and replies


use cloudlink::cloud::{CloudConnection, MessageVerifier, SubscriberListener, SubscriptionRecord};
use cloudlink::config::ConnectionOptions;
use cloudlink::protocol::{MetricValue, Payload, RequestMethod, Topic};
use cloudlink::testing::{MockRequestHandler, MockTransport, RecordingSubscriber};
use cloudlink::transport::QoS;
use std::sync::Arc;
use test_helpers::{decode, eventually, request_bytes, test_device};

const CONFIG_REQUEST: &str = "$EDC/acme/gw-01/CONF-V1/GET/configurations/1";

struct RejectAll;

impl MessageVerifier for RejectAll {
    fn verify(&self, _topic: &Topic, _payload: &Payload) -> bool {
        false
    }
}

async fn started(
    verifier: Option<Arc<dyn MessageVerifier>>,
) -> (Arc<CloudConnection>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let connection = CloudConnection::new(
        ConnectionOptions::default(),
        transport.clone(),
        test_device(),
        verifier,
    )
    .unwrap();
    connection.start().await.unwrap();
    transport.clear_history();
    (connection, transport)
}

#[tokio::test]
async fn test_request_is_dispatched_and_answered() {
    let (connection, transport) = started(None).await;
    let handler = Arc::new(MockRequestHandler::replying(
        Payload::now().with_metric("answer", 42),
    ));
    connection.register_request_handler("CONF-V1", handler.clone());

    transport
        .arrive(CONFIG_REQUEST, &request_bytes("req-1", "console-01"))
        .await;

    assert!(eventually(|| !transport.published_to("REPLY/req-1").is_empty()).await);
    let reply = &transport.published_to("REPLY/req-1")[0];
    assert_eq!(reply.topic, "$EDC/#account-name/console-01/CONF-V1/REPLY/req-1");
    assert_eq!(reply.qos, QoS::AtLeastOnce);

    let payload = decode(reply);
    assert_eq!(payload.metric("response.code"), Some(&MetricValue::Int(200)));
    assert_eq!(payload.metric("answer"), Some(&MetricValue::Int(42)));

    let requests = handler.requests();
    assert_eq!(requests.len(), 1);
    let (context, _) = &requests[0];
    assert_eq!(context.method, Some(RequestMethod::Get));
    assert_eq!(context.resource, vec!["configurations".to_string()]);
    assert_eq!(context.request_id.as_deref(), Some("req-1"));
    assert_eq!(context.requester.as_deref(), Some("console-01"));
}

#[tokio::test]
async fn test_handler_errors_become_error_replies() {
    let (connection, transport) = started(None).await;
    connection.register_request_handler("CONF-V1", Arc::new(MockRequestHandler::not_found("no such pid")));
    connection.register_request_handler("DEPLOY-V2", Arc::new(MockRequestHandler::failing("disk full")));

    transport
        .arrive(CONFIG_REQUEST, &request_bytes("req-2", "console-01"))
        .await;
    transport
        .arrive(
            "$EDC/acme/gw-01/DEPLOY-V2/EXEC/install",
            &request_bytes("req-3", "console-01"),
        )
        .await;

    assert!(eventually(|| transport.published_to("REPLY/req-2").len() == 1
        && transport.published_to("REPLY/req-3").len() == 1)
    .await);

    let not_found = decode(&transport.published_to("REPLY/req-2")[0]);
    assert_eq!(not_found.metric("response.code"), Some(&MetricValue::Int(404)));
    assert!(not_found.string_metric("response.exception.message").is_some());

    let internal = decode(&transport.published_to("REPLY/req-3")[0]);
    assert_eq!(internal.metric("response.code"), Some(&MetricValue::Int(500)));
}

#[tokio::test]
async fn test_reply_topics_are_not_dispatched() {
    let (connection, transport) = started(None).await;
    let handler = Arc::new(MockRequestHandler::replying(Payload::now()));
    connection.register_request_handler("CONF-V1", handler.clone());
    let subscriber = RecordingSubscriber::new();
    connection
        .register_subscriber(
            SubscriptionRecord::new("$EDC/#account-name/#client-id/CONF-V1/REPLY/#", QoS::AtLeastOnce),
            subscriber.clone(),
        )
        .await
        .unwrap();

    transport
        .arrive(
            "$EDC/acme/gw-01/CONF-V1/REPLY/req-9",
            &request_bytes("req-9", "console-01"),
        )
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(handler.request_count(), 0);
    assert_eq!(subscriber.count(), 1);
}

#[tokio::test]
async fn test_unverified_control_messages_are_dropped() {
    let verifier: Arc<dyn MessageVerifier> = Arc::new(RejectAll);
    let (connection, transport) = started(Some(verifier)).await;
    let handler = Arc::new(MockRequestHandler::replying(Payload::now()));
    connection.register_request_handler("CONF-V1", handler.clone());
    let subscriber = RecordingSubscriber::new();
    let as_listener: Arc<dyn SubscriberListener> = subscriber.clone();
    connection
        .register_subscriber(
            SubscriptionRecord::new("$EDC/#account-name/#client-id/#", QoS::AtLeastOnce),
            as_listener,
        )
        .await
        .unwrap();

    transport
        .arrive(CONFIG_REQUEST, &request_bytes("req-4", "console-01"))
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(handler.request_count(), 0);
    assert_eq!(subscriber.count(), 0);
    assert!(transport.published_to("REPLY/req-4").is_empty());
}

#[tokio::test]
async fn test_data_messages_skip_verification() {
    let verifier: Arc<dyn MessageVerifier> = Arc::new(RejectAll);
    let (connection, transport) = started(Some(verifier)).await;
    let subscriber = RecordingSubscriber::new();
    connection
        .register_subscriber(
            SubscriptionRecord::for_app(&connection.options(), "HEATER", "#", QoS::AtLeastOnce),
            subscriber.clone(),
        )
        .await
        .unwrap();

    transport
        .arrive("acme/gw-01/HEATER/temperature", &request_bytes("r", "c"))
        .await;

    assert_eq!(subscriber.count(), 1);
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_dispatch() {
    let (connection, transport) = started(None).await;
    connection.register_request_handler("BROKEN", Arc::new(MockRequestHandler::panicking()));
    let healthy = Arc::new(MockRequestHandler::replying(Payload::now()));
    connection.register_request_handler("CONF-V1", healthy.clone());

    transport
        .arrive(
            "$EDC/acme/gw-01/BROKEN/GET/anything",
            &request_bytes("req-5", "console-01"),
        )
        .await;
    transport
        .arrive(CONFIG_REQUEST, &request_bytes("req-6", "console-01"))
        .await;

    assert!(eventually(|| !transport.published_to("REPLY/req-6").is_empty()).await);
    assert!(transport.published_to("REPLY/req-5").is_empty());
    assert_eq!(healthy.request_count(), 1);
}

#[tokio::test]
async fn test_broker_feedback_topics_are_ignored() {
    let (connection, transport) = started(None).await;
    let subscriber = RecordingSubscriber::new();
    connection
        .register_subscriber(
            SubscriptionRecord::new("$EDC/#account-name/#client-id/#", QoS::AtLeastOnce),
            subscriber.clone(),
        )
        .await
        .unwrap();

    transport
        .arrive("$EDC/acme/gw-01/MQTT/BIRTH", &request_bytes("r", "c"))
        .await;
    transport
        .arrive("$EDC/acme/gw-01/BA/status", &request_bytes("r", "c"))
        .await;

    assert_eq!(subscriber.count(), 0);
}

#[tokio::test]
async fn test_request_without_requester_is_not_answered() {
    let (connection, transport) = started(None).await;
    let handler = Arc::new(MockRequestHandler::replying(Payload::now()));
    connection.register_request_handler("CONF-V1", handler.clone());

    transport
        .arrive(
            CONFIG_REQUEST,
            &test_helpers::encode(&Payload::now().with_metric("request.id", "req-7")),
        )
        .await;

    assert!(eventually(|| handler.request_count() == 1).await);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(transport.published_to("REPLY/req-7").is_empty());
}
