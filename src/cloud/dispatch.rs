//! Request handlers and the worker pool they run on
//!
//! Control messages addressed to a registered application are handed to its
//! [`RequestHandler`] on a fixed pool of worker tasks. The handler's result is
//! turned into a reply published on
//! `<ctrl>/<account>/<requester>/<appId>/REPLY/<request.id>`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::ConnectionOptions;
use crate::error::sanitize_error_message;
use crate::protocol::{CloudMessage, Payload, ReceivedMessage, RequestMethod, Topic, REPLY_SEGMENT};
use crate::transport::QoS;

pub const METRIC_REQUEST_ID: &str = "request.id";
pub const METRIC_REQUESTER_CLIENT_ID: &str = "requester.client.id";
pub const METRIC_RESPONSE_CODE: &str = "response.code";
pub const METRIC_EXCEPTION_MESSAGE: &str = "response.exception.message";

pub const RESPONSE_CODE_OK: i32 = 200;
pub const RESPONSE_CODE_BAD_REQUEST: i32 = 400;
pub const RESPONSE_CODE_NOT_FOUND: i32 = 404;
pub const RESPONSE_CODE_ERROR: i32 = 500;

/// Queue slots per worker before inbound requests are dropped
const QUEUE_DEPTH_PER_WORKER: usize = 64;

/// Failure reported by a request handler
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl RequestError {
    pub fn response_code(&self) -> i32 {
        match self {
            RequestError::BadRequest(_) => RESPONSE_CODE_BAD_REQUEST,
            RequestError::NotFound(_) => RESPONSE_CODE_NOT_FOUND,
            RequestError::Internal(_) => RESPONSE_CODE_ERROR,
        }
    }
}

/// Everything a handler needs to know about the request besides its payload
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub app_id: String,
    pub topic: Topic,
    pub method: Option<RequestMethod>,
    /// Sub-topic segments after the method
    pub resource: Vec<String>,
    pub request_id: Option<String>,
    pub requester: Option<String>,
}

impl RequestContext {
    /// Build the context from a control message; payload metrics win over the topic
    pub fn from_message(message: &ReceivedMessage, options: &ConnectionOptions) -> Self {
        let topic = &message.topic;
        let request_id = message
            .payload
            .string_metric(METRIC_REQUEST_ID)
            .map(str::to_string)
            .or_else(|| topic.request_id.clone());
        let requester = message
            .payload
            .string_metric(METRIC_REQUESTER_CLIENT_ID)
            .map(str::to_string);

        Self {
            app_id: topic.app_id.clone(),
            method: topic.request_method(options),
            resource: topic.resource(options),
            topic: topic.clone(),
            request_id,
            requester,
        }
    }
}

/// Application-side handler for control requests
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, context: &RequestContext, request: Payload) -> Result<Payload, RequestError>;
}

/// Build the reply for a handled request. Returns `None` when the request did
/// not say where to reply.
pub fn build_reply(
    context: &RequestContext,
    result: Result<Payload, RequestError>,
) -> Option<CloudMessage> {
    let (Some(requester), Some(request_id)) = (&context.requester, &context.request_id) else {
        debug!(
            app_id = %context.app_id,
            topic = %context.topic,
            "Request carries no requester or request id, not replying"
        );
        return None;
    };

    let payload = match result {
        Ok(payload) => payload.with_metric(METRIC_RESPONSE_CODE, RESPONSE_CODE_OK),
        Err(e) => Payload::now()
            .with_metric(METRIC_RESPONSE_CODE, e.response_code())
            .with_metric(METRIC_EXCEPTION_MESSAGE, sanitize_error_message(&e.to_string())),
    };

    let reply_topic = format!("{REPLY_SEGMENT}/{request_id}");
    Some(
        CloudMessage::to_app(&context.app_id, &reply_topic, payload)
            .control()
            .for_device(requester)
            .with_qos(QoS::AtLeastOnce),
    )
}

/// Unit of work run by the pool
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Dispatch queue is full")]
    QueueFull,

    #[error("Dispatch pool is shut down")]
    ShutDown,
}

/// Fixed set of worker tasks draining a bounded queue
///
/// Up to `size` jobs run concurrently; no ordering is guaranteed between them.
pub struct DispatchPool {
    sender: parking_lot::Mutex<Option<mpsc::Sender<Job>>>,
    workers: parking_lot::Mutex<Vec<Worker>>,
    size: usize,
}

struct Worker {
    handle: JoinHandle<()>,
    /// The job this worker is currently awaiting
    running: Arc<parking_lot::Mutex<Option<AbortHandle>>>,
}

impl Worker {
    fn spawn(index: usize, receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>) -> Self {
        let running = Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&running);

        let handle = tokio::spawn(async move {
            loop {
                let job = { receiver.lock().await.recv().await };
                let Some(job) = job else {
                    debug!(worker = index, "Dispatch queue closed, worker exiting");
                    break;
                };
                // Run on its own task so a panicking handler does not take the worker down
                let job = tokio::spawn(job);
                *slot.lock() = Some(job.abort_handle());
                let result = job.await;
                *slot.lock() = None;

                if let Err(e) = result {
                    if e.is_panic() {
                        error!(worker = index, "Request handler panicked");
                    }
                }
            }
        });

        Self { handle, running }
    }

    /// Stop the worker, then the job it was running
    async fn abort(self) {
        self.handle.abort();
        let _ = self.handle.await;
        if let Some(job) = self.running.lock().take() {
            job.abort();
        }
    }
}

impl DispatchPool {
    /// Spawn `size` workers. Must be called from within a tokio runtime.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(size * QUEUE_DEPTH_PER_WORKER);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..size)
            .map(|index| Worker::spawn(index, Arc::clone(&receiver)))
            .collect();

        info!(workers = size, "Dispatch pool started");

        Self {
            sender: parking_lot::Mutex::new(Some(sender)),
            workers: parking_lot::Mutex::new(workers),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Queue a job without waiting for capacity
    pub fn submit(&self, job: Job) -> Result<(), DispatchError> {
        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(DispatchError::ShutDown)?;
        sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::ShutDown,
        })
    }

    /// Stop accepting jobs, let queued ones finish within `grace`, then abort
    /// the workers together with the jobs they are running
    pub async fn shutdown(&self, grace: Duration) {
        let Some(sender) = self.sender.lock().take() else {
            return;
        };
        drop(sender);

        let workers: Vec<Worker> = std::mem::take(&mut *self.workers.lock());
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0usize;

        for mut worker in workers {
            if tokio::time::timeout_at(deadline, &mut worker.handle).await.is_err() {
                worker.abort().await;
                aborted += 1;
            }
        }

        if aborted > 0 {
            warn!(aborted, "Dispatch workers and their jobs aborted after grace period");
        } else {
            info!("Dispatch pool drained");
        }
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        for worker in self.workers.lock().drain(..) {
            worker.handle.abort();
            if let Some(job) = worker.running.lock().take() {
                job.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MetricValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(topic: &str, payload: Payload) -> ReceivedMessage {
        let options = ConnectionOptions::default();
        ReceivedMessage {
            topic: Topic::parse(topic, &options),
            payload,
            qos: QoS::AtLeastOnce,
            retained: false,
        }
    }

    #[test]
    fn test_context_prefers_payload_metrics() {
        let options = ConnectionOptions::default();
        let message = request(
            "$EDC/acme/gw-01/CONF-V1/GET/configurations/req-topic",
            Payload::new()
                .with_metric(METRIC_REQUEST_ID, "req-77")
                .with_metric(METRIC_REQUESTER_CLIENT_ID, "console"),
        );

        let context = RequestContext::from_message(&message, &options);

        assert_eq!(context.app_id, "CONF-V1");
        assert_eq!(context.method, Some(RequestMethod::Get));
        assert_eq!(context.resource, vec!["configurations".to_string()]);
        assert_eq!(context.request_id.as_deref(), Some("req-77"));
        assert_eq!(context.requester.as_deref(), Some("console"));
    }

    #[test]
    fn test_success_reply_topic_and_code() {
        let options = ConnectionOptions::default();
        let message = request(
            "$EDC/acme/gw-01/CONF-V1/GET/configurations",
            Payload::new()
                .with_metric(METRIC_REQUEST_ID, "42")
                .with_metric(METRIC_REQUESTER_CLIENT_ID, "console"),
        );
        let context = RequestContext::from_message(&message, &options);

        let reply = build_reply(&context, Ok(Payload::new().with_metric("answer", 1))).unwrap();

        assert_eq!(
            reply.destination.resolve(&options).unwrap(),
            "$EDC/#account-name/console/CONF-V1/REPLY/42"
        );
        assert_eq!(
            reply.payload.metric(METRIC_RESPONSE_CODE),
            Some(&MetricValue::Int(RESPONSE_CODE_OK))
        );
        assert_eq!(reply.payload.metric("answer"), Some(&MetricValue::Int(1)));
    }

    #[test]
    fn test_error_reply_is_sanitized() {
        let options = ConnectionOptions::default();
        let message = request(
            "$EDC/acme/gw-01/CONF-V1/PUT/configurations",
            Payload::new()
                .with_metric(METRIC_REQUEST_ID, "43")
                .with_metric(METRIC_REQUESTER_CLIENT_ID, "console"),
        );
        let context = RequestContext::from_message(&message, &options);

        let reply = build_reply(
            &context,
            Err(RequestError::BadRequest("password=hunter2 rejected".to_string())),
        )
        .unwrap();

        assert_eq!(
            reply.payload.metric(METRIC_RESPONSE_CODE),
            Some(&MetricValue::Int(RESPONSE_CODE_BAD_REQUEST))
        );
        let exception = reply.payload.string_metric(METRIC_EXCEPTION_MESSAGE).unwrap();
        assert!(!exception.contains("hunter2"));
    }

    #[test]
    fn test_no_reply_without_requester() {
        let options = ConnectionOptions::default();
        let message = request("$EDC/acme/gw-01/CONF-V1/EXEC/restart", Payload::new());
        let context = RequestContext::from_message(&message, &options);

        assert!(build_reply(&context, Ok(Payload::new())).is_none());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(RequestError::NotFound("x".into()).response_code(), 404);
        assert_eq!(RequestError::Internal("x".into()).response_code(), 500);
    }

    #[tokio::test]
    async fn test_pool_runs_jobs_and_drains_on_shutdown() {
        let pool = DispatchPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let done = done.clone();
            pool.submit(Box::pin(async move {
                tokio::task::yield_now().await;
                done.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        pool.shutdown(Duration::from_secs(5)).await;

        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(pool.submit(Box::pin(async {})), Err(DispatchError::ShutDown));
    }

    #[tokio::test]
    async fn test_panicking_job_keeps_worker_alive() {
        let pool = DispatchPool::new(1);
        let done = Arc::new(AtomicUsize::new(0));

        pool.submit(Box::pin(async { panic!("handler bug") })).unwrap();
        let counter = done.clone();
        pool.submit(Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        pool.shutdown(Duration::from_secs(5)).await;

        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_stuck_jobs_after_grace() {
        let pool = DispatchPool::new(1);
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = finished.clone();
        pool.submit(Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        pool.shutdown(Duration::from_secs(1)).await;
        let shutdown_took = started.elapsed();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(shutdown_took < Duration::from_secs(60));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert!(pool.is_shut_down());
    }
}
