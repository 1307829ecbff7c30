//! Debounced lifecycle republishing
//!
//! Bursts of reconfiguration (options replaced, handlers registered, packages
//! installed) each want a fresh birth or app-list certificate. The debouncer
//! keeps only the latest message per kind and flushes them together once the
//! window has passed without a newer request.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::lifecycle::{LifecycleKind, LifecycleMessage};

/// Target the debouncer flushes into
#[async_trait::async_trait]
pub trait LifecycleSink: Send + Sync {
    async fn publish_lifecycle(&self, message: LifecycleMessage);
}

#[derive(Default)]
struct DebounceState {
    pending: BTreeMap<LifecycleKind, LifecycleMessage>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

#[derive(Default)]
pub struct RepublishDebouncer {
    state: Arc<Mutex<DebounceState>>,
}

impl RepublishDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `message` as the latest of its kind and restart the shared timer
    pub fn schedule_republish(
        &self,
        message: LifecycleMessage,
        window: Duration,
        sink: Weak<dyn LifecycleSink>,
    ) {
        let mut state = self.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let kind = message.kind;
        if state.pending.insert(kind, message).is_some() {
            debug!(kind = kind.as_str(), "Pending lifecycle message superseded");
        }

        state.generation += 1;
        let generation = state.generation;
        let shared = Arc::clone(&self.state);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            flush(shared, generation, sink).await;
        }));

        debug!(
            kind = kind.as_str(),
            window_ms = window.as_millis() as u64,
            "Lifecycle republish scheduled"
        );
    }

    /// Drop everything pending and stop the timer
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;
        state.pending.clear();
    }

    pub fn is_pending(&self, kind: LifecycleKind) -> bool {
        self.state.lock().pending.contains_key(&kind)
    }
}

impl Drop for RepublishDebouncer {
    fn drop(&mut self) {
        if let Some(timer) = self.state.lock().timer.take() {
            timer.abort();
        }
    }
}

async fn flush(state: Arc<Mutex<DebounceState>>, generation: u64, sink: Weak<dyn LifecycleSink>) {
    let batch = {
        let mut state = state.lock();
        if state.generation != generation {
            return;
        }
        state.timer = None;
        std::mem::take(&mut state.pending)
    };

    let Some(sink) = sink.upgrade() else {
        debug!("Lifecycle sink dropped before the debounce window elapsed");
        return;
    };

    // BTreeMap order is the flush priority: birth before app-list
    for (kind, message) in batch {
        info!(kind = kind.as_str(), "Publishing debounced lifecycle message");
        sink.publish_lifecycle(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CloudMessage, Payload};

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<LifecycleMessage>>,
    }

    #[async_trait::async_trait]
    impl LifecycleSink for RecordingSink {
        async fn publish_lifecycle(&self, message: LifecycleMessage) {
            self.published.lock().push(message);
        }
    }

    fn message(kind: LifecycleKind, marker: i32) -> LifecycleMessage {
        LifecycleMessage {
            kind,
            message: CloudMessage::to_app("MQTT", "BIRTH", Payload::new().with_metric("marker", marker))
                .control(),
        }
    }

    fn weak(sink: &Arc<RecordingSink>) -> Weak<dyn LifecycleSink> {
        let sink: Arc<dyn LifecycleSink> = sink.clone();
        Arc::downgrade(&sink)
    }

    fn markers(sink: &RecordingSink) -> Vec<i32> {
        sink.published
            .lock()
            .iter()
            .filter_map(|m| m.message.payload.metric("marker").and_then(|v| v.as_i64()))
            .map(|v| v as i32)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_births_within_window_flush_once_with_latest() {
        // Arrange
        let debouncer = RepublishDebouncer::new();
        let sink = Arc::new(RecordingSink::default());
        let window = Duration::from_secs(30);

        // Act
        debouncer.schedule_republish(message(LifecycleKind::Birth, 1), window, weak(&sink));
        tokio::time::sleep(Duration::from_secs(10)).await;
        debouncer.schedule_republish(message(LifecycleKind::Birth, 2), window, weak(&sink));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(sink.published.lock().is_empty(), "window restarts on each request");

        tokio::time::sleep(Duration::from_secs(2)).await;

        // Assert
        assert_eq!(markers(&sink), vec![2]);
        assert!(!debouncer.is_pending(LifecycleKind::Birth));
    }

    #[tokio::test(start_paused = true)]
    async fn test_birth_flushes_before_app_list() {
        let debouncer = RepublishDebouncer::new();
        let sink = Arc::new(RecordingSink::default());
        let window = Duration::from_secs(30);

        debouncer.schedule_republish(message(LifecycleKind::AppList, 10), window, weak(&sink));
        debouncer.schedule_republish(message(LifecycleKind::Birth, 20), window, weak(&sink));
        debouncer.schedule_republish(message(LifecycleKind::AppList, 11), window, weak(&sink));

        tokio::time::sleep(Duration::from_secs(31)).await;

        let kinds: Vec<LifecycleKind> = sink.published.lock().iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![LifecycleKind::Birth, LifecycleKind::AppList]);
        assert_eq!(markers(&sink), vec![20, 11]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_pending() {
        let debouncer = RepublishDebouncer::new();
        let sink = Arc::new(RecordingSink::default());

        debouncer.schedule_republish(
            message(LifecycleKind::Birth, 1),
            Duration::from_secs(30),
            weak(&sink),
        );
        assert!(debouncer.is_pending(LifecycleKind::Birth));

        debouncer.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(sink.published.lock().is_empty());
        assert!(!debouncer.is_pending(LifecycleKind::Birth));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sink_skips_flush() {
        let debouncer = RepublishDebouncer::new();
        let sink = Arc::new(RecordingSink::default());
        let weak_sink = weak(&sink);
        drop(sink);

        debouncer.schedule_republish(message(LifecycleKind::Birth, 1), Duration::from_secs(1), weak_sink);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(!debouncer.is_pending(LifecycleKind::Birth));
    }
}
