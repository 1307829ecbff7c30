//! Subscription records shared between subscriber listeners
//!
//! Each (filter, QoS) key owns an ordered listener list. The registry reports
//! when a key gains its first listener or loses its last one so the caller can
//! subscribe or unsubscribe on the transport exactly once.

use parking_lot::RwLock;
use std::sync::Arc;

use super::listeners::{same_listener, SubscriberListener};
use crate::config::ConnectionOptions;
use crate::protocol::{encode_topic, localize_filter, topic_matches};
use crate::transport::QoS;

/// Subscription key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionRecord {
    pub filter: String,
    pub qos: QoS,
}

impl SubscriptionRecord {
    pub fn new(filter: &str, qos: QoS) -> Self {
        Self {
            filter: filter.to_string(),
            qos,
        }
    }

    /// Data subscription on this gateway's `<app_id>/<app_topic>` topics
    pub fn for_app(options: &ConnectionOptions, app_id: &str, app_topic: &str, qos: QoS) -> Self {
        Self::new(&encode_topic(options, None, app_id, app_topic, false), qos)
    }

    /// Control subscription on this gateway's `<ctrl>/.../<app_id>/<app_topic>` topics
    pub fn for_control(
        options: &ConnectionOptions,
        app_id: &str,
        app_topic: &str,
        qos: QoS,
    ) -> Self {
        Self::new(&encode_topic(options, None, app_id, app_topic, true), qos)
    }

    pub fn matches(&self, options: &ConnectionOptions, topic: &str) -> bool {
        topic_matches(&localize_filter(options, &self.filter), topic, options)
    }
}

struct Entry {
    record: SubscriptionRecord,
    listeners: Vec<Arc<dyn SubscriberListener>>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a listener to a key. Returns true when the key is new and needs a
    /// transport subscription.
    pub fn add(&self, record: SubscriptionRecord, listener: Arc<dyn SubscriberListener>) -> bool {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|entry| entry.record == record) {
            Some(entry) => {
                if !entry
                    .listeners
                    .iter()
                    .any(|existing| same_listener(existing, &listener))
                {
                    entry.listeners.push(listener);
                }
                false
            }
            None => {
                entries.push(Entry {
                    record,
                    listeners: vec![listener],
                });
                true
            }
        }
    }

    /// Detach a listener from every key. Returns the keys left without
    /// listeners; they are removed and need a transport unsubscribe.
    pub fn remove_listener(
        &self,
        listener: &Arc<dyn SubscriberListener>,
    ) -> Vec<SubscriptionRecord> {
        let mut entries = self.entries.write();
        let mut emptied = Vec::new();
        entries.retain_mut(|entry| {
            entry
                .listeners
                .retain(|existing| !same_listener(existing, listener));
            if entry.listeners.is_empty() {
                emptied.push(entry.record.clone());
                false
            } else {
                true
            }
        });
        emptied
    }

    /// All keys in registration order
    pub fn records(&self) -> Vec<SubscriptionRecord> {
        self.entries
            .read()
            .iter()
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn contains(&self, record: &SubscriptionRecord) -> bool {
        self.entries.read().iter().any(|entry| &entry.record == record)
    }

    pub fn listener_count(&self, record: &SubscriptionRecord) -> usize {
        self.entries
            .read()
            .iter()
            .find(|entry| &entry.record == record)
            .map_or(0, |entry| entry.listeners.len())
    }

    /// Listeners whose filter matches `topic`, in registration order, each once
    pub fn matching(
        &self,
        options: &ConnectionOptions,
        topic: &str,
    ) -> Vec<Arc<dyn SubscriberListener>> {
        let entries = self.entries.read();
        let mut matched: Vec<Arc<dyn SubscriberListener>> = Vec::new();
        for entry in entries.iter().filter(|entry| entry.record.matches(options, topic)) {
            for listener in &entry.listeners {
                if !matched.iter().any(|seen| same_listener(seen, listener)) {
                    matched.push(listener.clone());
                }
            }
        }
        matched
    }
}
