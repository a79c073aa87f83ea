//! Live-tail fan-out hub.
//!
//! Ingested entries enter a bounded broadcast channel; a single loop drains
//! it and fans each entry out to every subscriber whose label filter
//! matches. Delivery is lossy by contract: a full broadcast channel drops
//! the entry, and a subscriber that cannot keep up with its own bounded
//! outbound queue is unregistered. Durable storage is never affected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::SecondsFormat;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::ingest::EntryObserver;
use crate::labels::LabelSet;
use crate::model::LogEntry;

/// Capacity of the hub's inbound broadcast channel.
const BROADCAST_CAPACITY: usize = 1000;
/// Capacity of each subscriber's outbound queue.
const SUBSCRIBER_CAPACITY: usize = 64;

pub type SubscriberId = u64;

/// A message framed for a live-tail transport.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TailMessage {
    Log { data: TailEntry },
    Connected { message: String, filter: LabelSet },
    FilterUpdated { filter: LabelSet },
}

/// The wire shape of a tailed entry.
#[derive(Debug, Clone, Serialize)]
pub struct TailEntry {
    pub id: String,
    pub timestamp: String,
    pub message: String,
    pub labels: LabelSet,
    pub level: String,
}

impl TailEntry {
    fn from_entry(entry: &LogEntry) -> Self {
        Self {
            id: entry.id.clone(),
            timestamp: entry
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Nanos, true),
            message: entry.line.clone(),
            labels: entry.labels.clone(),
            level: entry.labels.get("level").unwrap_or("info").to_string(),
        }
    }
}

struct Subscriber {
    filter: LabelSet,
    outbound: mpsc::Sender<TailMessage>,
}

/// Fan-out hub for live-tail subscribers.
pub struct TailHub {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    broadcast_tx: mpsc::Sender<LogEntry>,
    broadcast_rx: Mutex<Option<mpsc::Receiver<LogEntry>>>,
}

impl TailHub {
    pub fn new() -> Self {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_CAPACITY);
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            broadcast_tx,
            broadcast_rx: Mutex::new(Some(broadcast_rx)),
        }
    }

    /// Registers a subscriber with an initial filter. Returns its id and
    /// the receiving end of its outbound queue; the transport task drains
    /// that queue at its own pace. A greeting is queued immediately.
    pub fn register(&self, filter: LabelSet) -> (SubscriberId, mpsc::Receiver<TailMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (outbound, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);

        let _ = outbound.try_send(TailMessage::Connected {
            message: "Connected to log stream".to_string(),
            filter: filter.clone(),
        });

        let mut subscribers = self.subscribers.write().unwrap();
        subscribers.insert(id, Subscriber { filter, outbound });
        tracing::info!("live tail subscriber {} connected, total {}", id, subscribers.len());
        (id, rx)
    }

    pub fn unregister(&self, id: SubscriberId) {
        let mut subscribers = self.subscribers.write().unwrap();
        if subscribers.remove(&id).is_some() {
            tracing::info!(
                "live tail subscriber {} disconnected, total {}",
                id,
                subscribers.len()
            );
        }
    }

    /// Replaces a subscriber's filter and queues the confirmation message.
    /// Returns false for an unknown subscriber.
    pub fn update_filter(&self, id: SubscriberId, filter: LabelSet) -> bool {
        let mut subscribers = self.subscribers.write().unwrap();
        let Some(subscriber) = subscribers.get_mut(&id) else {
            return false;
        };
        subscriber.filter = filter.clone();
        let _ = subscriber
            .outbound
            .try_send(TailMessage::FilterUpdated { filter });
        true
    }

    /// Enqueues an entry for fan-out without blocking. A full channel
    /// drops the entry with a warning; storage is unaffected.
    pub fn broadcast(&self, entry: &LogEntry) {
        if let Err(err) = self.broadcast_tx.try_send(entry.clone()) {
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!("live tail channel full, dropping entry");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::warn!("live tail loop stopped, dropping entry");
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }

    /// The broadcast loop. Drains the channel in enqueue order and pushes
    /// each entry into every matching subscriber's outbound queue; a
    /// subscriber whose queue is full or gone is unregistered. Runs until
    /// the hub is dropped.
    pub async fn run(&self) {
        let mut rx = match self.broadcast_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                tracing::error!("live tail loop started twice");
                return;
            }
        };

        while let Some(entry) = rx.recv().await {
            let message = TailMessage::Log {
                data: TailEntry::from_entry(&entry),
            };

            let mut stale = Vec::new();
            {
                let subscribers = self.subscribers.read().unwrap();
                for (id, subscriber) in subscribers.iter() {
                    if !entry.labels.matches(&subscriber.filter) {
                        continue;
                    }
                    if subscriber.outbound.try_send(message.clone()).is_err() {
                        stale.push(*id);
                    }
                }
            }

            for id in stale {
                tracing::warn!("unregistering slow live tail subscriber {}", id);
                self.unregister(id);
            }
        }
    }
}

impl Default for TailHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryObserver for TailHub {
    fn publish(&self, entry: &LogEntry) {
        self.broadcast(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;

    fn entry(line: &str, labels: LabelSet) -> LogEntry {
        LogEntry {
            id: line.to_string(),
            timestamp: Utc::now(),
            line: line.to_string(),
            labels,
        }
    }

    async fn start_hub() -> (Arc<TailHub>, tokio::task::JoinHandle<()>) {
        let hub = Arc::new(TailHub::new());
        let runner = hub.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        (hub, handle)
    }

    #[tokio::test]
    async fn should_greet_new_subscriber() {
        // given
        let hub = TailHub::new();

        // when
        let (_id, mut rx) = hub.register(LabelSet::from([("service", "api")]));

        // then
        let greeting = rx.recv().await.unwrap();
        match greeting {
            TailMessage::Connected { filter, .. } => {
                assert_eq!(filter.get("service"), Some("api"));
            }
            other => panic!("expected connected greeting, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn should_deliver_matching_entries_in_order() {
        // given
        let (hub, _handle) = start_hub().await;
        let (_id, mut rx) = hub.register(LabelSet::from([("service", "api")]));
        let _ = rx.recv().await; // greeting

        let labels = LabelSet::from([("service", "api"), ("env", "prod")]);

        // when
        hub.broadcast(&entry("one", labels.clone()));
        hub.broadcast(&entry("two", labels.clone()));

        // then
        for expected in ["one", "two"] {
            match rx.recv().await.unwrap() {
                TailMessage::Log { data } => assert_eq!(data.message, expected),
                other => panic!("expected log message, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn should_filter_non_matching_entries() {
        // given
        let (hub, _handle) = start_hub().await;
        let (_id, mut rx) = hub.register(LabelSet::from([("service", "api")]));
        let _ = rx.recv().await; // greeting

        // when - only the second entry matches the filter
        hub.broadcast(&entry("skipped", LabelSet::from([("service", "web")])));
        hub.broadcast(&entry("kept", LabelSet::from([("service", "api")])));

        // then
        match rx.recv().await.unwrap() {
            TailMessage::Log { data } => assert_eq!(data.message, "kept"),
            other => panic!("expected log message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn should_match_all_with_empty_filter() {
        // given
        let (hub, _handle) = start_hub().await;
        let (_id, mut rx) = hub.register(LabelSet::new());
        let _ = rx.recv().await; // greeting

        // when
        hub.broadcast(&entry("anything", LabelSet::from([("service", "web")])));

        // then
        assert!(matches!(
            rx.recv().await.unwrap(),
            TailMessage::Log { .. }
        ));
    }

    #[tokio::test]
    async fn should_confirm_filter_update() {
        // given
        let (hub, _handle) = start_hub().await;
        let (id, mut rx) = hub.register(LabelSet::new());
        let _ = rx.recv().await; // greeting

        // when
        assert!(hub.update_filter(id, LabelSet::from([("env", "prod")])));
        hub.broadcast(&entry("dev entry", LabelSet::from([("env", "dev")])));
        hub.broadcast(&entry("prod entry", LabelSet::from([("env", "prod")])));

        // then - the confirmation arrives, then only the matching entry
        match rx.recv().await.unwrap() {
            TailMessage::FilterUpdated { filter } => {
                assert_eq!(filter.get("env"), Some("prod"));
            }
            other => panic!("expected filter confirmation, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            TailMessage::Log { data } => assert_eq!(data.message, "prod entry"),
            other => panic!("expected log message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn should_unregister_slow_subscriber() {
        // given - a subscriber that never drains its queue
        let (hub, _handle) = start_hub().await;
        let (_id, rx) = hub.register(LabelSet::new());
        assert_eq!(hub.subscriber_count(), 1);

        // when - overflow its outbound queue (greeting occupies one slot)
        for i in 0..(SUBSCRIBER_CAPACITY + 8) {
            hub.broadcast(&entry(
                &format!("flood-{}", i),
                LabelSet::from([("service", "api")]),
            ));
        }
        // give the loop time to process the backlog
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // then
        assert_eq!(hub.subscriber_count(), 0);
        drop(rx);
    }

    #[tokio::test]
    async fn should_report_false_for_unknown_filter_update() {
        // given
        let hub = TailHub::new();

        // then
        assert!(!hub.update_filter(42, LabelSet::new()));
    }
}
