use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::{ResourceId, url_under};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchKind {
    Created,
    Updated,
    Deleted,
    Moved,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchEvent {
    pub kind: WatchKind,
    #[serde(rename = "type")]
    pub spec: String,
    /// Encoded id.
    pub id: String,
    pub url: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl WatchEvent {
    #[must_use]
    pub fn new(kind: WatchKind, spec: &str, id: &ResourceId, url: &str) -> Self {
        Self {
            kind,
            spec: spec.to_string(),
            id: id.encode(),
            url: url.to_string(),
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_fields(mut self, fields: impl IntoIterator<Item = String>) -> Self {
        self.fields = fields.into_iter().collect();
        self
    }
}

struct Subscriber {
    id: u64,
    prefix: String,
    tx: mpsc::Sender<WatchEvent>,
}

/// Fan-out to bounded per-subscriber channels; a full or closed subscriber
/// is dropped rather than waited on.
pub struct ChangeFeed {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl ChangeFeed {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes to events for resources at or below `prefix`.
    pub fn subscribe(&self, prefix: &str) -> mpsc::Receiver<WatchEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber {
                id,
                prefix: prefix.to_string(),
                tx,
            });
        tracing::debug!(subscriber = id, prefix, "watch subscribed");
        rx
    }

    pub fn publish(&self, event: WatchEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|sub| {
            if !url_under(&event.url, &sub.prefix) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = sub.id, "dropping slow watch subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(url: &str) -> WatchEvent {
        WatchEvent::new(WatchKind::Updated, "employee", &ResourceId::generate(), url)
    }

    #[test]
    fn test_prefix_filtering() {
        let feed = ChangeFeed::new(4);
        let mut employees = feed.subscribe("/employees");
        let mut all = feed.subscribe("/");

        feed.publish(event("/employees/ID5e1b3c9f0a1b2c3d4e5f6a7b"));
        feed.publish(event("/divisions/ID5e1b3c9f0a1b2c3d4e5f6a7b"));

        assert!(employees.try_recv().is_ok());
        assert!(employees.try_recv().is_err());
        assert!(all.try_recv().is_ok());
        assert!(all.try_recv().is_ok());
    }

    #[test]
    fn test_slow_subscriber_dropped() {
        let feed = ChangeFeed::new(1);
        let _slow = feed.subscribe("/");
        let mut fast = feed.subscribe("/");

        feed.publish(event("/employees/a"));
        assert!(fast.try_recv().is_ok());
        feed.publish(event("/employees/b"));

        assert_eq!(feed.subscriber_count(), 1);
        assert!(fast.try_recv().is_ok());
    }

    #[test]
    fn test_closed_subscriber_removed() {
        let feed = ChangeFeed::new(2);
        drop(feed.subscribe("/"));
        feed.publish(event("/employees/a"));
        assert_eq!(feed.subscriber_count(), 0);
    }
}
