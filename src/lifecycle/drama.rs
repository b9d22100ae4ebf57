//! Global Drama Feed
//!
//! A bounded, newest-first narrative of cross-endpoint events (births,
//! deaths, evolutions, pleas for help), with a broadcast channel for live
//! observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::{broadcast, RwLock};
use tracing::info;
use uuid::Uuid;

/// Events kept in the feed.
pub const DRAMA_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DramaKind {
    Spawn,
    Death,
    Evolution,
    Pr,
    Beg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DramaEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: DramaKind,
    pub path: String,
    pub message: String,
}

pub struct DramaLog {
    events: RwLock<VecDeque<DramaEvent>>,
    capacity: usize,
    tx: broadcast::Sender<DramaEvent>,
}

impl DramaLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity + 1)),
            capacity,
            tx,
        }
    }

    /// Prepend an event, evict the oldest past capacity and notify observers.
    pub async fn record(&self, kind: DramaKind, path: &str, message: impl Into<String>) -> DramaEvent {
        let event = DramaEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            path: path.to_string(),
            message: message.into(),
        };

        {
            let mut events = self.events.write().await;
            events.push_front(event.clone());
            events.truncate(self.capacity);
        }

        info!(kind = ?event.kind, path = %event.path, "📢 {}", event.message);
        let _ = self.tx.send(event.clone());
        event
    }

    /// Newest first.
    pub async fn snapshot(&self) -> Vec<DramaEvent> {
        self.events.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }

    /// Receive every event recorded from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DramaEvent> {
        self.tx.subscribe()
    }
}

impl Default for DramaLog {
    fn default() -> Self {
        Self::new(DRAMA_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feed_is_capped_newest_first() {
        let log = DramaLog::default();
        for i in 0..120 {
            log.record(DramaKind::Spawn, &format!("/e{}", i), format!("/e{} spawned", i)).await;
        }

        let events = log.snapshot().await;
        assert_eq!(events.len(), DRAMA_CAPACITY);
        assert_eq!(events[0].path, "/e119");
        assert_eq!(events[DRAMA_CAPACITY - 1].path, "/e70");
        assert!(events.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_subscribers_see_new_events() {
        let log = DramaLog::new(5);
        let mut rx = log.subscribe();

        log.record(DramaKind::Beg, "/dying", "/dying is dying").await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, DramaKind::Beg);
        assert_eq!(event.path, "/dying");
    }

    #[tokio::test]
    async fn test_clear() {
        let log = DramaLog::default();
        log.record(DramaKind::Death, "/gone", "/gone died").await;
        assert!(!log.is_empty().await);
        log.clear().await;
        assert_eq!(log.len().await, 0);
    }
}
