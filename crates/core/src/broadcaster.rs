// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-project pub/sub fan-out with bounded, non-blocking subscriber queues.
//!
//! Publish must never block on a slow subscriber: each subscriber's queue
//! is bounded, and a full queue means the message is dropped for that
//! subscriber only, with a counter incremented. Other subscribers are
//! unaffected and the subscriber itself is not disconnected.
//!
//! A subscriber registers the same `mpsc::Sender` it uses for its other
//! outbound traffic (request/response frames) — the Broadcaster does not
//! own a second queue per subscriber. This matches a Session having exactly
//! one bounded outbound queue regardless of how many projects it has
//! joined.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

pub type SubscriberId = u64;

/// Default depth used by tests and standalone callers that don't bring
/// their own sender/queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct Subscriber {
    tx: mpsc::Sender<Value>,
    dropped: Arc<AtomicU64>,
}

/// Per-project broadcast hub. Holds subscriber ids and bounded senders only
/// — never owns a Session, matching the "weak reference by id" ownership
/// rule: the caller is responsible for removing a subscriber on disconnect.
pub struct Broadcaster {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Broadcaster { subscribers: RwLock::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    /// Registers `tx` as a subscriber. Returns the subscriber id (used to
    /// `unsubscribe` later) and a shared drop counter for diagnostics.
    pub async fn subscribe(&self, tx: mpsc::Sender<Value>) -> (SubscriberId, Arc<AtomicU64>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.write().await.insert(id, Subscriber { tx, dropped: dropped.clone() });
        (id, dropped)
    }

    pub async fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.write().await.remove(&id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Fans `message` out to every current subscriber. Takes a brief read
    /// lock to snapshot the subscriber set, then sends without holding any
    /// lock — a full queue drops the message for that subscriber and
    /// increments its counter, never blocking or affecting the others.
    pub async fn publish(&self, message: Value) {
        let subscribers = self.subscribers.read().await;
        for sub in subscribers.values() {
            match sub.tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Receiver dropped without unsubscribing; next
                    // unsubscribe/cleanup pass will reap the entry.
                }
            }
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Broadcaster::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_delivers_to_all_subscribers() {
        let b = Broadcaster::new();
        let (tx1, mut rx1) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        let (tx2, mut rx2) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        b.subscribe(tx1).await;
        b.subscribe(tx2).await;

        b.publish(json!({"hello": "world"})).await;

        assert_eq!(rx1.recv().await.unwrap(), json!({"hello": "world"}));
        assert_eq!(rx2.recv().await.unwrap(), json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn unsubscribe_removes_from_future_publishes() {
        let b = Broadcaster::new();
        let (tx, mut rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        let (id, _dropped) = b.subscribe(tx).await;
        b.unsubscribe(id).await;
        b.publish(json!({"x": 1})).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(b.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts_without_blocking_others() {
        let b = Broadcaster::new();
        let (slow_tx, slow_rx) = mpsc::channel(2);
        let (fast_tx, mut fast_rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        let (_slow_id, slow_dropped) = b.subscribe(slow_tx).await;
        let (_fast_id, _fast_dropped) = b.subscribe(fast_tx).await;

        // Fill the slow subscriber's queue past capacity; never drain it.
        for i in 0..5 {
            b.publish(json!({"i": i})).await;
        }

        // The fast subscriber still received every message in order.
        for i in 0..5 {
            assert_eq!(fast_rx.recv().await.unwrap(), json!({"i": i}));
        }

        assert!(slow_dropped.load(Ordering::Relaxed) >= 1);
        drop(slow_rx);
    }

    #[tokio::test]
    async fn publish_order_is_preserved_per_subscriber() {
        let b = Broadcaster::new();
        let (tx, mut rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        b.subscribe(tx).await;
        for i in 0..10 {
            b.publish(json!({"seq": i})).await;
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap()["seq"], i);
        }
    }
}
