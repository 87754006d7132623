// Telegram log and fan-out
//
// Every value change on the bus becomes a telegram: appended to a bounded
// in-memory ring and pushed to live subscribers. Publication is
// fire-and-forget; a subscriber whose buffer is full gets disconnected
// instead of throttling the bus.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::Origin;
use crate::value::Value;

/// Whether the write behind a telegram reached its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelegramStatus {
    #[default]
    Ok,
    /// The external driver rejected the write; the bus value was not changed.
    Failed,
}

/// A recorded value change on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telegram {
    pub timestamp: DateTime<Utc>,
    /// Display form of the address key.
    pub address: String,
    pub old_value: Value,
    pub new_value: Value,
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "status_is_ok")]
    pub status: TelegramStatus,
}

fn status_is_ok(s: &TelegramStatus) -> bool {
    *s == TelegramStatus::Ok
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Telegram>,
}

/// Bounded telegram history plus push subscribers.
pub struct TelegramBroadcaster {
    ring: Mutex<VecDeque<Telegram>>,
    subscribers: Mutex<Vec<Subscriber>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl TelegramBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.max(500))),
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(500),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append to the ring and push to every live subscriber, in bus order.
    /// Slow subscribers are dropped, never waited for.
    pub fn publish(&self, telegram: Telegram) {
        {
            let mut ring = self.ring.lock().unwrap();
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(telegram.clone());
        }

        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|sub| match sub.tx.try_send(telegram.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = sub.id, "telegram subscriber too slow, disconnecting");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = sub.id, "telegram subscriber gone");
                false
            }
        });
    }

    /// Subscribe with the given buffer size. The receiver is disconnected
    /// (sender dropped) once the buffer overflows.
    pub fn subscribe(&self, buffer: usize) -> mpsc::Receiver<Telegram> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().push(Subscriber { id, tx });
        rx
    }

    /// Most recent `count` telegrams, oldest first.
    pub fn recent(&self, count: usize) -> Vec<Telegram> {
        let ring = self.ring.lock().unwrap();
        ring.iter().rev().take(count).rev().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telegram(address: &str, value: i64) -> Telegram {
        Telegram {
            timestamp: Utc::now(),
            address: address.to_string(),
            old_value: Value::Null,
            new_value: Value::Int(value),
            origin: Origin::Api,
            status: TelegramStatus::Ok,
        }
    }

    #[test]
    fn test_ring_is_bounded() {
        let b = TelegramBroadcaster::new(500);
        for i in 0..600 {
            b.publish(telegram("1/1/1", i));
        }
        let recent = b.recent(1000);
        assert_eq!(recent.len(), 500);
        assert_eq!(recent.first().unwrap().new_value, Value::Int(100));
        assert_eq!(recent.last().unwrap().new_value, Value::Int(599));
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let b = TelegramBroadcaster::new(500);
        let mut rx = b.subscribe(16);
        for i in 0..5 {
            b.publish(telegram("1/1/1", i));
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap().new_value, Value::Int(i));
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_disconnected() {
        let b = TelegramBroadcaster::new(500);
        let mut slow = b.subscribe(2);
        let mut fast = b.subscribe(64);

        for i in 0..10 {
            b.publish(telegram("1/1/1", i));
        }
        assert_eq!(b.subscriber_count(), 1);

        // The fast subscriber still sees every telegram in order.
        for i in 0..10 {
            assert_eq!(fast.recv().await.unwrap().new_value, Value::Int(i));
        }
        // The slow one got its buffered head, then the channel closed.
        assert_eq!(slow.recv().await.unwrap().new_value, Value::Int(0));
        assert_eq!(slow.recv().await.unwrap().new_value, Value::Int(1));
        assert!(slow.recv().await.is_none());
    }
}
