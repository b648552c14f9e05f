//! Modified notifications.
//!
//! After every committed read-write transaction the database emits one
//! [`ModifiedNotification`]. Notifications are emitted while the write slot
//! is still held, so subscribers receive them in snapshot order.
//!
//! ```rust,ignore
//! let rx = db.subscribe();
//! std::thread::spawn(move || {
//!     while let Ok(note) = rx.recv() {
//!         if note.changes.has_change_for_collection("notes") {
//!             // refresh
//!         }
//!     }
//! });
//! ```

use crate::changeset::ExternalChangeset;
use crate::types::{ConnectionId, Snapshot};
use ciborium::value::Value;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Published after each commit.
#[derive(Debug, Clone, PartialEq)]
pub struct ModifiedNotification {
    /// Snapshot produced by the commit.
    pub snapshot: Snapshot,
    /// Connection that committed.
    pub origin: ConnectionId,
    /// What changed.
    pub changes: Arc<ExternalChangeset>,
    /// Value set by the transaction with `set_custom_notification_object`.
    pub custom: Option<Value>,
}

/// Fan-out of modified notifications with a bounded history.
pub struct NotificationCenter {
    subscribers: RwLock<Vec<Sender<ModifiedNotification>>>,
    history: RwLock<VecDeque<ModifiedNotification>>,
    max_history: usize,
}

impl NotificationCenter {
    /// Creates a center keeping at most `max_history` notifications.
    pub fn new(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            max_history,
        }
    }

    /// Returns a receiver of every future notification.
    pub fn subscribe(&self) -> Receiver<ModifiedNotification> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Publishes a notification. Disconnected subscribers are dropped.
    pub fn emit(&self, notification: ModifiedNotification) {
        {
            let mut history = self.history.write();
            history.push_back(notification.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }
        self.subscribers
            .write()
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Notifications with a snapshot after `cursor`, oldest first.
    pub fn poll(&self, cursor: Snapshot, limit: usize) -> Vec<ModifiedNotification> {
        self.history
            .read()
            .iter()
            .filter(|n| n.snapshot > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Snapshot of the newest notification in history.
    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        self.history.read().back().map(|n| n.snapshot)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Number of notifications in history.
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn note(snapshot: u64) -> ModifiedNotification {
        ModifiedNotification {
            snapshot: Snapshot::new(snapshot),
            origin: ConnectionId::new(),
            changes: Arc::new(ExternalChangeset::default()),
            custom: None,
        }
    }

    #[test]
    fn every_subscriber_receives() {
        let center = NotificationCenter::new(16);
        let a = center.subscribe();
        let b = center.subscribe();
        center.emit(note(1));
        assert_eq!(a.recv().unwrap().snapshot, Snapshot::new(1));
        assert_eq!(b.recv().unwrap().snapshot, Snapshot::new(1));
    }

    #[test]
    fn dropped_subscribers_are_removed() {
        let center = NotificationCenter::new(16);
        drop(center.subscribe());
        assert_eq!(center.subscriber_count(), 1);
        center.emit(note(1));
        assert_eq!(center.subscriber_count(), 0);
    }

    #[test]
    fn poll_respects_cursor_limit_and_history() {
        let center = NotificationCenter::new(4);
        for s in 1..=6 {
            center.emit(note(s));
        }
        assert_eq!(center.history_len(), 4);
        let polled = center.poll(Snapshot::new(3), 2);
        assert_eq!(
            polled.iter().map(|n| n.snapshot.as_u64()).collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert_eq!(center.latest_snapshot(), Some(Snapshot::new(6)));
    }

    #[test]
    fn delivery_across_threads() {
        let center = Arc::new(NotificationCenter::new(16));
        let rx = center.subscribe();
        let sender = Arc::clone(&center);
        let worker = thread::spawn(move || {
            for s in 1..=3 {
                sender.emit(note(s));
            }
        });
        let received: Vec<u64> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap().snapshot.as_u64())
            .collect();
        assert_eq!(received, vec![1, 2, 3]);
        worker.join().unwrap();
    }
}
