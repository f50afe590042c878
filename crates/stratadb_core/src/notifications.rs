//! Commit notification fan-out.
//!
//! After every committed read-write transaction, the database publishes one
//! [`CommitNotification`]: to external subscribers via channels, and to an
//! internal bounded history that sibling connections consume for cache
//! coherency and extension state propagation.

use crate::changeset::Changeset;
use crate::types::{ConnectionId, Snapshot};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// The event published after a committed read-write transaction.
#[derive(Clone)]
pub struct CommitNotification {
    /// The snapshot number assigned to the commit.
    pub snapshot: Snapshot,
    /// The connection that performed the commit.
    pub connection_id: ConnectionId,
    /// The commit's changeset.
    pub changeset: Arc<Changeset>,
    /// Optional caller-supplied tag associated with the commit.
    pub tag: Option<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for CommitNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitNotification")
            .field("snapshot", &self.snapshot)
            .field("connection_id", &self.connection_id)
            .field("has_tag", &self.tag.is_some())
            .finish_non_exhaustive()
    }
}

/// The result of catching a connection up on missed commits.
#[derive(Debug)]
pub struct CatchUp {
    /// Notifications newer than the requested snapshot, oldest first.
    pub notifications: Vec<Arc<CommitNotification>>,
    /// False if the history window no longer reaches back far enough; the
    /// caller must then reset its caches wholesale instead of replaying.
    pub complete: bool,
}

/// Distributes commit notifications to subscribers and retains a bounded
/// history for sibling catch-up.
pub struct CommitHub {
    subscribers: RwLock<Vec<Sender<Arc<CommitNotification>>>>,
    history: RwLock<VecDeque<Arc<CommitNotification>>>,
    max_history: usize,
}

impl CommitHub {
    /// Creates a hub retaining at most `max_history` notifications.
    #[must_use]
    pub fn new(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            max_history: max_history.max(1),
        }
    }

    /// Subscribes to all future commit notifications.
    ///
    /// The receiver should be drained regularly; a dropped receiver is
    /// cleaned up on the next publish.
    pub fn subscribe(&self) -> Receiver<Arc<CommitNotification>> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Publishes a notification to the history and every subscriber.
    pub fn publish(&self, notification: Arc<CommitNotification>) {
        {
            let mut history = self.history.write();
            history.push_back(Arc::clone(&notification));
            while history.len() > self.max_history {
                history.pop_front();
            }
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(Arc::clone(&notification)).is_ok());
    }

    /// Returns notifications with a snapshot newer than `after`.
    pub fn since(&self, after: Snapshot) -> CatchUp {
        let history = self.history.read();
        let oldest = history.front().map(|n| n.snapshot);
        let complete = match oldest {
            // Either nothing was ever published, or the history still
            // contains the first notification the caller is missing.
            None => true,
            Some(oldest) => oldest.as_u64() <= after.as_u64() + 1,
        };
        let notifications = history
            .iter()
            .filter(|n| n.snapshot > after)
            .cloned()
            .collect();
        CatchUp {
            notifications,
            complete,
        }
    }

    /// Returns the snapshot of the most recent notification.
    #[must_use]
    pub fn latest_snapshot(&self) -> Snapshot {
        self.history
            .read()
            .back()
            .map(|n| n.snapshot)
            .unwrap_or_default()
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl std::fmt::Debug for CommitHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitHub")
            .field("history_len", &self.history.read().len())
            .field("subscriber_count", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn notification(snapshot: u64) -> Arc<CommitNotification> {
        Arc::new(CommitNotification {
            snapshot: Snapshot::new(snapshot),
            connection_id: ConnectionId::new(1),
            changeset: Arc::new(Changeset::new()),
            tag: None,
        })
    }

    #[test]
    fn publish_and_receive() {
        let hub = CommitHub::new(16);
        let rx = hub.subscribe();
        hub.publish(notification(1));
        let received = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(received.snapshot, Snapshot::new(1));
    }

    #[test]
    fn dropped_subscriber_is_cleaned_up() {
        let hub = CommitHub::new(16);
        let rx = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(rx);
        hub.publish(notification(1));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn since_returns_newer_notifications() {
        let hub = CommitHub::new(16);
        for snapshot in 1..=5 {
            hub.publish(notification(snapshot));
        }
        let catch_up = hub.since(Snapshot::new(2));
        assert!(catch_up.complete);
        let snapshots: Vec<u64> = catch_up
            .notifications
            .iter()
            .map(|n| n.snapshot.as_u64())
            .collect();
        assert_eq!(snapshots, vec![3, 4, 5]);
    }

    #[test]
    fn since_reports_gap_when_history_trimmed() {
        let hub = CommitHub::new(3);
        for snapshot in 1..=10 {
            hub.publish(notification(snapshot));
        }
        // Oldest retained is 8; a caller at snapshot 2 missed 3..=7.
        let catch_up = hub.since(Snapshot::new(2));
        assert!(!catch_up.complete);

        // A caller at snapshot 7 is still fully served.
        let catch_up = hub.since(Snapshot::new(7));
        assert!(catch_up.complete);
        assert_eq!(catch_up.notifications.len(), 3);
    }

    #[test]
    fn latest_snapshot_tracks_publishes() {
        let hub = CommitHub::new(4);
        assert_eq!(hub.latest_snapshot(), Snapshot::new(0));
        hub.publish(notification(7));
        assert_eq!(hub.latest_snapshot(), Snapshot::new(7));
    }
}
