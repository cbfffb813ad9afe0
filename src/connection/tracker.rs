//! In-process connection bookkeeping: the per-user connection cap and the
//! live ConnectionID → outbound-sender map Fanout dispatches through.
//!
//! Grounded directly on `realtime/websocket.rs`'s `ConnectionTracker`
//! (`DashMap<String, AtomicUsize>`, `try_acquire`/`release`, entry-API release
//! to avoid the read-lock-then-write-lock deadlock the teacher's comment
//! documents) plus a second `DashMap` generalizing the teacher's per-chat
//! broadcast channel (`SseState::get_channel`) into a per-connection point-to-
//! point channel, since delivery here targets one ConnectionID, not a topic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};

use crate::domain::{ConnectionId, UserId};

use super::frame::ServerFrame;

pub struct ConnectionTracker {
    connections_per_user: DashMap<String, AtomicUsize>,
    max_connections_per_user: usize,
}

impl ConnectionTracker {
    pub fn new(max_connections_per_user: usize) -> Self {
        Self { connections_per_user: DashMap::new(), max_connections_per_user }
    }

    pub fn try_acquire(&self, user_id: &UserId) -> bool {
        let entry = self
            .connections_per_user
            .entry(user_id.as_str().to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        let current = entry.fetch_add(1, Ordering::SeqCst);
        if current >= self.max_connections_per_user {
            entry.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn release(&self, user_id: &UserId) {
        if let dashmap::mapref::entry::Entry::Occupied(entry) =
            self.connections_per_user.entry(user_id.as_str().to_string())
        {
            let prev = entry.get().fetch_sub(1, Ordering::SeqCst);
            if prev <= 1 {
                entry.remove();
            }
        }
    }

    pub fn count(&self, user_id: &UserId) -> usize {
        self.connections_per_user.get(user_id.as_str()).map(|c| c.load(Ordering::SeqCst)).unwrap_or(0)
    }
}

struct Slot {
    sender: mpsc::Sender<ServerFrame>,
    slow_consumer: Arc<Notify>,
}

/// The process-local directory Fanout consults (by way of the `Registry`,
/// which gives it a `ConnectionId` + `GatewayId`) to find the live sender for
/// a connection hosted by *this* process.
#[derive(Clone, Default)]
pub struct LocalConnectionMap {
    senders: Arc<DashMap<String, Slot>>,
}

impl LocalConnectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the connection's outbound sender and returns the `Notify`
    /// the session's writer task should race against `outbound_rx.recv()`:
    /// a `try_send` failure below wakes it so the writer can push
    /// `ConnectionClosing{SlowConsumer}` and tear the session down instead of
    /// silently dropping frames forever.
    pub fn insert(&self, connection_id: &ConnectionId, sender: mpsc::Sender<ServerFrame>) -> Arc<Notify> {
        let slow_consumer = Arc::new(Notify::new());
        self.senders.insert(
            connection_id.as_str().to_string(),
            Slot { sender, slow_consumer: slow_consumer.clone() },
        );
        slow_consumer
    }

    pub fn remove(&self, connection_id: &ConnectionId) {
        self.senders.remove(connection_id.as_str());
    }

    /// `true` if the frame was accepted onto the connection's bounded
    /// outbound queue, `false` if the queue was full (slow consumer — the
    /// connection's `slow_consumer` notify has been fired so its writer task
    /// closes the session) or the connection is not hosted here.
    pub fn try_send(&self, connection_id: &ConnectionId, frame: ServerFrame) -> bool {
        match self.senders.get(connection_id.as_str()) {
            Some(slot) => match slot.sender.try_send(frame) {
                Ok(()) => true,
                Err(_) => {
                    slot.slow_consumer.notify_one();
                    false
                }
            },
            None => false,
        }
    }

    /// Fans a frame out to every connection hosted by this process — used at
    /// shutdown to emit `connection_closing{reason: server_shutdown}` before
    /// the listener stops accepting (§5 shutdown discipline, step 2).
    pub fn broadcast(&self, frame: ServerFrame) {
        for entry in self.senders.iter() {
            let _ = entry.value().sender.try_send(frame.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_per_user_connection_cap() {
        let tracker = ConnectionTracker::new(3);
        let user = UserId::new("alice").unwrap();

        assert!(tracker.try_acquire(&user));
        assert!(tracker.try_acquire(&user));
        assert!(tracker.try_acquire(&user));
        assert!(!tracker.try_acquire(&user));
        assert_eq!(tracker.count(&user), 3);

        tracker.release(&user);
        assert_eq!(tracker.count(&user), 2);
        assert!(tracker.try_acquire(&user));
    }

    #[test]
    fn release_on_empty_user_is_a_no_op() {
        let tracker = ConnectionTracker::new(3);
        let user = UserId::new("alice").unwrap();
        tracker.release(&user);
        assert_eq!(tracker.count(&user), 0);
    }

    #[tokio::test]
    async fn try_send_reports_false_for_unknown_connection() {
        let map = LocalConnectionMap::new();
        let conn_id = ConnectionId::new("c1").unwrap();
        assert!(!map.try_send(&conn_id, ServerFrame::Ping));
    }

    #[tokio::test]
    async fn try_send_delivers_to_registered_connection() {
        let map = LocalConnectionMap::new();
        let conn_id = ConnectionId::new("c1").unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        map.insert(&conn_id, tx);

        assert!(map.try_send(&conn_id, ServerFrame::Ping));
        assert!(matches!(rx.recv().await, Some(ServerFrame::Ping)));
    }

    #[tokio::test]
    async fn try_send_notifies_slow_consumer_on_full_queue() {
        let map = LocalConnectionMap::new();
        let conn_id = ConnectionId::new("c1").unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let slow_consumer = map.insert(&conn_id, tx);

        assert!(map.try_send(&conn_id, ServerFrame::Ping));
        assert!(!map.try_send(&conn_id, ServerFrame::Ping));

        tokio::time::timeout(std::time::Duration::from_millis(100), slow_consumer.notified())
            .await
            .expect("slow consumer notify should fire once the queue is full");
    }
}
