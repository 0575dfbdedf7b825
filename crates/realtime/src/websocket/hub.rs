//! Connection registry and broadcaster
//!
//! The hub is the single authority over which connections are live. All
//! registry mutation and every broadcast lookup go through one mutex, and
//! nothing inside that critical section awaits or performs I/O: fan-out is a
//! `try_send` per connection. Connections whose queue is full are evicted on
//! the spot instead of slowing the caller down.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use helpdesk_shared::UserId;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::connection::{CloseReason, ConnectionHandle, EnqueueError};
use super::events::{OutboundFrame, ServerMessage};

/// Presence side effects of registry changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEvent {
    /// First connection registered for the user
    Online(UserId),
    /// Last connection of the user went away
    Offline(UserId),
}

#[derive(Debug, Default)]
struct Registry {
    users: HashMap<UserId, HashMap<Uuid, ConnectionHandle>>,
}

impl Registry {
    fn client_count(&self) -> usize {
        self.users.values().map(HashMap::len).sum()
    }
}

/// Registry and broadcaster for all live connections in this process
#[derive(Debug, Default)]
pub struct Hub {
    registry: Mutex<Registry>,
    presence: Option<mpsc::UnboundedSender<PresenceEvent>>,
}

/// Snapshot of hub statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Distinct users with at least one connection
    pub online_users: usize,
    /// Total live connections
    pub client_count: usize,
}

impl Hub {
    /// Create a hub that does not report presence changes
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a hub that reports online/offline transitions on `events`
    pub fn with_presence_events(events: mpsc::UnboundedSender<PresenceEvent>) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            presence: Some(events),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Registry updates cannot be left half-applied, so a poisoned lock is still consistent.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PresenceEvent) {
        if let Some(tx) = &self.presence {
            let _ = tx.send(event);
        }
    }

    /// Add a connection to its user's set and mark it active
    ///
    /// Returns false if the connection is already closing or registered.
    pub fn register(&self, conn: &ConnectionHandle) -> bool {
        if conn.is_closing() {
            return false;
        }

        let user_id = conn.user_id();
        let mut registry = self.registry();
        let connections = registry.users.entry(user_id).or_default();
        let first = connections.is_empty();

        if connections.contains_key(&conn.session_id()) {
            return false;
        }
        connections.insert(conn.session_id(), conn.clone());
        conn.activate();

        let user_connections = connections.len();
        if first {
            self.emit(PresenceEvent::Online(user_id));
        }

        tracing::info!(
            session_id = %conn.session_id(),
            user_id = %user_id,
            user_connections,
            total_connections = registry.client_count(),
            "WebSocket connection registered"
        );

        true
    }

    /// Remove a connection; a no-op if it is not registered
    ///
    /// Returns whether the connection was removed by this call.
    pub fn unregister(&self, conn: &ConnectionHandle) -> bool {
        let user_id = conn.user_id();
        let mut registry = self.registry();

        let Some(connections) = registry.users.get_mut(&user_id) else {
            return false;
        };
        if connections.remove(&conn.session_id()).is_none() {
            return false;
        }
        if connections.is_empty() {
            registry.users.remove(&user_id);
            self.emit(PresenceEvent::Offline(user_id));
        }

        tracing::info!(
            session_id = %conn.session_id(),
            user_id = %user_id,
            remaining_connections = registry.client_count(),
            "WebSocket connection unregistered"
        );

        true
    }

    /// Send a message to every connection of one user
    ///
    /// Returns the number of connections the message was queued on. Users
    /// without connections are skipped silently.
    pub fn broadcast_to_user(&self, user_id: UserId, message: &ServerMessage) -> usize {
        let Some(frame) = encode(message) else {
            return 0;
        };

        let (delivered, evicted) = {
            let mut registry = self.registry();
            let Some(connections) = registry.users.get_mut(&user_id) else {
                tracing::debug!(
                    user_id = %user_id,
                    message_type = message.kind(),
                    "No active connections for user"
                );
                return 0;
            };

            let (delivered, evicted) = deliver(connections, &frame);
            if connections.is_empty() {
                registry.users.remove(&user_id);
                self.emit(PresenceEvent::Offline(user_id));
            }
            (delivered, evicted)
        };

        finish_evictions(evicted);

        tracing::debug!(
            user_id = %user_id,
            message_type = message.kind(),
            recipients = delivered,
            "Broadcast to user"
        );

        delivered
    }

    /// Send a message to every registered connection
    pub fn broadcast_to_all(&self, message: &ServerMessage) -> usize {
        let Some(frame) = encode(message) else {
            return 0;
        };

        let (delivered, evicted) = {
            let mut registry = self.registry();
            let mut delivered = 0;
            let mut evicted = Vec::new();

            for connections in registry.users.values_mut() {
                let (sent, dropped) = deliver(connections, &frame);
                delivered += sent;
                evicted.extend(dropped);
            }

            let emptied: Vec<UserId> = registry
                .users
                .iter()
                .filter(|(_, connections)| connections.is_empty())
                .map(|(user_id, _)| *user_id)
                .collect();
            for user_id in emptied {
                registry.users.remove(&user_id);
                self.emit(PresenceEvent::Offline(user_id));
            }

            (delivered, evicted)
        };

        finish_evictions(evicted);

        tracing::debug!(
            message_type = message.kind(),
            recipients = delivered,
            "Broadcast to all"
        );

        delivered
    }

    pub fn is_user_online(&self, user_id: UserId) -> bool {
        self.registry().users.contains_key(&user_id)
    }

    /// Users with at least one live connection, in ascending id order
    pub fn connected_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.registry().users.keys().copied().collect();
        users.sort_unstable();
        users
    }

    /// Total number of live connections across all users
    pub fn client_count(&self) -> usize {
        self.registry().client_count()
    }

    /// Number of live connections held by one user
    pub fn user_connection_count(&self, user_id: UserId) -> usize {
        self.registry()
            .users
            .get(&user_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> HubStats {
        let registry = self.registry();
        HubStats {
            online_users: registry.users.len(),
            client_count: registry.client_count(),
        }
    }
}

fn encode(message: &ServerMessage) -> Option<OutboundFrame> {
    match message.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(
                error = %e,
                message_type = message.kind(),
                "Failed to serialize WebSocket message"
            );
            None
        }
    }
}

/// Queue `frame` on every connection, removing the ones that cannot take it
fn deliver(
    connections: &mut HashMap<Uuid, ConnectionHandle>,
    frame: &OutboundFrame,
) -> (usize, Vec<(ConnectionHandle, EnqueueError)>) {
    let mut delivered = 0;
    let mut evicted = Vec::new();

    connections.retain(|_, conn| match conn.try_enqueue(OutboundFrame::clone(frame)) {
        Ok(()) => {
            delivered += 1;
            true
        }
        Err(e) => {
            evicted.push((conn.clone(), e));
            false
        }
    });

    (delivered, evicted)
}

fn finish_evictions(evicted: Vec<(ConnectionHandle, EnqueueError)>) {
    for (conn, error) in evicted {
        if error == EnqueueError::Full {
            conn.close(CloseReason::Backpressure);
        }
        tracing::warn!(
            session_id = %conn.session_id(),
            user_id = %conn.user_id(),
            error = %error,
            "Evicted WebSocket connection"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::websocket::connection::{self, ConnectionState, Outbox};
    use crate::websocket::events::{SystemNotificationPayload, UnreadCountPayload};
    use helpdesk_shared::NotificationPriority;
    use serde_json::Value;

    fn connect(hub: &Hub, user_id: u64, capacity: usize) -> (ConnectionHandle, Outbox) {
        let (conn, outbox) = connection::open(UserId(user_id), capacity);
        assert!(hub.register(&conn));
        (conn, outbox)
    }

    fn unread(count: u64) -> ServerMessage {
        ServerMessage::UnreadCount(UnreadCountPayload { count })
    }

    fn drain(outbox: &mut Outbox) -> Vec<Value> {
        let mut values = Vec::new();
        while let Some(frame) = outbox.try_recv() {
            values.push(serde_json::from_str(&frame).unwrap());
        }
        values
    }

    fn assert_count_invariant(hub: &Hub) {
        let sum: usize = hub
            .connected_users()
            .into_iter()
            .map(|user| hub.user_connection_count(user))
            .sum();
        assert_eq!(hub.client_count(), sum);
    }

    #[test]
    fn test_offline_user_broadcast_is_noop() {
        let hub = Hub::new();
        assert!(!hub.is_user_online(UserId(1)));
        assert_eq!(hub.broadcast_to_user(UserId(1), &unread(1)), 0);
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn test_register_activates_connection() {
        let hub = Hub::new();
        let (conn, _outbox) = connect(&hub, 1, 8);
        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(hub.is_user_online(UserId(1)));
        assert!(!hub.register(&conn));
        assert_eq!(hub.client_count(), 1);
    }

    #[test]
    fn test_every_connection_receives_each_message_in_order() {
        let hub = Hub::new();
        let mut outboxes: Vec<Outbox> = (0..3).map(|_| connect(&hub, 1, 8).1).collect();

        for count in 0..5 {
            assert_eq!(hub.broadcast_to_user(UserId(1), &unread(count)), 3);
        }

        for outbox in &mut outboxes {
            let counts: Vec<u64> = drain(outbox)
                .iter()
                .map(|v| v["data"]["count"].as_u64().unwrap())
                .collect();
            assert_eq!(counts, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn test_broadcast_to_user_skips_other_users() {
        let hub = Hub::new();
        let (_a, mut outbox_a) = connect(&hub, 1, 8);
        let (_b, mut outbox_b) = connect(&hub, 2, 8);

        hub.broadcast_to_user(UserId(2), &unread(7));

        assert!(drain(&mut outbox_a).is_empty());
        assert_eq!(drain(&mut outbox_b).len(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let hub = Hub::new();
        let (a1, _o1) = connect(&hub, 1, 8);
        let (_a2, _o2) = connect(&hub, 1, 8);
        let (_b, _o3) = connect(&hub, 2, 8);

        assert!(hub.unregister(&a1));
        assert!(!hub.unregister(&a1));
        assert!(!hub.unregister(&a1));

        assert_eq!(hub.client_count(), 2);
        assert_eq!(hub.user_connection_count(UserId(1)), 1);
        assert!(hub.is_user_online(UserId(1)));
        assert_count_invariant(&hub);
    }

    #[test]
    fn test_broadcast_to_all_counts_every_connection() {
        let hub = Hub::new();
        let (_a1, mut o1) = connect(&hub, 1, 8);
        let (_a2, mut o2) = connect(&hub, 1, 8);
        let (_b, mut o3) = connect(&hub, 2, 8);

        let message = ServerMessage::SystemNotification(SystemNotificationPayload {
            title: "t".to_string(),
            content: String::new(),
            priority: NotificationPriority::Normal,
        });
        assert_eq!(hub.broadcast_to_all(&message), 3);

        let received: Vec<Value> = [&mut o1, &mut o2, &mut o3]
            .into_iter()
            .flat_map(drain)
            .collect();
        assert_eq!(received.len(), 3);
        assert!(received
            .iter()
            .all(|v| v["type"] == "system_notification" && v["data"]["title"] == "t"));
    }

    #[test]
    fn test_full_queue_evicts_without_blocking() {
        let hub = Hub::new();
        let (slow, _slow_outbox) = connect(&hub, 1, 1);
        let (_fast, mut fast_outbox) = connect(&hub, 1, 8);

        assert_eq!(hub.broadcast_to_user(UserId(1), &unread(1)), 2);
        // The slow queue is now full; the next broadcast evicts it.
        assert_eq!(hub.broadcast_to_user(UserId(1), &unread(2)), 1);

        assert_eq!(slow.state(), ConnectionState::Closing);
        assert_eq!(slow.close_reason(), Some(CloseReason::Backpressure));
        assert_eq!(hub.user_connection_count(UserId(1)), 1);
        assert_eq!(drain(&mut fast_outbox).len(), 2);
        assert!(!hub.unregister(&slow));
        assert_count_invariant(&hub);
    }

    #[test]
    fn test_eviction_of_last_connection_takes_user_offline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = Hub::with_presence_events(tx);
        let (conn, _outbox) = connect(&hub, 3, 1);

        hub.broadcast_to_all(&unread(1));
        hub.broadcast_to_all(&unread(2));

        assert!(conn.is_closing());
        assert!(!hub.is_user_online(UserId(3)));
        assert_eq!(rx.try_recv().unwrap(), PresenceEvent::Online(UserId(3)));
        assert_eq!(rx.try_recv().unwrap(), PresenceEvent::Offline(UserId(3)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dead_writer_is_evicted() {
        let hub = Hub::new();
        let (conn, outbox) = connect(&hub, 1, 8);
        drop(outbox);

        assert_eq!(hub.broadcast_to_user(UserId(1), &unread(1)), 0);
        assert_eq!(hub.client_count(), 0);
        assert!(!hub.unregister(&conn));
    }

    #[test]
    fn test_presence_events_on_first_and_last_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = Hub::with_presence_events(tx);

        let (a1, _o1) = connect(&hub, 1, 8);
        let (a2, _o2) = connect(&hub, 1, 8);
        hub.unregister(&a1);
        hub.unregister(&a2);
        hub.unregister(&a2);

        assert_eq!(rx.try_recv().unwrap(), PresenceEvent::Online(UserId(1)));
        assert_eq!(rx.try_recv().unwrap(), PresenceEvent::Offline(UserId(1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closing_connection_is_not_registered() {
        let hub = Hub::new();
        let (conn, _outbox) = connection::open(UserId(1), 8);
        conn.close(CloseReason::ClientClosed);
        assert!(!hub.register(&conn));
        assert!(!hub.is_user_online(UserId(1)));
    }

    #[test]
    fn test_queries() {
        let hub = Hub::new();
        let (_c1, _o1) = connect(&hub, 9, 8);
        let (_c2, _o2) = connect(&hub, 2, 8);
        let (_c3, _o3) = connect(&hub, 2, 8);

        assert_eq!(hub.connected_users(), vec![UserId(2), UserId(9)]);
        assert_eq!(
            hub.stats(),
            HubStats {
                online_users: 2,
                client_count: 3
            }
        );
        assert_count_invariant(&hub);
    }
}
