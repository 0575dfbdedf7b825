//! Push service
//!
//! Turns domain events into hub broadcasts. This is the only realtime
//! component that knows what a notification or a ticket looks like; the hub
//! and the connections only ever see [`ServerMessage`]s.

use std::sync::Arc;

use helpdesk_shared::{Notification, NotificationPriority, Ticket, UserId};
use tokio::sync::mpsc;

use super::events::{
    NotificationPayload, PresenceStatus, ServerMessage, SystemNotificationPayload,
    TicketUpdatePayload, UnreadCountPayload, UserStatusPayload, WelcomePayload,
};
use super::hub::{Hub, PresenceEvent};

/// Domain-aware front of the hub
#[derive(Debug, Clone)]
pub struct PushService {
    hub: Arc<Hub>,
}

impl PushService {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Deliver a notification to its recipient if they are connected
    ///
    /// Offline recipients are skipped; nothing is kept for later.
    pub fn push_notification(&self, notification: &Notification) {
        let user_id = notification.recipient_id;
        if !self.hub.is_user_online(user_id) {
            tracing::debug!(
                user_id = %user_id,
                notification_id = %notification.id,
                "Recipient offline, skipping realtime notification"
            );
            return;
        }

        let message = ServerMessage::Notification(NotificationPayload::from(notification));
        let delivered = self.hub.broadcast_to_user(user_id, &message);

        tracing::debug!(
            user_id = %user_id,
            notification_id = %notification.id,
            connections = delivered,
            "Pushed notification"
        );
    }

    /// Announce something to every connected user
    pub fn push_system_notification(&self, title: &str, content: &str) -> usize {
        let message = ServerMessage::SystemNotification(SystemNotificationPayload {
            title: title.to_string(),
            content: content.to_string(),
            priority: NotificationPriority::Normal,
        });
        let delivered = self.hub.broadcast_to_all(&message);

        tracing::info!(title = %title, connections = delivered, "Pushed system notification");
        delivered
    }

    pub fn push_unread_count(&self, user_id: UserId, count: u64) {
        if !self.hub.is_user_online(user_id) {
            return;
        }

        let message = ServerMessage::UnreadCount(UnreadCountPayload { count });
        self.hub.broadcast_to_user(user_id, &message);
    }

    /// Tell the ticket's creator and assignee that it changed
    pub fn push_ticket_update(&self, ticket: &Ticket, update_type: &str) {
        let message = ServerMessage::TicketUpdate(TicketUpdatePayload::new(ticket, update_type));

        for user_id in ticket.stakeholders() {
            if !self.hub.is_user_online(user_id) {
                continue;
            }
            self.hub.broadcast_to_user(user_id, &message);
            tracing::debug!(
                ticket_id = %ticket.id,
                user_id = %user_id,
                update_type = %update_type,
                "Pushed ticket update"
            );
        }
    }

    pub fn push_user_status_update(&self, user_id: UserId, status: PresenceStatus) {
        let message = ServerMessage::UserStatus(UserStatusPayload { user_id, status });
        self.hub.broadcast_to_all(&message);

        tracing::debug!(user_id = %user_id, status = %status, "Pushed user status");
    }

    pub fn send_welcome_message(&self, user_id: UserId) {
        if !self.hub.is_user_online(user_id) {
            return;
        }

        let message = ServerMessage::Welcome(WelcomePayload::default());
        self.hub.broadcast_to_user(user_id, &message);
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.hub.connected_users()
    }

    pub fn online_user_count(&self) -> usize {
        self.hub.stats().online_users
    }

    pub fn is_user_online(&self, user_id: UserId) -> bool {
        self.hub.is_user_online(user_id)
    }

    /// Broadcast hub presence changes until the hub side hangs up
    pub async fn forward_presence(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<PresenceEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                PresenceEvent::Online(user_id) => {
                    self.push_user_status_update(user_id, PresenceStatus::Online)
                }
                PresenceEvent::Offline(user_id) => {
                    self.push_user_status_update(user_id, PresenceStatus::Offline)
                }
            }
        }

        tracing::debug!("Presence event channel closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::websocket::connection::{self, ConnectionHandle, Outbox};
    use helpdesk_shared::{
        NotificationChannel, NotificationId, NotificationType, TicketId, TicketPriority,
        TicketStatus,
    };
    use serde_json::Value;
    use time::OffsetDateTime;

    fn service() -> PushService {
        PushService::new(Arc::new(Hub::new()))
    }

    fn connect(push: &PushService, user_id: u64) -> (ConnectionHandle, Outbox) {
        let (conn, outbox) = connection::open(UserId(user_id), 16);
        push.hub().register(&conn);
        (conn, outbox)
    }

    fn drain(outbox: &mut Outbox) -> Vec<Value> {
        let mut values = Vec::new();
        while let Some(frame) = outbox.try_recv() {
            values.push(serde_json::from_str(&frame).unwrap());
        }
        values
    }

    fn ticket(created_by: u64, assigned_to: Option<u64>) -> Ticket {
        Ticket {
            id: TicketId(77),
            title: "Printer on fire".to_string(),
            status: TicketStatus::InProgress,
            priority: TicketPriority::Urgent,
            created_by_id: UserId(created_by),
            assigned_to_id: assigned_to.map(UserId),
        }
    }

    fn notification(recipient: u64) -> Notification {
        Notification {
            id: NotificationId(5),
            recipient_id: UserId(recipient),
            notification_type: NotificationType::TicketCommented,
            title: "New comment".to_string(),
            content: "Someone replied".to_string(),
            priority: NotificationPriority::Normal,
            created_at: OffsetDateTime::now_utc(),
            is_read: false,
            action_url: "/tickets/77".to_string(),
            sender: None,
            related_ticket: None,
            channel: NotificationChannel::InApp,
        }
    }

    #[test]
    fn test_ticket_update_reaches_only_online_assignee() {
        let push = service();
        let (_conn, mut assignee) = connect(&push, 20);

        push.push_ticket_update(&ticket(10, Some(20)), "status_changed");

        let received = drain(&mut assignee);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["type"], "ticket_update");
        assert_eq!(received[0]["data"]["ticket_id"], 77);
        assert_eq!(received[0]["data"]["status"], "in_progress");
        assert_eq!(received[0]["data"]["priority"], "urgent");
        assert_eq!(received[0]["data"]["update_type"], "status_changed");
        assert!(!push.is_user_online(UserId(10)));
    }

    #[test]
    fn test_ticket_update_deduplicates_self_assignment() {
        let push = service();
        let (_conn, mut outbox) = connect(&push, 10);

        push.push_ticket_update(&ticket(10, Some(10)), "updated");

        assert_eq!(drain(&mut outbox).len(), 1);
    }

    #[test]
    fn test_notification_to_offline_recipient_is_dropped() {
        let push = service();
        let (_conn, mut other) = connect(&push, 2);

        push.push_notification(&notification(1));

        assert!(drain(&mut other).is_empty());
        assert_eq!(push.hub().client_count(), 1);
    }

    #[test]
    fn test_notification_payload() {
        let push = service();
        let (_conn, mut outbox) = connect(&push, 1);

        push.push_notification(&notification(1));

        let received = drain(&mut outbox);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["type"], "notification");
        assert_eq!(received[0]["data"]["type"], "ticket_commented");
        assert_eq!(received[0]["data"]["title"], "New comment");
        assert_eq!(received[0]["data"]["is_read"], false);
    }

    #[test]
    fn test_system_notification_has_normal_priority() {
        let push = service();
        let (_a, mut a) = connect(&push, 1);
        let (_b, mut b) = connect(&push, 2);

        assert_eq!(push.push_system_notification("Maintenance", "At 22:00"), 2);

        for outbox in [&mut a, &mut b] {
            let received = drain(outbox);
            assert_eq!(received[0]["type"], "system_notification");
            assert_eq!(received[0]["data"]["priority"], "normal");
            assert_eq!(received[0]["data"]["content"], "At 22:00");
        }
    }

    #[test]
    fn test_unread_count_and_welcome_are_online_gated() {
        let push = service();
        push.push_unread_count(UserId(1), 3);
        push.send_welcome_message(UserId(1));

        let (_conn, mut outbox) = connect(&push, 1);
        push.send_welcome_message(UserId(1));
        push.push_unread_count(UserId(1), 3);

        let received = drain(&mut outbox);
        assert_eq!(received.len(), 2);
        assert_eq!(received[0]["type"], "welcome");
        assert!(received[0]["data"]["features"].is_array());
        assert_eq!(received[1]["data"]["count"], 3);
    }

    #[test]
    fn test_online_queries() {
        let push = service();
        let (_a, _oa) = connect(&push, 4);
        let (_b, _ob) = connect(&push, 4);
        let (_c, _oc) = connect(&push, 1);

        assert_eq!(push.online_users(), vec![UserId(1), UserId(4)]);
        assert_eq!(push.online_user_count(), 2);
        assert!(push.is_user_online(UserId(4)));
    }

    #[tokio::test]
    async fn test_forward_presence_broadcasts_user_status() {
        let (tx, rx) = mpsc::unbounded_channel();
        let push = Arc::new(PushService::new(Arc::new(Hub::with_presence_events(tx))));

        let (_watcher, mut watcher_outbox) = connect(&push, 1);
        let (other, _other_outbox) = connect(&push, 2);
        push.hub().unregister(&other);

        let forwarder = tokio::spawn(Arc::clone(&push).forward_presence(rx));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        forwarder.abort();

        let statuses: Vec<(u64, String)> = drain(&mut watcher_outbox)
            .iter()
            .filter(|v| v["type"] == "user_status")
            .map(|v| {
                (
                    v["data"]["user_id"].as_u64().unwrap(),
                    v["data"]["status"].as_str().unwrap().to_string(),
                )
            })
            .collect();

        assert_eq!(
            statuses,
            vec![
                (1, "online".to_string()),
                (2, "online".to_string()),
                (2, "offline".to_string()),
            ]
        );
    }
}
