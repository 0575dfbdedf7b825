//! Integration hooks for domain services
//!
//! Ticket and notification services call these at their event boundaries.
//! Hooks only enqueue; they never wait on a client. A hook set built without
//! a push service logs and does nothing, so callers never need to check.

use std::sync::Arc;

use helpdesk_shared::{Notification, NotificationId, Ticket, UserId};

use super::push::PushService;

/// Receives `mark_read` requests coming in over a connection
///
/// Implemented by whatever owns notification storage. Called from the
/// connection's read task, so implementations must not block.
pub trait ReadReceiptHandler: Send + Sync {
    fn mark_read(&self, user_id: UserId, notification_id: NotificationId);
}

/// Read-receipt handler used when no notification store is wired in
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReadReceipts;

impl ReadReceiptHandler for LogReadReceipts {
    fn mark_read(&self, user_id: UserId, notification_id: NotificationId) {
        tracing::info!(
            user_id = %user_id,
            notification_id = %notification_id,
            "Notification marked read over WebSocket"
        );
    }
}

/// Event-boundary hooks forwarding into the push service
#[derive(Debug, Clone, Default)]
pub struct RealtimeHooks {
    push: Option<Arc<PushService>>,
}

impl RealtimeHooks {
    pub fn new(push: Arc<PushService>) -> Self {
        Self { push: Some(push) }
    }

    /// Hooks that accept every call and deliver nothing
    pub fn disabled() -> Self {
        Self { push: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.push.is_some()
    }

    fn push(&self, hook: &'static str) -> Option<&PushService> {
        if self.push.is_none() {
            tracing::debug!(hook, "Realtime push service not configured, skipping");
        }
        self.push.as_deref()
    }

    /// A notification was stored; realtime channels are pushed immediately
    pub fn notification_created(&self, notification: &Notification) {
        if !notification.channel.is_realtime() {
            return;
        }
        if let Some(push) = self.push("notification_created") {
            push.push_notification(notification);
        }
    }

    /// `unread_count` is the user's count after the change
    pub fn notification_marked_read(
        &self,
        user_id: UserId,
        notification_id: NotificationId,
        unread_count: u64,
    ) {
        if let Some(push) = self.push("notification_marked_read") {
            tracing::debug!(
                user_id = %user_id,
                notification_id = %notification_id,
                unread_count,
                "Notification marked read"
            );
            push.push_unread_count(user_id, unread_count);
        }
    }

    pub fn all_notifications_marked_read(&self, user_id: UserId) {
        if let Some(push) = self.push("all_notifications_marked_read") {
            push.push_unread_count(user_id, 0);
        }
    }

    pub fn ticket_updated(&self, ticket: &Ticket, update_type: &str) {
        if let Some(push) = self.push("ticket_updated") {
            push.push_ticket_update(ticket, update_type);
        }
    }
}
