//! WebSocket message types and serialization
//!
//! Defines all client-to-server and server-to-client messages
//! with type-safe serde serialization.

use std::sync::Arc;

use helpdesk_shared::{
    Notification, NotificationId, NotificationPriority, NotificationType, Ticket, TicketId,
    TicketPriority, TicketStatus, TicketSummary, UserId, UserSummary,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A server message serialized once and shared by every recipient queue
pub type OutboundFrame = Arc<str>;

// =============================================================================
// Client-to-Server Messages
// =============================================================================

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Application-level heartbeat, answered with a pong
    Ping,

    /// Client marked a notification as read
    MarkRead { notification_id: NotificationId },

    /// Any `type` this server does not know about
    #[serde(other)]
    Unknown,
}

// =============================================================================
// Server-to-Client Messages
// =============================================================================

/// Messages sent from server to client
///
/// Encoded as `{"type": ..., "data": {...}, "timestamp": <unix>}`; payload-less
/// kinds omit `data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A notification addressed to the user
    Notification(NotificationPayload),

    /// A ticket the user created or is assigned to changed
    TicketUpdate(TicketUpdatePayload),

    /// Unread notification counter changed
    UnreadCount(UnreadCountPayload),

    /// Announcement sent to everyone
    SystemNotification(SystemNotificationPayload),

    /// A user came online or went offline
    UserStatus(UserStatusPayload),

    /// Greeting sent right after connecting
    Welcome(WelcomePayload),

    /// Reply to a client ping
    Pong,
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(flatten)]
    message: &'a ServerMessage,
    timestamp: i64,
}

impl ServerMessage {
    /// Wire name of this message kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Notification(_) => "notification",
            Self::TicketUpdate(_) => "ticket_update",
            Self::UnreadCount(_) => "unread_count",
            Self::SystemNotification(_) => "system_notification",
            Self::UserStatus(_) => "user_status",
            Self::Welcome(_) => "welcome",
            Self::Pong => "pong",
        }
    }

    /// Serialize with the current unix timestamp
    pub fn encode(&self) -> Result<OutboundFrame, serde_json::Error> {
        self.encode_at(OffsetDateTime::now_utc())
    }

    pub fn encode_at(&self, at: OffsetDateTime) -> Result<OutboundFrame, serde_json::Error> {
        let envelope = Envelope {
            message: self,
            timestamp: at.unix_timestamp(),
        };
        serde_json::to_string(&envelope).map(OutboundFrame::from)
    }
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPayload {
    pub id: NotificationId,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub title: String,
    pub content: String,
    pub priority: NotificationPriority,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub is_read: bool,
    pub action_url: String,
    pub sender: Option<UserSummary>,
    pub related_ticket: Option<TicketSummary>,
}

impl From<&Notification> for NotificationPayload {
    fn from(n: &Notification) -> Self {
        Self {
            id: n.id,
            notification_type: n.notification_type,
            title: n.title.clone(),
            content: n.content.clone(),
            priority: n.priority,
            created_at: n.created_at,
            is_read: n.is_read,
            action_url: n.action_url.clone(),
            sender: n.sender.clone(),
            related_ticket: n.related_ticket.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TicketUpdatePayload {
    pub ticket_id: TicketId,
    pub title: String,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub update_type: String,
}

impl TicketUpdatePayload {
    pub fn new(ticket: &Ticket, update_type: &str) -> Self {
        Self {
            ticket_id: ticket.id,
            title: ticket.title.clone(),
            status: ticket.status,
            priority: ticket.priority,
            update_type: update_type.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnreadCountPayload {
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemNotificationPayload {
    pub title: String,
    pub content: String,
    pub priority: NotificationPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserStatusPayload {
    pub user_id: UserId,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WelcomePayload {
    pub message: String,
    pub features: Vec<String>,
}

impl Default for WelcomePayload {
    fn default() -> Self {
        Self {
            message: "Welcome to real-time helpdesk notifications!".to_string(),
            features: vec![
                "Real-time notifications".to_string(),
                "Ticket status updates".to_string(),
                "System announcements".to_string(),
                "Online presence".to_string(),
            ],
        }
    }
}
