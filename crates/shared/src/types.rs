//! Domain types shared across the helpdesk platform
//!
//! These are read-only projections of rows owned by the ticket and
//! notification services. The realtime layer never persists them.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl UserId {
    /// Zero is used by upstream services as "no user"
    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Notification ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub u64);

impl From<u64> for NotificationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ticket ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub u64);

impl From<u64> for TicketId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Notifications
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    TicketAssigned,
    TicketStatusChanged,
    TicketCommented,
    TicketCreated,
    TicketOverdue,
    TicketResolved,
    TicketClosed,
    SystemMaintenance,
    UserMention,
    SystemAlert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Delivery channel chosen by the notification service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    #[default]
    InApp,
    Email,
    Webhook,
    #[serde(rename = "websocket")]
    WebSocket,
}

impl NotificationChannel {
    /// Channels that are delivered to live browser sessions
    pub fn is_realtime(&self) -> bool {
        matches!(self, Self::InApp | Self::WebSocket)
    }
}

/// Minimal user projection embedded in notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
}

/// Minimal ticket projection embedded in notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketSummary {
    pub id: TicketId,
    pub ticket_number: String,
    pub title: String,
    pub status: TicketStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient_id: UserId,
    pub notification_type: NotificationType,
    pub title: String,
    pub content: String,
    pub priority: NotificationPriority,
    pub created_at: OffsetDateTime,
    pub is_read: bool,
    pub action_url: String,
    pub sender: Option<UserSummary>,
    pub related_ticket: Option<TicketSummary>,
    pub channel: NotificationChannel,
}

// =============================================================================
// Tickets
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Pending,
    Resolved,
    Closed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketPriority {
    Low,
    Normal,
    High,
    Urgent,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub id: TicketId,
    pub title: String,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub created_by_id: UserId,
    pub assigned_to_id: Option<UserId>,
}

impl Ticket {
    /// Creator and assignee, deduplicated, skipping unset ids
    pub fn stakeholders(&self) -> Vec<UserId> {
        let mut users = Vec::with_capacity(2);
        if !self.created_by_id.is_unset() {
            users.push(self.created_by_id);
        }
        if let Some(assignee) = self.assigned_to_id {
            if !assignee.is_unset() && !users.contains(&assignee) {
                users.push(assignee);
            }
        }
        users
    }
}
