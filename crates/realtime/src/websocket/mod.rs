//! Real-time delivery over WebSocket
//!
//! Pushes notifications and ticket changes to connected browser sessions.
//! Delivery is best-effort and at-most-once: users without a live connection
//! simply miss the message, and nothing is replayed when they reconnect.
//!
//! # Architecture
//!
//! - **Connection**: lifecycle and bounded outbound queue of one socket
//! - **Pump**: the read and write tasks driving a connection
//! - **Hub**: registry of live connections and non-blocking fan-out
//! - **Push**: turns domain objects into server messages
//! - **Hooks**: entry points for ticket and notification services
//! - **Events**: client and server message definitions
//! - **Handler**: Axum upgrade route

pub mod connection;
pub mod events;
pub mod handler;
pub mod hooks;
pub mod hub;
pub mod pump;
pub mod push;

pub use connection::{CloseReason, ConnectionHandle, ConnectionState, Outbox};
pub use events::{ClientMessage, PresenceStatus, ServerMessage};
pub use handler::ws_handler;
pub use hooks::{LogReadReceipts, ReadReceiptHandler, RealtimeHooks};
pub use hub::{Hub, HubStats, PresenceEvent};
pub use pump::{run_connection, PumpSettings};
pub use push::PushService;
