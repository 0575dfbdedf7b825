//! Helpdesk realtime delivery service
//!
//! Pushes notifications and ticket updates to connected browser sessions
//! over WebSocket. Domain services publish through [`RealtimeHooks`].

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
pub use websocket::{PushService, RealtimeHooks};
