//! Shared application state

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::auth::{AuthState, JwtVerifier};
use crate::config::Config;
use crate::websocket::{
    Hub, LogReadReceipts, PresenceEvent, PumpSettings, PushService, ReadReceiptHandler,
    RealtimeHooks,
};

/// Shared application state passed to all handlers via the axum State extractor
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Registry of live WebSocket connections
    pub hub: Arc<Hub>,
    pub push: Arc<PushService>,
    /// Handed to domain services so they can publish events
    pub hooks: RealtimeHooks,
    pub jwt: Arc<JwtVerifier>,
    /// Where `mark_read` requests from clients go
    pub read_receipts: Arc<dyn ReadReceiptHandler>,
}

impl AppState {
    /// Build the state; the returned receiver carries hub presence changes
    /// and should be handed to [`PushService::forward_presence`]
    pub fn new(config: Config) -> (Self, mpsc::UnboundedReceiver<PresenceEvent>) {
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();

        let hub = Arc::new(Hub::with_presence_events(presence_tx));
        let push = Arc::new(PushService::new(Arc::clone(&hub)));
        let jwt = Arc::new(JwtVerifier::new(&config.jwt_secret));

        let state = Self {
            config: Arc::new(config),
            hub,
            hooks: RealtimeHooks::new(Arc::clone(&push)),
            push,
            jwt,
            read_receipts: Arc::new(LogReadReceipts),
        };

        (state, presence_rx)
    }

    /// Replace the read-receipt handler
    pub fn with_read_receipts(mut self, handler: Arc<dyn ReadReceiptHandler>) -> Self {
        self.read_receipts = handler;
        self
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt: Arc::clone(&self.jwt),
        }
    }

    pub fn pump_settings(&self) -> PumpSettings {
        PumpSettings::from_config(&self.config)
    }
}
