//! WebSocket connection management
//!
//! A connection is split in two halves:
//! - [`ConnectionHandle`]: cheap to clone, kept in the hub registry, only ever
//!   used for non-blocking enqueue and lifecycle transitions
//! - [`Outbox`]: the receiving end of the bounded outbound queue, owned by the
//!   connection's single write task
//!
//! Overflow policy: a full queue closes the connection. The broadcaster never
//! waits for a slow consumer.

use std::sync::{Arc, OnceLock};

use helpdesk_shared::UserId;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::events::OutboundFrame;

/// Default bound of the per-connection outbound queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Connection lifecycle: `Connecting → Active → Closing → Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a connection left the `Active` state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame or the stream ended
    ClientClosed,
    /// Reading from the transport failed
    TransportError,
    /// Nothing received within the idle deadline
    IdleTimeout,
    /// Inbound message exceeded the size limit
    MessageTooLarge,
    /// Writing to the transport failed or timed out
    WriteFailed,
    /// Outbound queue was full
    Backpressure,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::IdleTimeout => "idle_timeout",
            Self::MessageTooLarge => "message_too_large",
            Self::WriteFailed => "write_failed",
            Self::Backpressure => "backpressure",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-blocking enqueue failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("outbound queue is full")]
    Full,
    #[error("connection is closed")]
    Closed,
}

#[derive(Debug)]
struct Inner {
    session_id: Uuid,
    user_id: UserId,
    established_at: OffsetDateTime,
    sender: mpsc::Sender<OutboundFrame>,
    state: watch::Sender<ConnectionState>,
    close_reason: OnceLock<CloseReason>,
}

/// Registry-side view of an active WebSocket connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

/// Receiving end of a connection's outbound queue
#[derive(Debug)]
pub struct Outbox {
    receiver: mpsc::Receiver<OutboundFrame>,
}

/// Create a connection for `user_id` with a queue bounded to `capacity`
pub fn open(user_id: UserId, capacity: usize) -> (ConnectionHandle, Outbox) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let (state, _) = watch::channel(ConnectionState::Connecting);

    let handle = ConnectionHandle {
        inner: Arc::new(Inner {
            session_id: Uuid::new_v4(),
            user_id,
            established_at: OffsetDateTime::now_utc(),
            sender,
            state,
            close_reason: OnceLock::new(),
        }),
    };

    (handle, Outbox { receiver })
}

impl ConnectionHandle {
    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn user_id(&self) -> UserId {
        self.inner.user_id
    }

    pub fn established_at(&self) -> OffsetDateTime {
        self.inner.established_at
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_closing(&self) -> bool {
        self.state() >= ConnectionState::Closing
    }

    /// First reason recorded by [`close`](Self::close), if any
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.get().copied()
    }

    /// Attempt to enqueue a frame without waiting
    ///
    /// O(1); never performs I/O. A full queue is reported, not waited on.
    pub fn try_enqueue(&self, frame: OutboundFrame) -> Result<(), EnqueueError> {
        if self.is_closing() {
            return Err(EnqueueError::Closed);
        }

        self.inner.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// `Connecting → Active`
    pub fn activate(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Active;
                true
            } else {
                false
            }
        })
    }

    /// Move to `Closing`; returns false if the connection was already closing
    ///
    /// Safe to call from either task, the hub, or repeatedly.
    pub fn close(&self, reason: CloseReason) -> bool {
        let transitioned = self.inner.state.send_if_modified(|state| {
            if *state < ConnectionState::Closing {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });

        if transitioned {
            let _ = self.inner.close_reason.set(reason);
            tracing::debug!(
                session_id = %self.inner.session_id,
                user_id = %self.inner.user_id,
                reason = %reason,
                "Connection closing"
            );
        }

        transitioned
    }

    /// Both pumps have stopped
    pub(crate) fn mark_closed(&self) {
        self.inner.state.send_replace(ConnectionState::Closed);
    }

    /// Resolves once the connection is `Closing` or `Closed`
    pub async fn closing(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|state| *state >= ConnectionState::Closing).await;
    }

    /// Configured bound of the outbound queue
    pub fn queue_capacity(&self) -> usize {
        self.inner.sender.max_capacity()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.session_id == other.inner.session_id
    }
}

impl Eq for ConnectionHandle {}

impl Outbox {
    /// Wait for the next queued frame
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.receiver.recv().await
    }

    /// Take a queued frame if one is ready
    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.receiver.try_recv().ok()
    }

    /// Number of frames currently queued
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
