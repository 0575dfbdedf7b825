//! Read and write pumps for a single connection
//!
//! Each connection runs exactly one reader and one writer. The reader owns
//! the inbound half of the transport and the idle deadline; the writer owns
//! the outbound half, the outbox and the heartbeat. Either side moves the
//! connection to `Closing`, after which the other side stops on its own.
//!
//! The pumps are generic over the transport so they can be driven by
//! in-memory channels in tests.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use crate::config::Config;

use super::connection::{CloseReason, ConnectionHandle, EnqueueError, Outbox};
use super::events::{ClientMessage, OutboundFrame, ServerMessage};
use super::hooks::ReadReceiptHandler;
use super::hub::Hub;

/// Timing and size limits applied to every connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpSettings {
    /// Close if nothing arrives for this long
    pub idle_timeout: Duration,
    /// Period of server-initiated ping frames
    pub heartbeat_interval: Duration,
    /// Upper bound for a single write (or coalesced batch) to the transport
    pub write_timeout: Duration,
    /// Largest inbound message accepted
    pub max_message_bytes: usize,
}

impl PumpSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            write_timeout: config.write_timeout(),
            max_message_bytes: config.ws_max_message_bytes,
        }
    }
}

impl Default for PumpSettings {
    fn default() -> Self {
        let idle_timeout = Duration::from_secs(60);
        Self {
            idle_timeout,
            heartbeat_interval: idle_timeout * 9 / 10,
            write_timeout: Duration::from_secs(10),
            max_message_bytes: 512,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error("write timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Drive a registered connection until it closes
///
/// Spawns the write pump, runs the read pump on the current task, then tears
/// down: the connection is unregistered from `hub` exactly once and reaches
/// `Closed` after both pumps have stopped. Returns the first close reason.
pub async fn run_connection<W, R, E>(
    writer: W,
    reader: R,
    conn: ConnectionHandle,
    outbox: Outbox,
    hub: Arc<Hub>,
    receipts: Arc<dyn ReadReceiptHandler>,
    settings: PumpSettings,
) -> CloseReason
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    conn.activate();

    let write_task = tokio::spawn(write_pump(writer, outbox, conn.clone(), settings));

    let reason = read_pump(reader, &conn, receipts.as_ref(), settings).await;
    conn.close(reason);
    let reason = conn.close_reason().unwrap_or(reason);

    hub.unregister(&conn);

    if let Err(e) = write_task.await {
        tracing::error!(
            session_id = %conn.session_id(),
            error = %e,
            "WebSocket write task failed"
        );
    }
    conn.mark_closed();

    tracing::info!(
        session_id = %conn.session_id(),
        user_id = %conn.user_id(),
        reason = %reason,
        "WebSocket connection closed"
    );

    reason
}

async fn read_pump<R, E>(
    mut reader: R,
    conn: &ConnectionHandle,
    receipts: &dyn ReadReceiptHandler,
    settings: PumpSettings,
) -> CloseReason
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        // Any frame, pongs included, restarts the idle deadline.
        let next = tokio::select! {
            _ = conn.closing() => {
                return conn.close_reason().unwrap_or(CloseReason::ClientClosed);
            }
            next = timeout(settings.idle_timeout, reader.next()) => next,
        };

        let message = match next {
            Err(_) => {
                tracing::info!(
                    session_id = %conn.session_id(),
                    user_id = %conn.user_id(),
                    "WebSocket idle timeout"
                );
                return CloseReason::IdleTimeout;
            }
            Ok(None) => return CloseReason::ClientClosed,
            Ok(Some(Err(e))) => {
                tracing::warn!(
                    session_id = %conn.session_id(),
                    error = %e,
                    "WebSocket read error"
                );
                return CloseReason::TransportError;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                if text.len() > settings.max_message_bytes {
                    tracing::warn!(
                        session_id = %conn.session_id(),
                        size = text.len(),
                        limit = settings.max_message_bytes,
                        "WebSocket message too large"
                    );
                    return CloseReason::MessageTooLarge;
                }
                if let Err(reason) = handle_text(conn, &text, receipts) {
                    return reason;
                }
            }
            Message::Binary(data) => {
                if data.len() > settings.max_message_bytes {
                    return CloseReason::MessageTooLarge;
                }
                tracing::debug!(session_id = %conn.session_id(), "Ignoring binary frame");
            }
            // The transport answers pings itself
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                tracing::debug!(session_id = %conn.session_id(), "WebSocket close frame received");
                return CloseReason::ClientClosed;
            }
        }
    }
}

/// Dispatch one client text frame
fn handle_text(
    conn: &ConnectionHandle,
    text: &str,
    receipts: &dyn ReadReceiptHandler,
) -> Result<(), CloseReason> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(
                session_id = %conn.session_id(),
                error = %e,
                "Failed to parse client message"
            );
            return Ok(());
        }
    };

    match message {
        ClientMessage::Ping => {
            let frame = match ServerMessage::Pong.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize pong");
                    return Ok(());
                }
            };
            match conn.try_enqueue(frame) {
                Ok(()) | Err(EnqueueError::Closed) => Ok(()),
                Err(EnqueueError::Full) => Err(CloseReason::Backpressure),
            }
        }
        ClientMessage::MarkRead { notification_id } => {
            receipts.mark_read(conn.user_id(), notification_id);
            Ok(())
        }
        ClientMessage::Unknown => {
            tracing::warn!(
                session_id = %conn.session_id(),
                "Ignoring client message of unknown type"
            );
            Ok(())
        }
    }
}

async fn write_pump<W>(
    mut writer: W,
    mut outbox: Outbox,
    conn: ConnectionHandle,
    settings: PumpSettings,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut heartbeat = interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let failed = loop {
        let result = tokio::select! {
            biased;
            _ = conn.closing() => break false,
            frame = outbox.recv() => match frame {
                Some(frame) => {
                    write_batch(&mut writer, frame, &mut outbox, settings.write_timeout).await
                }
                None => break false,
            },
            _ = heartbeat.tick() => {
                bounded(settings.write_timeout, writer.send(Message::Ping(Vec::new()))).await
            }
        };

        if let Err(e) = result {
            tracing::warn!(
                session_id = %conn.session_id(),
                user_id = %conn.user_id(),
                error = %e,
                "WebSocket write failed"
            );
            conn.close(CloseReason::WriteFailed);
            break true;
        }
    };

    if !failed {
        let farewell = async {
            writer.send(Message::Close(None)).await?;
            writer.close().await
        };
        let _ = timeout(settings.write_timeout, farewell).await;
    }
}

/// Write `first` plus everything already queued, then flush once
///
/// Each frame stays its own text message; only the flush is shared.
async fn write_batch<W>(
    writer: &mut W,
    first: OutboundFrame,
    outbox: &mut Outbox,
    write_timeout: Duration,
) -> Result<(), WriteError>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let pending = outbox.len();
    let batch = async {
        writer.feed(Message::Text(first.to_string())).await?;
        for _ in 0..pending {
            let Some(frame) = outbox.try_recv() else {
                break;
            };
            writer.feed(Message::Text(frame.to_string())).await?;
        }
        writer.flush().await
    };

    bounded(write_timeout, batch).await
}

async fn bounded<F, E>(limit: Duration, write: F) -> Result<(), WriteError>
where
    F: std::future::Future<Output = Result<(), E>>,
    E: Display,
{
    match timeout(limit, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WriteError::Transport(e.to_string())),
        Err(_) => Err(WriteError::Timeout),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::websocket::connection::{self, ConnectionState};
    use crate::websocket::events::UnreadCountPayload;
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use helpdesk_shared::{NotificationId, UserId};
    use serde_json::Value;
    use std::sync::Mutex;
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct RecordingReceipts {
        marked: Mutex<Vec<(UserId, NotificationId)>>,
    }

    impl ReadReceiptHandler for RecordingReceipts {
        fn mark_read(&self, user_id: UserId, notification_id: NotificationId) {
            self.marked.lock().unwrap().push((user_id, notification_id));
        }
    }

    struct Harness {
        client: UnboundedSender<Result<Message, String>>,
        server: UnboundedReceiver<Message>,
        conn: ConnectionHandle,
        hub: Arc<Hub>,
        receipts: Arc<RecordingReceipts>,
        task: JoinHandle<CloseReason>,
    }

    impl Harness {
        fn start(capacity: usize) -> Self {
            let hub = Arc::new(Hub::new());
            let receipts = Arc::new(RecordingReceipts::default());
            let (conn, outbox) = connection::open(UserId(1), capacity);
            hub.register(&conn);

            let (client, reader) = unbounded();
            let (writer, server) = unbounded();
            let task = tokio::spawn(run_connection(
                writer,
                reader,
                conn.clone(),
                outbox,
                Arc::clone(&hub),
                receipts.clone(),
                PumpSettings::default(),
            ));

            Self {
                client,
                server,
                conn,
                hub,
                receipts,
                task,
            }
        }

        fn send_text(&self, text: &str) {
            self.client
                .unbounded_send(Ok(Message::Text(text.to_string())))
                .unwrap();
        }

        /// Next text frame written to the transport, skipping heartbeats
        async fn next_text(&mut self) -> Value {
            loop {
                match self.server.next().await.unwrap() {
                    Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                    Message::Ping(_) => continue,
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
        }

        /// Remaining frames after the writer has stopped
        async fn remaining(&mut self) -> Vec<Message> {
            let mut frames = Vec::new();
            while let Some(frame) = self.server.next().await {
                frames.push(frame);
            }
            frames
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_yields_exactly_one_pong() {
        let mut h = Harness::start(8);

        h.send_text(r#"{"type":"ping"}"#);
        let pong = h.next_text().await;
        assert_eq!(pong["type"], "pong");
        assert!(pong["timestamp"].is_i64());
        assert!(pong.get("data").is_none());

        h.client.close_channel();
        assert_eq!((&mut h.task).await.unwrap(), CloseReason::ClientClosed);

        let rest = h.remaining().await;
        assert!(rest.iter().all(|m| !matches!(m, Message::Text(_))));
        assert!(matches!(rest.last(), Some(Message::Close(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_is_closed_and_unregistered() {
        let h = Harness::start(8);
        assert!(h.hub.is_user_online(UserId(1)));

        let started = Instant::now();
        assert_eq!(h.task.await.unwrap(), CloseReason::IdleTimeout);

        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(!h.hub.is_user_online(UserId(1)));
        assert_eq!(h.hub.client_count(), 0);
        assert_eq!(h.conn.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_resets_idle_deadline() {
        let h = Harness::start(8);

        tokio::time::sleep(Duration::from_secs(50)).await;
        h.client.unbounded_send(Ok(Message::Pong(Vec::new()))).unwrap();
        tokio::time::sleep(Duration::from_secs(50)).await;

        assert!(!h.task.is_finished());
        assert_eq!(h.conn.state(), ConnectionState::Active);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.task.await.unwrap(), CloseReason::IdleTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ping_is_sent() {
        let mut h = Harness::start(8);
        let started = Instant::now();

        let frame = h.server.next().await.unwrap();
        assert!(matches!(frame, Message::Ping(_)));
        assert!(started.elapsed() >= Duration::from_secs(54));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_and_unknown_frames_are_ignored() {
        let mut h = Harness::start(8);

        h.send_text("not json");
        h.send_text(r#"{"type":"subscribe","ticket_id":1}"#);
        h.send_text(r#"{"no_type":true}"#);
        h.client
            .unbounded_send(Ok(Message::Binary(vec![1, 2, 3])))
            .unwrap();
        h.send_text(r#"{"type":"ping"}"#);

        assert_eq!(h.next_text().await["type"], "pong");
        assert_eq!(h.conn.state(), ConnectionState::Active);
        assert!(h.hub.is_user_online(UserId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_message_closes_connection() {
        let h = Harness::start(8);

        h.send_text(&format!(r#"{{"type":"ping","pad":"{}"}}"#, "x".repeat(600)));

        assert_eq!(h.task.await.unwrap(), CloseReason::MessageTooLarge);
        assert!(!h.hub.is_user_online(UserId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_read_is_forwarded() {
        let mut h = Harness::start(8);

        h.send_text(r#"{"type":"mark_read","notification_id":42}"#);
        h.send_text(r#"{"type":"ping"}"#);
        h.next_text().await;

        assert_eq!(
            *h.receipts.marked.lock().unwrap(),
            vec![(UserId(1), NotificationId(42))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcasts_arrive_in_order() {
        let mut h = Harness::start(8);

        for count in 0..5 {
            h.hub.broadcast_to_user(
                UserId(1),
                &ServerMessage::UnreadCount(UnreadCountPayload { count }),
            );
        }

        for expected in 0..5 {
            assert_eq!(h.next_text().await["data"]["count"], expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_closes_connection() {
        let h = Harness::start(8);
        drop(h.server);

        h.hub.broadcast_to_user(
            UserId(1),
            &ServerMessage::UnreadCount(UnreadCountPayload { count: 1 }),
        );

        assert_eq!(h.task.await.unwrap(), CloseReason::WriteFailed);
        assert_eq!(h.conn.state(), ConnectionState::Closed);
        assert_eq!(h.hub.client_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_stops_both_pumps() {
        let mut h = Harness::start(8);

        h.conn.close(CloseReason::Backpressure);

        assert_eq!((&mut h.task).await.unwrap(), CloseReason::Backpressure);
        assert!(matches!(h.remaining().await.last(), Some(Message::Close(_))));
        assert!(!h.hub.is_user_online(UserId(1)));
    }
}
