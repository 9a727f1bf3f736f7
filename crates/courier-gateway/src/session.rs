use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::frames;
use crate::manager::{Session, SessionManager};

/// Deadline for a single frame write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run one authenticated socket to completion: register the session, pump
/// frames both ways, tear everything down when either pump stops.
pub async fn serve_socket(socket: WebSocket, manager: SessionManager, user_id: Uuid) {
    let (ws_tx, ws_rx) = socket.split();
    let (session, outbound_rx) = Session::new(user_id);

    manager.register(session.clone()).await;

    let heartbeat_interval = manager.config().heartbeat_interval;
    let mut write_task = tokio::spawn(write_pump(ws_tx, outbound_rx, heartbeat_interval));
    let mut read_task = tokio::spawn(read_pump(ws_rx, manager.clone(), session.clone()));

    // Either pump terminating tears the session down.
    tokio::select! {
        _ = &mut write_task => read_task.abort(),
        _ = &mut read_task => write_task.abort(),
    }

    manager.unregister(session).await;
    debug!(user_id = %user_id, "socket closed");
}

/// Read frames until the transport errors or the heartbeat deadline lapses.
///
/// Only pongs extend the deadline: a client that sends traffic but never
/// answers pings is torn down after `connection_timeout` all the same.
async fn read_pump(
    mut ws_rx: SplitStream<WebSocket>,
    manager: SessionManager,
    session: Arc<Session>,
) {
    let timeout = manager.config().connection_timeout;
    let mut deadline = Instant::now() + timeout;

    loop {
        let frame = match tokio::time::timeout_at(deadline, ws_rx.next()).await {
            Err(_) => {
                warn!(
                    connection_id = %session.id,
                    user_id = %session.user_id,
                    "heartbeat deadline exceeded"
                );
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(connection_id = %session.id, "websocket read error: {e}");
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Pong(_) => {
                session.touch_heartbeat();
                deadline = Instant::now() + timeout;

                // Mirror the liveness into the durable record.
                let expires_at = chrono::Utc::now()
                    + chrono::Duration::from_std(timeout).unwrap_or_default();
                if let Err(e) = manager
                    .store()
                    .touch_connection_heartbeat(session.id, expires_at)
                {
                    warn!(connection_id = %session.id, "failed to persist heartbeat: {e}");
                }
            }
            Message::Text(text) => {
                frames::dispatch(&manager, &session, text.as_str()).await;
            }
            Message::Close(_) => return,
            // Binary frames and pings (the client is not required to
            // originate pings) are ignored.
            _ => {}
        }
    }
}

/// Drain the outbound buffer onto the socket and keep the heartbeat going.
/// A closed buffer means the session was unregistered: say goodbye cleanly.
async fn write_pump(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Utf8Bytes>,
    heartbeat_interval: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat_interval);
    // Skip the immediate first tick
    ticker.tick().await;

    loop {
        tokio::select! {
            maybe_payload = outbound_rx.recv() => {
                match maybe_payload {
                    Some(payload) => {
                        let write = tokio::time::timeout(
                            WRITE_TIMEOUT,
                            ws_tx.send(Message::Text(payload)),
                        );
                        match write.await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!("websocket write error: {e}");
                                return;
                            }
                            Err(_) => {
                                debug!("websocket write timed out");
                                return;
                            }
                        }
                    }
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                let ping = tokio::time::timeout(
                    WRITE_TIMEOUT,
                    ws_tx.send(Message::Ping(Bytes::new())),
                );
                if !matches!(ping.await, Ok(Ok(()))) {
                    return;
                }
            }
        }
    }
}
