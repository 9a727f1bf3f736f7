use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_db::Database;
use courier_services::message::MessageService;
use courier_services::presence::PresenceService;
use courier_types::frames::ServerFrame;
use courier_types::models::ActiveConnection;

/// Bounded per-session outbound buffer. A session that falls this far
/// behind is evicted rather than allowed to back-pressure the coordinator.
pub(crate) const OUTBOUND_BUFFER: usize = 256;

/// Broadcast channel depth between hot-path callers and the coordinator.
const BROADCAST_BUFFER: usize = 256;

/// How many queued messages a reconnecting session is handed at most.
const DRAIN_BATCH: i64 = 100;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server_id: String,
    pub heartbeat_interval: Duration,
    pub connection_timeout: Duration,
}

/// One live socket bound to one authenticated user. The manager owns the
/// registry entry; the session owns its outbound buffer sender.
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    outbound: StdMutex<Option<mpsc::Sender<Utf8Bytes>>>,
    last_heartbeat: StdMutex<DateTime<Utc>>,
}

pub(crate) enum Enqueue {
    Sent,
    Full,
    Closed,
}

impl Session {
    /// Fresh session plus the receiving half of its outbound buffer, which
    /// the write pump consumes.
    pub fn new(user_id: Uuid) -> (Arc<Self>, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            outbound: StdMutex::new(Some(tx)),
            last_heartbeat: StdMutex::new(Utc::now()),
        });
        (session, rx)
    }

    /// Non-blocking enqueue. A full buffer is the caller's signal to evict.
    pub(crate) fn try_enqueue(&self, payload: Utf8Bytes) -> Enqueue {
        let guard = self.outbound.lock().expect("session lock poisoned");
        match guard.as_ref() {
            Some(tx) => match tx.try_send(payload) {
                Ok(()) => Enqueue::Sent,
                Err(mpsc::error::TrySendError::Full(_)) => Enqueue::Full,
                Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Closed,
            },
            None => Enqueue::Closed,
        }
    }

    /// Drop the sender. The write pump sees the closed buffer, emits a
    /// close frame and terminates.
    pub(crate) fn close_outbound(&self) {
        self.outbound.lock().expect("session lock poisoned").take();
    }

    pub(crate) fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock().expect("session lock poisoned") = Utc::now();
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        *self.last_heartbeat.lock().expect("session lock poisoned")
    }
}

struct Broadcast {
    user_id: Uuid,
    frame: ServerFrame,
}

struct ManagerInner {
    /// connection id -> session. Mutated only by the coordinator task;
    /// std locks are fine because no critical section spans an await.
    connections: RwLock<HashMap<Uuid, Arc<Session>>>,
    /// user id -> connection ids in registration order.
    user_sessions: RwLock<HashMap<Uuid, Vec<Uuid>>>,
    register_tx: mpsc::Sender<Arc<Session>>,
    unregister_tx: mpsc::Sender<Arc<Session>>,
    broadcast_tx: mpsc::Sender<Broadcast>,
    db: Arc<Database>,
    messages: MessageService,
    presence: PresenceService,
    config: GatewayConfig,
}

/// Session registry and fan-out coordinator.
///
/// A single task owns every structural mutation: register, unregister and
/// broadcast requests are funneled through channels and handled one at a
/// time, so observers see a consistent sequence.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Build the manager and spawn its coordinator task. Must be called
    /// from within a tokio runtime.
    pub fn new(
        db: Arc<Database>,
        messages: MessageService,
        presence: PresenceService,
        config: GatewayConfig,
    ) -> Self {
        let (register_tx, register_rx) = mpsc::channel(1);
        let (unregister_tx, unregister_rx) = mpsc::channel(1);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_BUFFER);

        let inner = Arc::new(ManagerInner {
            connections: RwLock::new(HashMap::new()),
            user_sessions: RwLock::new(HashMap::new()),
            register_tx,
            unregister_tx,
            broadcast_tx,
            db,
            messages,
            presence,
            config,
        });

        tokio::spawn(run_coordinator(
            inner.clone(),
            register_rx,
            unregister_rx,
            broadcast_rx,
        ));

        Self { inner }
    }

    pub async fn register(&self, session: Arc<Session>) {
        let _ = self.inner.register_tx.send(session).await;
    }

    pub async fn unregister(&self, session: Arc<Session>) {
        let _ = self.inner.unregister_tx.send(session).await;
    }

    /// Hand a frame to the coordinator for fan-out to every live session of
    /// `user_id`. Returns once the frame is enqueued; delivery is not
    /// awaited.
    pub async fn send_to_user(&self, user_id: Uuid, frame: ServerFrame) {
        let _ = self
            .inner
            .broadcast_tx
            .send(Broadcast { user_id, frame })
            .await;
    }

    /// Whether the user has at least one live session right now.
    pub fn is_user_connected(&self, user_id: Uuid) -> bool {
        self.inner
            .user_sessions
            .read()
            .expect("registry lock poisoned")
            .contains_key(&user_id)
    }

    pub fn session_count(&self, user_id: Uuid) -> usize {
        self.inner
            .user_sessions
            .read()
            .expect("registry lock poisoned")
            .get(&user_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Close every session's outbound buffer. Write pumps emit a close
    /// frame and terminate, read pumps observe the closing transport, and
    /// the resulting unregisters drain through the coordinator.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .connections
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();

        info!("shutting down {} live sessions", sessions.len());
        for session in sessions {
            session.close_outbound();
        }
    }

    pub(crate) fn store(&self) -> &Database {
        &self.inner.db
    }

    pub(crate) fn messages(&self) -> &MessageService {
        &self.inner.messages
    }

    pub(crate) fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }
}

async fn run_coordinator(
    inner: Arc<ManagerInner>,
    mut register_rx: mpsc::Receiver<Arc<Session>>,
    mut unregister_rx: mpsc::Receiver<Arc<Session>>,
    mut broadcast_rx: mpsc::Receiver<Broadcast>,
) {
    loop {
        tokio::select! {
            Some(session) = register_rx.recv() => register_client(&inner, session),
            Some(session) = unregister_rx.recv() => unregister_client(&inner, session),
            Some(broadcast) = broadcast_rx.recv() => broadcast_to_user(&inner, broadcast),
            else => break,
        }
    }
}

fn register_client(inner: &Arc<ManagerInner>, session: Arc<Session>) {
    inner
        .connections
        .write()
        .expect("registry lock poisoned")
        .insert(session.id, session.clone());
    inner
        .user_sessions
        .write()
        .expect("registry lock poisoned")
        .entry(session.user_id)
        .or_default()
        .push(session.id);

    let now = Utc::now();
    let record = ActiveConnection {
        connection_id: session.id,
        user_id: session.user_id,
        device_id: None,
        device_type: "web".into(),
        connected_at: now,
        last_heartbeat: now,
        server_instance: inner.config.server_id.clone(),
        expires_at: now
            + chrono::Duration::from_std(inner.config.connection_timeout).unwrap_or_default(),
    };
    if let Err(e) = inner.db.insert_active_connection(&record) {
        warn!(connection_id = %session.id, "failed to persist active connection: {e}");
    }

    if let Err(e) = inner.presence.set_online(session.user_id, session.id) {
        warn!(user_id = %session.user_id, "failed to set presence online: {e}");
    }

    info!(connection_id = %session.id, user_id = %session.user_id, "client registered");

    // Hand any queued messages to the fresh session off the coordinator.
    let drain_inner = inner.clone();
    tokio::spawn(async move {
        drain_offline_queue(drain_inner, session);
    });
}

fn unregister_client(inner: &Arc<ManagerInner>, session: Arc<Session>) {
    // Eviction and pump teardown can both request an unregister for the
    // same session; the second request finds nothing to do.
    if inner
        .connections
        .write()
        .expect("registry lock poisoned")
        .remove(&session.id)
        .is_none()
    {
        return;
    }

    let last_session_out = {
        let mut user_sessions = inner.user_sessions.write().expect("registry lock poisoned");
        match user_sessions.get_mut(&session.user_id) {
            Some(ids) => {
                ids.retain(|id| *id != session.id);
                if ids.is_empty() {
                    user_sessions.remove(&session.user_id);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    };

    if last_session_out {
        if let Err(e) = inner.presence.set_offline(session.user_id) {
            warn!(user_id = %session.user_id, "failed to set presence offline: {e}");
        }
    }

    if let Err(e) = inner.db.delete_active_connection(session.id) {
        warn!(connection_id = %session.id, "failed to delete active connection: {e}");
    }

    session.close_outbound();
    info!(connection_id = %session.id, user_id = %session.user_id, "client unregistered");
}

fn broadcast_to_user(inner: &Arc<ManagerInner>, broadcast: Broadcast) {
    let Some(payload) = encode(&broadcast.frame) else {
        return;
    };

    let connection_ids = {
        let user_sessions = inner.user_sessions.read().expect("registry lock poisoned");
        match user_sessions.get(&broadcast.user_id) {
            Some(ids) => ids.clone(),
            None => return,
        }
    };

    for connection_id in connection_ids {
        let session = {
            let connections = inner.connections.read().expect("registry lock poisoned");
            connections.get(&connection_id).cloned()
        };
        let Some(session) = session else { continue };

        match session.try_enqueue(payload.clone()) {
            Enqueue::Sent => {}
            Enqueue::Closed => {}
            Enqueue::Full => {
                // A slow consumer must not stall everyone else: schedule the
                // eviction and move on. The inflight payload is dropped.
                warn!(
                    connection_id = %session.id,
                    user_id = %session.user_id,
                    "outbound buffer full, evicting session"
                );
                let unregister_tx = inner.unregister_tx.clone();
                tokio::spawn(async move {
                    let _ = unregister_tx.send(session).await;
                });
            }
        }
    }
}

/// Flush the user's offline queue into a newly registered session. The
/// queue rows are already deleted by the drain read; a frame that does not
/// fit the buffer is lost and logged.
fn drain_offline_queue(inner: Arc<ManagerInner>, session: Arc<Session>) {
    let messages = match inner.messages.get_queued_messages(session.user_id, DRAIN_BATCH) {
        Ok(messages) => messages,
        Err(e) => {
            warn!(user_id = %session.user_id, "failed to read offline queue: {e}");
            return;
        }
    };
    if messages.is_empty() {
        return;
    }

    let total = messages.len();
    let mut delivered = 0usize;
    for message in messages {
        let frame = ServerFrame::QueuedMessage { message };
        let Some(payload) = encode(&frame) else { continue };
        match session.try_enqueue(payload) {
            Enqueue::Sent => delivered += 1,
            Enqueue::Full | Enqueue::Closed => {
                warn!(
                    connection_id = %session.id,
                    user_id = %session.user_id,
                    "dropping queued message, session buffer unavailable"
                );
            }
        }
    }

    debug!(
        user_id = %session.user_id,
        delivered, total,
        "offline queue drained"
    );
}

pub(crate) fn encode(frame: &ServerFrame) -> Option<Utf8Bytes> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(json.into()),
        Err(e) => {
            warn!("failed to serialize outbound frame: {e}");
            None
        }
    }
}
