//! Client session: connection lifecycle, local CRDT mirrors, listeners,
//! function-call correlation, and offline replay.
//!
//! ```text
//! connect() ── auth ── rejoin rooms ── drain offline queue
//!     │
//!     ├── writer task  (mpsc → WebSocket)
//!     ├── reader task  (WebSocket → apply → listeners)
//!     └── ping task    (30 s keepalive)
//!
//! set_at() ── mirror.apply ── notify listeners ── send | enqueue
//! ```
//!
//! On a non-intentional close the client reconnects with exponential
//! backoff (`min(2^attempt × 1 s, 30 s)`, five attempts), then surfaces
//! failure. Listener panics are confined per listener; one misbehaving
//! subscriber never starves the rest.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::crdt::map::LwwMap;
use crate::crdt::{now_seconds, CrdtError, Operation};
use crate::protocol::{
    decode_server, encode_client, ClientMessage, ProtocolError, ServerMessage, User,
};
use crate::queue::OfflineQueue;
use crate::storage::StorageBackend;

/// Keepalive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Function-call response deadline (mirrors the broker default).
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Reconnect attempts before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Backoff ceiling.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Connection lifecycle states surfaced to connection listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; a fresh `connect()` is required.
    Failed,
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("room '{0}' has not been joined")]
    RoomNotJoined(String),
    #[error(transparent)]
    Crdt(#[from] CrdtError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("call failed: {0}")]
    Call(String),
    #[error("call timed out")]
    Timeout,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL, e.g. `ws://host:port/ws`.
    pub url: String,
    /// Bearer token sent as the first message (never in the URL).
    pub token: Option<String>,
    /// Descriptor attached to joins.
    pub user: Option<User>,
    /// Namespace for the offline queue's persistence key.
    pub queue_namespace: String,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            user: None,
            queue_namespace: "collabkit".to_string(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_queue_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.queue_namespace = namespace.into();
        self
    }
}

pub type StateListener = Arc<dyn Fn(&str, &Value) + Send + Sync>;
pub type OperationListener = Arc<dyn Fn(&str, &Operation) + Send + Sync>;
pub type PresenceListener = Arc<dyn Fn(&str, &str, &JsonMap<String, Value>) + Send + Sync>;
pub type ConnectionListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Per-room client state: refcounted registration, the local mirror,
/// members, and presence.
struct RoomSlot {
    refcount: usize,
    mirror: LwwMap,
    members: Vec<User>,
    presence: HashMap<String, JsonMap<String, Value>>,
}

impl RoomSlot {
    fn new(node_id: String) -> Self {
        Self {
            refcount: 0,
            mirror: LwwMap::new(node_id),
            members: Vec::new(),
            presence: HashMap::new(),
        }
    }
}

struct ClientShared {
    config: ClientConfig,
    node_id: String,
    state: RwLock<ConnectionState>,
    user_id: RwLock<Option<String>>,
    outgoing: RwLock<Option<mpsc::UnboundedSender<String>>>,
    rooms: RwLock<HashMap<String, RoomSlot>>,
    queue: Mutex<OfflineQueue>,
    pending_calls: Mutex<HashMap<String, oneshot::Sender<Result<Value, String>>>>,
    state_listeners: Mutex<Vec<StateListener>>,
    operation_listeners: Mutex<Vec<OperationListener>>,
    presence_listeners: Mutex<Vec<PresenceListener>>,
    connection_listeners: Mutex<Vec<ConnectionListener>>,
    screenshare_sinks: Mutex<HashMap<String, mpsc::UnboundedSender<ServerMessage>>>,
    reconnect_attempts: AtomicU32,
    intentional_close: AtomicBool,
    /// Bumped per (re)connect so stale ping tasks retire themselves.
    generation: AtomicU64,
}

/// The collaboration client.
pub struct CollabClient {
    shared: Arc<ClientShared>,
}

impl CollabClient {
    /// Client with an in-memory offline queue.
    pub fn new(config: ClientConfig) -> Self {
        let queue = OfflineQueue::in_memory(config.queue_namespace.clone());
        Self::build(config, queue)
    }

    /// Client with a durable offline queue (loaded and validated now).
    pub async fn with_storage(config: ClientConfig, storage: Arc<dyn StorageBackend>) -> Self {
        let queue = OfflineQueue::open(config.queue_namespace.clone(), storage).await;
        Self::build(config, queue)
    }

    fn build(config: ClientConfig, queue: OfflineQueue) -> Self {
        let node_id = config
            .user
            .as_ref()
            .map(|user| user.id.clone())
            .unwrap_or_else(|| format!("client-{}", Uuid::new_v4().simple()));
        Self {
            shared: Arc::new(ClientShared {
                config,
                node_id,
                state: RwLock::new(ConnectionState::Disconnected),
                user_id: RwLock::new(None),
                outgoing: RwLock::new(None),
                rooms: RwLock::new(HashMap::new()),
                queue: Mutex::new(queue),
                pending_calls: Mutex::new(HashMap::new()),
                state_listeners: Mutex::new(Vec::new()),
                operation_listeners: Mutex::new(Vec::new()),
                presence_listeners: Mutex::new(Vec::new()),
                connection_listeners: Mutex::new(Vec::new()),
                screenshare_sinks: Mutex::new(HashMap::new()),
                reconnect_attempts: AtomicU32::new(0),
                intentional_close: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub async fn user_id(&self) -> Option<String> {
        self.shared.user_id.read().await.clone()
    }

    pub async fn queued_operations(&self) -> usize {
        self.shared.queue.lock().await.size()
    }

    pub async fn on_state(&self, listener: StateListener) {
        self.shared.state_listeners.lock().await.push(listener);
    }

    pub async fn on_operation(&self, listener: OperationListener) {
        self.shared.operation_listeners.lock().await.push(listener);
    }

    pub async fn on_presence(&self, listener: PresenceListener) {
        self.shared.presence_listeners.lock().await.push(listener);
    }

    pub async fn on_connection(&self, listener: ConnectionListener) {
        self.shared.connection_listeners.lock().await.push(listener);
    }

    /// Screen-share and signaling traffic for one room, for feeding a
    /// coordinator.
    pub async fn screenshare_events(
        &self,
        room_id: &str,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .screenshare_sinks
            .lock()
            .await
            .insert(room_id.to_string(), tx);
        rx
    }

    /// Open the transport, authenticate, rejoin registered rooms, and
    /// drain the offline queue.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.shared.intentional_close.store(false, Ordering::SeqCst);
        self.shared.reconnect_attempts.store(0, Ordering::SeqCst);
        self.shared.clone().establish().await
    }

    /// Close the connection without triggering reconnect.
    pub async fn disconnect(&self) {
        self.shared.intentional_close.store(true, Ordering::SeqCst);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        *self.shared.outgoing.write().await = None;
        *self.shared.state.write().await = ConnectionState::Disconnected;
        self.shared.notify_connection(ConnectionState::Disconnected).await;
        self.shared.reject_pending("Disconnected").await;
    }

    /// Register interest in a room. Only the first join sends a wire
    /// `join`; later calls just bump the refcount.
    pub async fn join(&self, room_id: &str) -> Result<(), ClientError> {
        let first = {
            let mut rooms = self.shared.rooms.write().await;
            let slot = rooms
                .entry(room_id.to_string())
                .or_insert_with(|| RoomSlot::new(self.shared.node_id.clone()));
            slot.refcount += 1;
            slot.refcount == 1
        };
        if first && *self.shared.state.read().await == ConnectionState::Connected {
            self.shared
                .send(&ClientMessage::Join {
                    room_id: room_id.to_string(),
                    token: None,
                    user_info: self.shared.config.user.clone(),
                })
                .await?;
        }
        Ok(())
    }

    /// Drop one registration; the last leave sends the wire `leave` and
    /// forgets the local mirror.
    pub async fn leave(&self, room_id: &str) -> Result<(), ClientError> {
        let last = {
            let mut rooms = self.shared.rooms.write().await;
            match rooms.get_mut(room_id) {
                Some(slot) => {
                    slot.refcount = slot.refcount.saturating_sub(1);
                    if slot.refcount == 0 {
                        rooms.remove(room_id);
                        true
                    } else {
                        false
                    }
                }
                None => return Ok(()),
            }
        };
        if last {
            self.shared.screenshare_sinks.lock().await.remove(room_id);
            if *self.shared.state.read().await == ConnectionState::Connected {
                self.shared
                    .send(&ClientMessage::Leave {
                        room_id: room_id.to_string(),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Write a value: apply to the local mirror, notify state listeners
    /// synchronously, then forward to the broker or enqueue offline.
    pub async fn set_at(
        &self,
        room_id: &str,
        path: Vec<String>,
        value: Value,
    ) -> Result<Operation, ClientError> {
        let (op, state) = {
            let mut rooms = self.shared.rooms.write().await;
            let slot = rooms
                .get_mut(room_id)
                .ok_or_else(|| ClientError::RoomNotJoined(room_id.to_string()))?;
            let op = slot.mirror.set(path, value)?;
            (op, slot.mirror.value())
        };
        self.shared.notify_state(room_id, &state).await;
        self.shared.forward_or_enqueue(room_id, op.clone()).await;
        Ok(op)
    }

    /// Delete a path; symmetric with [`CollabClient::set_at`].
    pub async fn delete_at(&self, room_id: &str, path: Vec<String>) -> Result<Operation, ClientError> {
        let (op, state) = {
            let mut rooms = self.shared.rooms.write().await;
            let slot = rooms
                .get_mut(room_id)
                .ok_or_else(|| ClientError::RoomNotJoined(room_id.to_string()))?;
            let op = slot.mirror.delete(path)?;
            (op, slot.mirror.value())
        };
        self.shared.notify_state(room_id, &state).await;
        self.shared.forward_or_enqueue(room_id, op.clone()).await;
        Ok(op)
    }

    /// Read the value at a path in the local mirror.
    pub async fn get_at(&self, room_id: &str, path: &[String]) -> Option<Value> {
        self.shared
            .rooms
            .read()
            .await
            .get(room_id)
            .and_then(|slot| slot.mirror.get(path))
    }

    /// The room's full materialized state.
    pub async fn room_state(&self, room_id: &str) -> Option<Value> {
        self.shared
            .rooms
            .read()
            .await
            .get(room_id)
            .map(|slot| slot.mirror.value())
    }

    pub async fn members(&self, room_id: &str) -> Vec<User> {
        self.shared
            .rooms
            .read()
            .await
            .get(room_id)
            .map(|slot| slot.members.clone())
            .unwrap_or_default()
    }

    pub async fn presence_of(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Option<JsonMap<String, Value>> {
        self.shared
            .rooms
            .read()
            .await
            .get(room_id)
            .and_then(|slot| slot.presence.get(user_id).cloned())
    }

    /// Update own presence: store locally, notify, send when connected
    /// (silently dropped offline; presence is transient).
    pub async fn update_presence(
        &self,
        room_id: &str,
        data: JsonMap<String, Value>,
    ) -> Result<(), ClientError> {
        let own_id = self
            .shared
            .user_id
            .read()
            .await
            .clone()
            .unwrap_or_else(|| self.shared.node_id.clone());
        {
            let mut rooms = self.shared.rooms.write().await;
            let slot = rooms
                .get_mut(room_id)
                .ok_or_else(|| ClientError::RoomNotJoined(room_id.to_string()))?;
            let entry = slot.presence.entry(own_id.clone()).or_default();
            for (key, value) in &data {
                entry.insert(key.clone(), value.clone());
            }
        }
        self.shared.notify_presence(room_id, &own_id, &data).await;
        if *self.shared.state.read().await == ConnectionState::Connected {
            self.shared
                .send(&ClientMessage::Presence {
                    room_id: room_id.to_string(),
                    data,
                })
                .await?;
        }
        Ok(())
    }

    /// Invoke a server-registered function and await its correlated result.
    pub async fn call(
        &self,
        room_id: &str,
        function_name: &str,
        args: Vec<Value>,
    ) -> Result<Value, ClientError> {
        let call_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending_calls
            .lock()
            .await
            .insert(call_id.clone(), tx);

        let message = ClientMessage::Call {
            room_id: room_id.to_string(),
            call_id: call_id.clone(),
            function_name: function_name.to_string(),
            args,
            kwargs: JsonMap::new(),
        };
        if let Err(e) = self.shared.send(&message).await {
            self.shared.pending_calls.lock().await.remove(&call_id);
            return Err(e);
        }

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(ClientError::Call(message)),
            Ok(Err(_)) => Err(ClientError::Call("Connection closed.".to_string())),
            Err(_) => {
                self.shared.pending_calls.lock().await.remove(&call_id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Send a raw protocol message. Used to pump a screen-share
    /// coordinator's signaling output through the broker socket.
    pub async fn send_signal(&self, msg: ClientMessage) -> Result<(), ClientError> {
        self.shared.send(&msg).await
    }

    /// Send a ping now (the background task does this every 30 s).
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.shared
            .send(&ClientMessage::Ping {
                timestamp: Some(now_seconds()),
            })
            .await
    }
}

impl ClientShared {
    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
        self.notify_connection(state).await;
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        let frame = encode_client(msg)?;
        let outgoing = self.outgoing.read().await;
        match outgoing.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }

    /// Open the socket and start the writer, reader, and ping tasks.
    async fn establish(self: Arc<Self>) -> Result<(), ClientError> {
        self.set_state(ConnectionState::Connecting).await;
        let ws = match tokio_tungstenite::connect_async(&self.config.url).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected).await;
                return Err(ClientError::Transport(e.to_string()));
            }
        };
        let (mut ws_sender, mut ws_reader) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_sender.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        });
        *self.outgoing.write().await = Some(out_tx);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Auth is always the first frame; the token never rides the URL.
        if let Some(token) = self.config.token.clone() {
            self.send(&ClientMessage::Auth { token }).await?;
        }

        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected).await;

        // Rejoin every registered room.
        let room_ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        for room_id in room_ids {
            let join = ClientMessage::Join {
                room_id,
                token: None,
                user_info: self.config.user.clone(),
            };
            if let Err(e) = self.send(&join).await {
                log::warn!("failed to rejoin room: {e}");
            }
        }

        // Replay operations queued while offline, in enqueue order.
        let queued = self.queue.lock().await.drain_all().await;
        if !queued.is_empty() {
            log::info!("replaying {} queued operations", queued.len());
            for entry in queued {
                let message = ClientMessage::Operation {
                    room_id: entry.room_id.clone(),
                    operation: entry.operation.clone(),
                };
                if self.send(&message).await.is_err() {
                    // Connection already gone again; put it back.
                    self.queue
                        .lock()
                        .await
                        .enqueue(entry.room_id, entry.operation)
                        .await;
                }
            }
        }

        let ping_shared = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(PING_INTERVAL).await;
                if ping_shared.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                if *ping_shared.state.read().await != ConnectionState::Connected {
                    break;
                }
                let ping = ClientMessage::Ping {
                    timestamp: Some(now_seconds()),
                };
                if ping_shared.send(&ping).await.is_err() {
                    break;
                }
            }
        });

        let reader_shared = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(raw)) => match decode_server(&raw) {
                        Ok(msg) => reader_shared.handle_message(msg).await,
                        Err(e) => log::warn!("undecodable server message: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            reader_shared.handle_disconnect().await;
        });

        Ok(())
    }

    async fn handle_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Authenticated { user_id } => {
                *self.user_id.write().await = Some(user_id);
            }
            ServerMessage::Joined {
                room_id,
                user_id,
                users,
                state,
            } => {
                *self.user_id.write().await = Some(user_id);
                let value = {
                    let mut rooms = self.rooms.write().await;
                    let Some(slot) = rooms.get_mut(&room_id) else {
                        return;
                    };
                    match LwwMap::from_snapshot(self.node_id.clone(), state) {
                        // Local writes not yet acknowledged replay into the
                        // fresh mirror; apply is idempotent by op id.
                        Ok(mut fresh) => {
                            for op in slot.mirror.operations() {
                                if let Err(e) = fresh.apply(op) {
                                    log::warn!("dropping local operation on rejoin: {e}");
                                }
                            }
                            slot.mirror = fresh;
                        }
                        Err(e) => {
                            log::warn!("rejecting joined state for {room_id}: {e}");
                            return;
                        }
                    }
                    slot.members = users;
                    slot.mirror.value()
                };
                self.notify_state(&room_id, &value).await;
            }
            ServerMessage::Operation {
                room_id,
                user_id,
                operation,
            } => {
                // Our own operations come back with our user id; the local
                // mirror already applied them.
                let own = self.user_id.read().await.clone();
                if own.as_deref() == Some(user_id.as_str()) || operation.origin == self.node_id {
                    return;
                }
                let value = {
                    let mut rooms = self.rooms.write().await;
                    let Some(slot) = rooms.get_mut(&room_id) else {
                        return;
                    };
                    if let Err(e) = slot.mirror.apply(&operation) {
                        log::warn!("rejecting inbound operation for {room_id}: {e}");
                        return;
                    }
                    slot.mirror.value()
                };
                self.notify_state(&room_id, &value).await;
                self.notify_operation(&room_id, &operation).await;
            }
            ServerMessage::Sync {
                room_id,
                state,
                operations,
                ..
            } => {
                let value = {
                    let mut rooms = self.rooms.write().await;
                    let Some(slot) = rooms.get_mut(&room_id) else {
                        return;
                    };
                    match LwwMap::from_snapshot(self.node_id.clone(), state) {
                        Ok(mut fresh) => {
                            for op in slot.mirror.operations() {
                                if let Err(e) = fresh.apply(op) {
                                    log::warn!("dropping local operation on sync: {e}");
                                }
                            }
                            slot.mirror = fresh;
                        }
                        Err(e) => {
                            log::warn!("rejecting sync state for {room_id}: {e}");
                            return;
                        }
                    }
                    for op in &operations {
                        if let Err(e) = slot.mirror.apply(op) {
                            log::warn!("rejecting sync operation for {room_id}: {e}");
                        }
                    }
                    slot.mirror.value()
                };
                self.notify_state(&room_id, &value).await;
            }
            ServerMessage::CallResult {
                call_id,
                success,
                result,
                error,
            } => {
                let pending = self.pending_calls.lock().await.remove(&call_id);
                if let Some(tx) = pending {
                    let outcome = if success {
                        Ok(result.unwrap_or(Value::Null))
                    } else {
                        Err(error.unwrap_or_else(|| "Function call failed.".to_string()))
                    };
                    let _ = tx.send(outcome);
                }
            }
            ServerMessage::Presence {
                room_id,
                user_id,
                data,
            } => {
                {
                    let mut rooms = self.rooms.write().await;
                    let Some(slot) = rooms.get_mut(&room_id) else {
                        return;
                    };
                    let entry = slot.presence.entry(user_id.clone()).or_default();
                    for (key, value) in &data {
                        entry.insert(key.clone(), value.clone());
                    }
                }
                self.notify_presence(&room_id, &user_id, &data).await;
            }
            ServerMessage::UserJoined { room_id, user } => {
                {
                    let mut rooms = self.rooms.write().await;
                    if let Some(slot) = rooms.get_mut(&room_id) {
                        if !slot.members.iter().any(|member| member.id == user.id) {
                            slot.members.push(user.clone());
                        }
                    }
                }
                self.forward_screenshare(&room_id, ServerMessage::UserJoined { room_id: room_id.clone(), user })
                    .await;
            }
            ServerMessage::UserLeft { room_id, user_id } => {
                {
                    let mut rooms = self.rooms.write().await;
                    if let Some(slot) = rooms.get_mut(&room_id) {
                        slot.members.retain(|member| member.id != user_id);
                        slot.presence.remove(&user_id);
                    }
                }
                self.forward_screenshare(
                    &room_id,
                    ServerMessage::UserLeft {
                        room_id: room_id.clone(),
                        user_id,
                    },
                )
                .await;
            }
            ServerMessage::Error { code, message, room_id } => {
                log::warn!("broker error {code:?} (room {room_id:?}): {message}");
            }
            ServerMessage::Ping => {
                // Idle probe from the broker; any traffic satisfies it.
                let pong = ClientMessage::Ping {
                    timestamp: Some(now_seconds()),
                };
                let _ = self.send(&pong).await;
            }
            ServerMessage::Pong { .. } => {}
            other @ (ServerMessage::ScreenshareStarted { .. }
            | ServerMessage::ScreenshareStopped { .. }
            | ServerMessage::RtcOffer { .. }
            | ServerMessage::RtcAnswer { .. }
            | ServerMessage::RtcIceCandidate { .. }
            | ServerMessage::RemoteControlRequest { .. }
            | ServerMessage::RemoteControlResponse { .. }) => {
                let room_id = match &other {
                    ServerMessage::ScreenshareStarted { room_id, .. }
                    | ServerMessage::ScreenshareStopped { room_id, .. }
                    | ServerMessage::RtcOffer { room_id, .. }
                    | ServerMessage::RtcAnswer { room_id, .. }
                    | ServerMessage::RtcIceCandidate { room_id, .. }
                    | ServerMessage::RemoteControlRequest { room_id, .. }
                    | ServerMessage::RemoteControlResponse { room_id, .. } => room_id.clone(),
                    _ => return,
                };
                self.forward_screenshare(&room_id, other).await;
            }
        }
    }

    async fn forward_screenshare(&self, room_id: &str, msg: ServerMessage) {
        let mut sinks = self.screenshare_sinks.lock().await;
        if let Some(sink) = sinks.get(room_id) {
            if sink.send(msg).is_err() {
                sinks.remove(room_id);
            }
        }
    }

    async fn forward_or_enqueue(&self, room_id: &str, op: Operation) {
        let connected = *self.state.read().await == ConnectionState::Connected;
        if connected {
            let message = ClientMessage::Operation {
                room_id: room_id.to_string(),
                operation: op.clone(),
            };
            if self.send(&message).await.is_ok() {
                return;
            }
        }
        log::debug!("queueing offline operation for room {room_id}");
        self.queue.lock().await.enqueue(room_id, op).await;
    }

    async fn reject_pending(&self, reason: &str) {
        let pending: Vec<_> = self.pending_calls.lock().await.drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(reason.to_string()));
        }
    }

    async fn handle_disconnect(self: Arc<Self>) {
        *self.outgoing.write().await = None;
        self.set_state(ConnectionState::Disconnected).await;
        self.reject_pending("Disconnected").await;
        if self.intentional_close.load(Ordering::SeqCst) {
            return;
        }
        self.clone().spawn_reconnect();
    }

    fn spawn_reconnect(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    log::warn!("giving up after {MAX_RECONNECT_ATTEMPTS} reconnect attempts");
                    self.set_state(ConnectionState::Failed).await;
                    return;
                }
                self.set_state(ConnectionState::Reconnecting).await;
                tokio::time::sleep(reconnect_delay(attempt)).await;
                if self.intentional_close.load(Ordering::SeqCst) {
                    return;
                }
                match self.clone().establish().await {
                    Ok(()) => return,
                    Err(e) => log::debug!("reconnect attempt {attempt} failed: {e}"),
                }
            }
        });
    }

    async fn notify_state(&self, room_id: &str, value: &Value) {
        let listeners = self.state_listeners.lock().await.clone();
        for listener in listeners {
            let _ = catch_unwind(AssertUnwindSafe(|| listener(room_id, value)));
        }
    }

    async fn notify_operation(&self, room_id: &str, op: &Operation) {
        let listeners = self.operation_listeners.lock().await.clone();
        for listener in listeners {
            let _ = catch_unwind(AssertUnwindSafe(|| listener(room_id, op)));
        }
    }

    async fn notify_presence(&self, room_id: &str, user_id: &str, data: &JsonMap<String, Value>) {
        let listeners = self.presence_listeners.lock().await.clone();
        for listener in listeners {
            let _ = catch_unwind(AssertUnwindSafe(|| listener(room_id, user_id, data)));
        }
    }

    async fn notify_connection(&self, state: ConnectionState) {
        let listeners = self.connection_listeners.lock().await.clone();
        for listener in listeners {
            let _ = catch_unwind(AssertUnwindSafe(|| listener(state)));
        }
    }
}

/// `min(2^attempt × 1 s, 30 s)` with the first retry after one second.
fn reconnect_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(6);
    Duration::from_secs((1u64 << shift).min(MAX_RECONNECT_DELAY.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reconnect_delay_caps_at_thirty_seconds() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3), Duration::from_secs(4));
        assert_eq!(reconnect_delay(5), Duration::from_secs(16));
        assert_eq!(reconnect_delay(6), Duration::from_secs(30));
        assert_eq!(reconnect_delay(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = CollabClient::new(ClientConfig::new("ws://localhost:1"));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.user_id().await, None);
        assert_eq!(client.queued_operations().await, 0);
    }

    #[tokio::test]
    async fn test_node_id_follows_configured_user() {
        let config =
            ClientConfig::new("ws://localhost:1").with_user(User::new("alice", "Alice"));
        let client = CollabClient::new(config);
        assert_eq!(client.node_id(), "alice");
    }

    #[tokio::test]
    async fn test_set_requires_joined_room() {
        let client = CollabClient::new(ClientConfig::new("ws://localhost:1"));
        let result = client.set_at("nowhere", vec!["k".into()], json!(1)).await;
        assert!(matches!(result, Err(ClientError::RoomNotJoined(_))));
    }

    #[tokio::test]
    async fn test_offline_writes_queue_in_order() {
        let client = CollabClient::new(ClientConfig::new("ws://localhost:1"));
        client.join("room").await.unwrap();

        for i in 0..5 {
            client
                .set_at("room", vec![format!("k{i}")], json!(i))
                .await
                .unwrap();
        }
        assert_eq!(client.queued_operations().await, 5);

        // Local mirror reflects the writes immediately.
        assert_eq!(client.get_at("room", &["k0".to_string()]).await, Some(json!(0)));
        assert_eq!(
            client.room_state("room").await.unwrap(),
            json!({"k0": 0, "k1": 1, "k2": 2, "k3": 3, "k4": 4})
        );

        let queued = client.shared.queue.lock().await.peek_all();
        for (i, entry) in queued.iter().enumerate() {
            assert_eq!(entry.operation.path, vec![format!("k{i}")]);
        }
    }

    #[tokio::test]
    async fn test_delete_at_offline() {
        let client = CollabClient::new(ClientConfig::new("ws://localhost:1"));
        client.join("room").await.unwrap();
        client.set_at("room", vec!["k".into()], json!(1)).await.unwrap();
        client.delete_at("room", vec!["k".into()]).await.unwrap();
        assert_eq!(client.get_at("room", &["k".to_string()]).await, None);
        assert_eq!(client.queued_operations().await, 2);
    }

    #[tokio::test]
    async fn test_join_refcounting() {
        let client = CollabClient::new(ClientConfig::new("ws://localhost:1"));
        client.join("room").await.unwrap();
        client.join("room").await.unwrap();

        // First leave keeps the registration alive.
        client.leave("room").await.unwrap();
        assert!(client.room_state("room").await.is_some());

        // Last leave forgets the mirror.
        client.leave("room").await.unwrap();
        assert!(client.room_state("room").await.is_none());

        // Leaving an unknown room is a no-op.
        client.leave("room").await.unwrap();
    }

    #[tokio::test]
    async fn test_state_listener_fires_synchronously_and_panics_are_isolated() {
        use std::sync::atomic::AtomicUsize;

        let client = CollabClient::new(ClientConfig::new("ws://localhost:1"));
        client.join("room").await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let panicking_calls = calls.clone();
        client
            .on_state(Arc::new(move |_room, _state| {
                panicking_calls.fetch_add(1, Ordering::SeqCst);
                panic!("listener blew up");
            }))
            .await;
        let surviving_calls = calls.clone();
        client
            .on_state(Arc::new(move |_room, state| {
                surviving_calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(state, &json!({"k": 1}));
            }))
            .await;

        client.set_at("room", vec!["k".into()], json!(1)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_inbound_operation_applies_and_notifies() {
        use crate::crdt::OpKind;
        use std::sync::atomic::AtomicUsize;

        let client = CollabClient::new(ClientConfig::new("ws://localhost:1"));
        client.join("room").await.unwrap();

        let op_count = Arc::new(AtomicUsize::new(0));
        let counter = op_count.clone();
        client
            .on_operation(Arc::new(move |_room, _op| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let remote =
            Operation::make("remote-node", vec!["x".into()], OpKind::Set, Some(json!(9))).unwrap();
        client
            .shared
            .handle_message(ServerMessage::Operation {
                room_id: "room".into(),
                user_id: "remote-user".into(),
                operation: remote.clone(),
            })
            .await;

        assert_eq!(client.get_at("room", &["x".to_string()]).await, Some(json!(9)));
        assert_eq!(op_count.load(Ordering::SeqCst), 1);

        // Duplicate delivery is a no-op by id, but listeners still see it
        // only through the idempotent apply (no state change).
        client
            .shared
            .handle_message(ServerMessage::Operation {
                room_id: "room".into(),
                user_id: "remote-user".into(),
                operation: remote,
            })
            .await;
        assert_eq!(client.get_at("room", &["x".to_string()]).await, Some(json!(9)));
    }

    #[tokio::test]
    async fn test_own_operation_echo_is_skipped() {
        use crate::crdt::OpKind;

        let client = CollabClient::new(ClientConfig::new("ws://localhost:1"));
        client.join("room").await.unwrap();
        *client.shared.user_id.write().await = Some("me".to_string());

        let op = Operation::make("other-node", vec!["x".into()], OpKind::Set, Some(json!(1)))
            .unwrap();
        client
            .shared
            .handle_message(ServerMessage::Operation {
                room_id: "room".into(),
                user_id: "me".into(),
                operation: op,
            })
            .await;
        // Echo carried our user id: ignored entirely.
        assert_eq!(client.get_at("room", &["x".to_string()]).await, None);
    }

    #[tokio::test]
    async fn test_presence_broadcast_merges() {
        let client = CollabClient::new(ClientConfig::new("ws://localhost:1"));
        client.join("room").await.unwrap();

        let mut first = JsonMap::new();
        first.insert("status".into(), json!("typing"));
        first.insert("cursor".into(), json!({"x": 1}));
        client
            .shared
            .handle_message(ServerMessage::Presence {
                room_id: "room".into(),
                user_id: "bob".into(),
                data: first,
            })
            .await;

        let mut second = JsonMap::new();
        second.insert("cursor".into(), json!({"x": 5}));
        client
            .shared
            .handle_message(ServerMessage::Presence {
                room_id: "room".into(),
                user_id: "bob".into(),
                data: second,
            })
            .await;

        let presence = client.presence_of("room", "bob").await.unwrap();
        assert_eq!(presence.get("status"), Some(&json!("typing")));
        assert_eq!(presence.get("cursor"), Some(&json!({"x": 5})));
    }

    #[tokio::test]
    async fn test_member_tracking() {
        let client = CollabClient::new(ClientConfig::new("ws://localhost:1"));
        client.join("room").await.unwrap();

        client
            .shared
            .handle_message(ServerMessage::UserJoined {
                room_id: "room".into(),
                user: User::new("bob", "Bob"),
            })
            .await;
        assert_eq!(client.members("room").await.len(), 1);

        client
            .shared
            .handle_message(ServerMessage::UserLeft {
                room_id: "room".into(),
                user_id: "bob".into(),
            })
            .await;
        assert!(client.members("room").await.is_empty());
    }

    #[tokio::test]
    async fn test_call_result_correlation() {
        let client = CollabClient::new(ClientConfig::new("ws://localhost:1"));
        let (tx, rx) = oneshot::channel();
        client
            .shared
            .pending_calls
            .lock()
            .await
            .insert("call-1".into(), tx);

        client
            .shared
            .handle_message(ServerMessage::CallResult {
                call_id: "call-1".into(),
                success: true,
                result: Some(json!(42)),
                error: None,
            })
            .await;
        assert_eq!(rx.await.unwrap(), Ok(json!(42)));

        // Unknown call ids are ignored.
        client
            .shared
            .handle_message(ServerMessage::CallResult {
                call_id: "ghost".into(),
                success: true,
                result: None,
                error: None,
            })
            .await;
    }

    #[tokio::test]
    async fn test_call_without_connection_fails_fast() {
        let client = CollabClient::new(ClientConfig::new("ws://localhost:1"));
        let result = client.call("room", "fn_name", Vec::new()).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert!(client.shared.pending_calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_rejects_pending_calls() {
        let client = CollabClient::new(ClientConfig::new("ws://localhost:1"));
        let (tx, rx) = oneshot::channel();
        client
            .shared
            .pending_calls
            .lock()
            .await
            .insert("call-1".into(), tx);

        client.disconnect().await;
        assert_eq!(rx.await.unwrap(), Err("Disconnected".to_string()));
    }
}
