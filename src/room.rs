//! Rooms: the authoritative owner of shared state.
//!
//! A room holds its CRDT exclusively; sessions route messages into it and
//! hold back-references only. Each connected member registers an outbound
//! frame sender so the room can fan out broadcasts and relay targeted
//! messages without touching sockets.
//!
//! ```text
//! Session A ──┐                    ┌── outbound tx ──► Session A
//!             ├─► Room ── LwwMap   ├── outbound tx ──► Session B
//! Session B ──┘        presence    └── outbound tx ──► Session C
//!                      functions
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map as JsonMap, Value};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::crdt::map::{LwwMap, MapSnapshot};
use crate::crdt::{now_seconds, CrdtError, Operation, VersionVector};
use crate::permissions::Action;
use crate::presence::RoomPresence;
use crate::protocol::{encode_server, ServerMessage, User};

/// Pre-encoded frames flow through these senders, one per member.
pub type Outbound = mpsc::UnboundedSender<String>;

/// Errors surfaced by registered function calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FunctionError {
    #[error("Function '{0}' not found.")]
    NotFound(String),
    #[error("Authentication required.")]
    AuthRequired,
    #[error("Permission denied.")]
    PermissionDenied,
    #[error("Function execution timeout.")]
    Timeout,
    #[error("Function execution failed: {0}")]
    Failed(String),
}

pub type FunctionResult = Result<Value, FunctionError>;
pub type FunctionFuture = Pin<Box<dyn Future<Output = FunctionResult> + Send>>;
pub type FunctionHandler = Arc<dyn Fn(FunctionCall) -> FunctionFuture + Send + Sync>;

/// Everything a registered function receives when invoked.
pub struct FunctionCall {
    pub room: Arc<Room>,
    pub caller: Option<User>,
    pub args: Vec<Value>,
    pub kwargs: JsonMap<String, Value>,
}

/// A server function clients may invoke by name.
#[derive(Clone)]
pub struct RegisteredFunction {
    pub name: String,
    pub requires_auth: bool,
    pub required_permissions: Vec<Action>,
    handler: FunctionHandler,
}

impl RegisteredFunction {
    pub fn new(
        name: impl Into<String>,
        handler: FunctionHandler,
        requires_auth: bool,
        required_permissions: Vec<Action>,
    ) -> Self {
        Self {
            name: name.into(),
            requires_auth,
            required_permissions,
            handler,
        }
    }
}

/// A collaborative room: CRDT state, membership, presence, functions.
pub struct Room {
    id: String,
    node_id: String,
    created_at: f64,
    state: RwLock<LwwMap>,
    connections: RwLock<HashMap<String, (User, Outbound)>>,
    presence: RwLock<RoomPresence>,
    functions: RwLock<HashMap<String, RegisteredFunction>>,
    updated_at: RwLock<f64>,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let node_id = format!("server-{id}");
        Self {
            state: RwLock::new(LwwMap::new(node_id.clone())),
            connections: RwLock::new(HashMap::new()),
            presence: RwLock::new(RoomPresence::new()),
            functions: RwLock::new(HashMap::new()),
            created_at: now_seconds(),
            updated_at: RwLock::new(now_seconds()),
            node_id,
            id,
        }
    }

    /// Restore a room from a persisted snapshot.
    pub fn from_snapshot(id: impl Into<String>, snapshot: MapSnapshot) -> Result<Self, CrdtError> {
        let id = id.into();
        let node_id = format!("server-{id}");
        let restored = LwwMap::from_snapshot(node_id.clone(), snapshot)?;
        Ok(Self {
            state: RwLock::new(restored),
            connections: RwLock::new(HashMap::new()),
            presence: RwLock::new(RoomPresence::new()),
            functions: RwLock::new(HashMap::new()),
            created_at: now_seconds(),
            updated_at: RwLock::new(now_seconds()),
            node_id,
            id,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    pub async fn updated_at(&self) -> f64 {
        *self.updated_at.read().await
    }

    /// Current materialized state.
    pub async fn value(&self) -> Value {
        self.state.read().await.value()
    }

    /// Full CRDT snapshot for the wire.
    pub async fn snapshot(&self) -> MapSnapshot {
        self.state.read().await.snapshot()
    }

    pub async fn operations_since(&self, timestamp: f64) -> Vec<Operation> {
        self.state.read().await.operations_since(timestamp)
    }

    pub async fn version_vector(&self) -> VersionVector {
        self.state.read().await.version_vector().clone()
    }

    /// Validate and apply an operation, optionally substituting the broker
    /// clock for the emitter's. Returns the canonical operation for
    /// rebroadcast and whether it changed state (`false` = duplicate id).
    pub async fn apply_operation(
        &self,
        op: &Operation,
        use_server_timestamp: bool,
    ) -> Result<(Operation, bool), CrdtError> {
        let canonical = if use_server_timestamp {
            op.with_timestamp(now_seconds())
        } else {
            op.clone()
        };
        let applied = self.state.write().await.apply(&canonical)?;
        *self.updated_at.write().await = now_seconds();
        Ok((canonical, applied))
    }

    /// Add a member, replacing any previous connection with the same user
    /// id. Returns the state snapshot and the member list.
    pub async fn join(&self, user: User, outbound: Outbound) -> (MapSnapshot, Vec<User>) {
        self.connections
            .write()
            .await
            .insert(user.id.clone(), (user.clone(), outbound));
        self.presence.write().await.add_user(user);
        (self.snapshot().await, self.users().await)
    }

    /// Remove a member and its presence entry.
    pub async fn leave(&self, user_id: &str) -> Option<User> {
        let removed = self
            .connections
            .write()
            .await
            .remove(user_id)
            .map(|(user, _)| user);
        self.presence.write().await.remove_user(user_id);
        removed
    }

    pub async fn users(&self) -> Vec<User> {
        self.connections
            .read()
            .await
            .values()
            .map(|(user, _)| user.clone())
            .collect()
    }

    pub async fn has_user(&self, user_id: &str) -> bool {
        self.connections.read().await.contains_key(user_id)
    }

    pub async fn user_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Shallow-merge presence data for a member.
    pub async fn update_presence(&self, user_id: &str, data: &JsonMap<String, Value>) -> bool {
        *self.updated_at.write().await = now_seconds();
        self.presence.write().await.update(user_id, data)
    }

    pub async fn presence_data(&self, user_id: &str) -> Option<JsonMap<String, Value>> {
        self.presence
            .read()
            .await
            .get(user_id)
            .map(|entry| entry.data.clone())
    }

    pub async fn register_function(&self, function: RegisteredFunction) {
        self.functions
            .write()
            .await
            .insert(function.name.clone(), function);
    }

    pub async fn function(&self, name: &str) -> Option<RegisteredFunction> {
        self.functions.read().await.get(name).cloned()
    }

    pub async fn has_function(&self, name: &str) -> bool {
        self.functions.read().await.contains_key(name)
    }

    /// Invoke a registered function under a hard timeout. The room enforces
    /// `requires_auth`; permission checks live with the session dispatcher,
    /// which owns the permission manager.
    pub async fn call(
        self: Arc<Self>,
        name: &str,
        caller: Option<User>,
        authenticated: bool,
        args: Vec<Value>,
        kwargs: JsonMap<String, Value>,
        timeout: Duration,
    ) -> FunctionResult {
        let function = self
            .function(name)
            .await
            .ok_or_else(|| FunctionError::NotFound(name.to_string()))?;
        if function.requires_auth && !authenticated {
            return Err(FunctionError::AuthRequired);
        }
        let call = FunctionCall {
            room: self,
            caller,
            args,
            kwargs,
        };
        let future = (function.handler)(call);
        match tokio::time::timeout(timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(FunctionError::Timeout),
        }
    }

    /// Fan a message out to every member except `exclude_user`. Dead
    /// senders are dropped from the room. Returns the delivery count.
    pub async fn broadcast(&self, msg: &ServerMessage, exclude_user: Option<&str>) -> usize {
        let frame = match encode_server(msg) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("room {}: failed to encode broadcast: {e}", self.id);
                return 0;
            }
        };
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let connections = self.connections.read().await;
            for (user_id, (_, outbound)) in connections.iter() {
                if Some(user_id.as_str()) == exclude_user {
                    continue;
                }
                if outbound.send(frame.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(user_id.clone());
                }
            }
        }
        for user_id in dead {
            log::debug!("room {}: dropping dead connection for {user_id}", self.id);
            self.leave(&user_id).await;
        }
        delivered
    }

    /// Send a message to a single member. Returns `false` when the member
    /// is absent or its connection is gone.
    pub async fn send_to(&self, user_id: &str, msg: &ServerMessage) -> bool {
        let frame = match encode_server(msg) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("room {}: failed to encode message: {e}", self.id);
                return false;
            }
        };
        let connections = self.connections.read().await;
        match connections.get(user_id) {
            Some((_, outbound)) => outbound.send(frame).is_ok(),
            None => false,
        }
    }
}

/// Creates rooms, tracks them by id, and owns the global function registry.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    global_functions: RwLock<HashMap<String, RegisteredFunction>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            global_functions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create_room(&self, room_id: &str) -> Arc<Room> {
        let globals: Vec<RegisteredFunction> = self
            .global_functions
            .read()
            .await
            .values()
            .cloned()
            .collect();
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }
        let room = Arc::new(Room::new(room_id));
        for function in globals {
            room.register_function(function).await;
        }
        rooms.insert(room_id.to_string(), room.clone());
        log::info!("room {room_id} created");
        room
    }

    /// Create a room seeded from a persisted snapshot. Falls back to an
    /// empty room if one with the same id already exists.
    pub async fn create_room_from_snapshot(
        &self,
        room_id: &str,
        snapshot: MapSnapshot,
    ) -> Result<Arc<Room>, CrdtError> {
        let restored = LwwMap::from_snapshot(format!("server-{room_id}"), snapshot)?;
        let room = self.create_room(room_id).await;
        *room.state.write().await = restored;
        Ok(room)
    }

    pub async fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn has_room(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn delete_room(&self, room_id: &str) -> bool {
        self.rooms.write().await.remove(room_id).is_some()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Register a function in every room, current and future.
    pub async fn register_function(&self, function: RegisteredFunction) {
        self.global_functions
            .write()
            .await
            .insert(function.name.clone(), function.clone());
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            room.register_function(function.clone()).await;
        }
    }

    /// Drop rooms with no connected members; returns how many were removed.
    pub async fn cleanup_empty_rooms(&self) -> usize {
        let mut rooms = self.rooms.write().await;
        let mut empty = Vec::new();
        for (id, room) in rooms.iter() {
            if room.connections.read().await.is_empty() {
                empty.push(id.clone());
            }
        }
        for id in &empty {
            rooms.remove(id);
            log::info!("room {id} removed (empty)");
        }
        empty.len()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}
