//! WebSocket broker: per-connection session state machine and dispatch.
//!
//! ```text
//! Client A ──┐                     ┌── Room "design" ── LwwMap
//!            ├── accept loop ──────┤
//! Client B ──┘   (one task per     └── Room "chat"   ── LwwMap
//!                 connection)              │
//!                                          ├── StorageBackend (snapshots)
//!                                          └── fan-out via per-member tx
//! ```
//!
//! Each connection walks `Accepted → Authenticated → Joined{rooms} →
//! Closed`. Ingress is bounded (1 MiB), decoded, validated, rate-limited
//! (auth and ICE exempt), then dispatched. The broker validates, applies,
//! and rebroadcasts; it never merges authoritatively beyond the CRDT's own
//! resolution.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::AuthProvider;
use crate::crdt::map::MapSnapshot;
use crate::crdt::{now_seconds, Operation};
use crate::limiter::{AuthGuard, RateLimiter, DEFAULT_RATE_LIMIT};
use crate::permissions::{Action, PermissionManager};
use crate::protocol::{
    decode_client, encode_server, ClientMessage, ErrorCode, ServerMessage, User,
};
use crate::room::{Room, RoomManager};
use crate::storage::StorageBackend;
use crate::validate::MAX_MESSAGE_SIZE;

/// Validation or rate violations tolerated before the connection is closed.
const MAX_VIOLATIONS: u32 = 10;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// WebSocket endpoint path.
    pub path: String,
    /// Reject unauthenticated joins.
    pub require_auth: bool,
    /// Mint anonymous principals for token-less joins.
    pub allow_anonymous: bool,
    /// Create rooms on first join.
    pub auto_create_rooms: bool,
    /// Persist the room snapshot after every applied operation.
    pub save_on_operation: bool,
    /// Per-connection message rate (messages per second).
    pub rate_limit: f64,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Idle window before the broker probes with a ping.
    pub message_timeout: Duration,
    /// Hard cap on registered function execution.
    pub function_timeout: Duration,
    /// Concurrent connections allowed per user id.
    pub max_connections_per_user: usize,
    /// Substitute the broker clock for client timestamps on ingress.
    pub use_server_timestamp: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
            path: "/ws".to_string(),
            require_auth: false,
            allow_anonymous: false,
            auto_create_rooms: true,
            save_on_operation: false,
            rate_limit: DEFAULT_RATE_LIMIT,
            max_message_size: MAX_MESSAGE_SIZE,
            message_timeout: Duration::from_secs(60),
            function_timeout: Duration::from_secs(30),
            max_connections_per_user: 10,
            use_server_timestamp: false,
        }
    }
}

/// Broker statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// Broker errors (accept-loop level; per-connection faults are logged).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Per-connection mutable state.
struct Session {
    user: Option<User>,
    authenticated: bool,
    rooms: HashSet<String>,
    limiter: RateLimiter,
    violations: u32,
}

impl Session {
    fn new(rate_limit: f64) -> Self {
        Self {
            user: None,
            authenticated: false,
            rooms: HashSet::new(),
            limiter: RateLimiter::new(rate_limit),
            violations: 0,
        }
    }
}

type Outbound = mpsc::UnboundedSender<String>;

fn send_message(tx: &Outbound, msg: &ServerMessage) {
    match encode_server(msg) {
        Ok(frame) => {
            let _ = tx.send(frame);
        }
        Err(e) => log::warn!("failed to encode outbound message: {e}"),
    }
}

fn send_error(tx: &Outbound, code: ErrorCode, message: &str, room_id: Option<&str>) {
    send_message(
        tx,
        &ServerMessage::Error {
            code,
            message: message.to_string(),
            room_id: room_id.map(str::to_string),
        },
    );
}

struct ServerShared {
    config: ServerConfig,
    rooms: RoomManager,
    auth: Option<Arc<dyn AuthProvider>>,
    permissions: Option<Arc<dyn PermissionManager>>,
    storage: Option<Arc<dyn StorageBackend>>,
    auth_guard: Mutex<AuthGuard>,
    user_connections: RwLock<HashMap<String, usize>>,
    screen_sharers: RwLock<HashMap<String, String>>,
    stats: RwLock<ServerStats>,
}

/// The broker.
pub struct CollabServer {
    shared: Arc<ServerShared>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_providers(config, None, None, None)
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn with_providers(
        config: ServerConfig,
        auth: Option<Arc<dyn AuthProvider>>,
        permissions: Option<Arc<dyn PermissionManager>>,
        storage: Option<Arc<dyn StorageBackend>>,
    ) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                rooms: RoomManager::new(),
                auth,
                permissions,
                storage,
                auth_guard: Mutex::new(AuthGuard::new()),
                user_connections: RwLock::new(HashMap::new()),
                screen_sharers: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.shared.rooms
    }

    /// Register a function available in every room.
    pub async fn register_function(&self, function: crate::room::RegisteredFunction) {
        self.shared.rooms.register_function(function).await;
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_rooms = self.shared.rooms.room_count().await;
        stats
    }

    /// Accept connections forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("broker listening on {}", self.shared.config.bind_addr);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("tcp connection from {addr}");
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(shared, stream, addr).await {
                    log::debug!("connection from {addr} ended: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), ServerError> {
    let expected_path = shared.config.path.clone();
    let callback = move |request: &Request, response: Response| {
        if request.uri().path() == expected_path {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("not found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let (mut ws_sender, mut ws_receiver) = ws.split();
    log::info!("websocket connection established from {addr}");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    {
        let mut stats = shared.stats.write().await;
        stats.total_connections += 1;
        stats.active_connections += 1;
    }

    let mut session = Session::new(shared.config.rate_limit);

    loop {
        let frame = match tokio::time::timeout(shared.config.message_timeout, ws_receiver.next())
            .await
        {
            Err(_) => {
                // Idle: probe rather than disconnect.
                send_message(&out_tx, &ServerMessage::Ping);
                continue;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                log::debug!("websocket error from {addr}: {e}");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let raw = match frame {
            Message::Text(raw) => raw,
            Message::Close(_) => break,
            // Control frames are answered by the protocol layer.
            _ => continue,
        };

        {
            let mut stats = shared.stats.write().await;
            stats.total_messages += 1;
            stats.total_bytes += raw.len() as u64;
        }

        if raw.len() > shared.config.max_message_size {
            send_error(&out_tx, ErrorCode::InvalidMessage, "Message too large.", None);
            session.violations += 1;
            if session.violations >= MAX_VIOLATIONS {
                break;
            }
            continue;
        }

        let msg = match decode_client(&raw) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("invalid message from {addr}: {e}");
                send_error(&out_tx, ErrorCode::InvalidMessage, "Invalid message format.", None);
                session.violations += 1;
                if session.violations >= MAX_VIOLATIONS {
                    break;
                }
                continue;
            }
        };

        let rate_exempt = matches!(
            msg,
            ClientMessage::Auth { .. } | ClientMessage::RtcIceCandidate { .. }
        );
        if !rate_exempt && !session.limiter.can_send() {
            send_error(&out_tx, ErrorCode::RateLimited, "Rate limit exceeded.", None);
            session.violations += 1;
            if session.violations >= MAX_VIOLATIONS {
                break;
            }
            continue;
        }

        shared.dispatch(&out_tx, addr, &mut session, msg).await;
    }

    shared.cleanup_connection(&session).await;
    writer.abort();
    log::info!("connection from {addr} closed");
    Ok(())
}

impl ServerShared {
    async fn dispatch(
        &self,
        tx: &Outbound,
        addr: SocketAddr,
        session: &mut Session,
        msg: ClientMessage,
    ) {
        match msg {
            ClientMessage::Auth { token } => self.handle_auth(tx, addr, session, &token).await,
            ClientMessage::Join {
                room_id,
                token,
                user_info,
            } => {
                self.handle_join(tx, addr, session, room_id, token, user_info)
                    .await
            }
            ClientMessage::Leave { room_id } => self.handle_leave(session, &room_id).await,
            ClientMessage::Operation { room_id, operation } => {
                self.handle_operation(tx, session, room_id, operation).await
            }
            ClientMessage::SyncRequest {
                room_id,
                since_timestamp,
                ..
            } => {
                self.handle_sync_request(tx, session, room_id, since_timestamp)
                    .await
            }
            ClientMessage::Call {
                room_id,
                call_id,
                function_name,
                args,
                kwargs,
            } => {
                self.handle_call(tx, session, room_id, call_id, function_name, args, kwargs)
                    .await
            }
            ClientMessage::Presence { room_id, data } => {
                self.handle_presence(tx, session, room_id, data).await
            }
            ClientMessage::Ping { .. } => {
                send_message(
                    tx,
                    &ServerMessage::Pong {
                        timestamp: now_seconds(),
                    },
                );
            }
            ClientMessage::ScreenshareStart {
                room_id,
                share_name,
            } => {
                self.handle_screenshare_start(tx, session, room_id, share_name)
                    .await
            }
            ClientMessage::ScreenshareStop { room_id } => {
                self.handle_screenshare_stop(session, &room_id).await
            }
            ClientMessage::RtcOffer {
                room_id,
                target_user_id,
                sdp,
            } => {
                if let Some(user) = session.user.clone() {
                    self.relay(
                        &room_id,
                        &target_user_id,
                        ServerMessage::RtcOffer {
                            room_id: room_id.clone(),
                            from_user_id: user.id,
                            sdp,
                        },
                    )
                    .await;
                }
            }
            ClientMessage::RtcAnswer {
                room_id,
                target_user_id,
                sdp,
            } => {
                if let Some(user) = session.user.clone() {
                    self.relay(
                        &room_id,
                        &target_user_id,
                        ServerMessage::RtcAnswer {
                            room_id: room_id.clone(),
                            from_user_id: user.id,
                            sdp,
                        },
                    )
                    .await;
                }
            }
            ClientMessage::RtcIceCandidate {
                room_id,
                target_user_id,
                candidate,
                sdp_mid,
                sdp_m_line_index,
            } => {
                if let Some(user) = session.user.clone() {
                    self.relay(
                        &room_id,
                        &target_user_id,
                        ServerMessage::RtcIceCandidate {
                            room_id: room_id.clone(),
                            from_user_id: user.id,
                            candidate,
                            sdp_mid,
                            sdp_m_line_index,
                        },
                    )
                    .await;
                }
            }
            ClientMessage::RemoteControlRequest {
                room_id,
                target_user_id,
            } => {
                if let Some(user) = session.user.clone() {
                    self.relay(
                        &room_id,
                        &target_user_id,
                        ServerMessage::RemoteControlRequest {
                            room_id: room_id.clone(),
                            from_user_id: user.id,
                        },
                    )
                    .await;
                }
            }
            ClientMessage::RemoteControlResponse {
                room_id,
                target_user_id,
                granted,
            } => {
                if let Some(user) = session.user.clone() {
                    self.relay(
                        &room_id,
                        &target_user_id,
                        ServerMessage::RemoteControlResponse {
                            room_id: room_id.clone(),
                            from_user_id: user.id,
                            granted,
                        },
                    )
                    .await;
                }
            }
        }
    }

    async fn try_claim_connection(&self, user_id: &str) -> bool {
        let mut connections = self.user_connections.write().await;
        let count = connections.entry(user_id.to_string()).or_insert(0);
        if *count >= self.config.max_connections_per_user {
            return false;
        }
        *count += 1;
        true
    }

    async fn release_connection(&self, user_id: &str) {
        let mut connections = self.user_connections.write().await;
        if let Some(count) = connections.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connections.remove(user_id);
            }
        }
    }

    /// Authenticate a token against the provider with per-IP throttling.
    /// Returns the principal, or `None` after emitting the proper error.
    async fn authenticate_token(
        &self,
        tx: &Outbound,
        addr: SocketAddr,
        token: &str,
    ) -> Option<crate::auth::AuthUser> {
        let Some(provider) = &self.auth else {
            send_error(
                tx,
                ErrorCode::AuthenticationFailed,
                "Authentication not configured.",
                None,
            );
            return None;
        };
        let ip = addr.ip();
        if !self.auth_guard.lock().await.check(ip) {
            send_error(
                tx,
                ErrorCode::RateLimited,
                "Too many auth attempts. Try again later.",
                None,
            );
            return None;
        }
        match provider.authenticate(token).await {
            Ok(user) => {
                self.auth_guard.lock().await.record_success(ip);
                Some(user)
            }
            Err(e) => {
                log::debug!("authentication failure from {addr}: {e}");
                self.auth_guard.lock().await.record_failure(ip);
                send_error(
                    tx,
                    ErrorCode::AuthenticationFailed,
                    "Invalid authentication token.",
                    None,
                );
                None
            }
        }
    }

    /// Install a principal on the session, honoring the per-user
    /// connection cap. Returns `false` (with the error sent) on overflow.
    async fn install_user(&self, tx: &Outbound, session: &mut Session, user: User) -> bool {
        if let Some(previous) = &session.user {
            if previous.id == user.id {
                session.user = Some(user);
                return true;
            }
            let previous_id = previous.id.clone();
            self.release_connection(&previous_id).await;
        }
        if !self.try_claim_connection(&user.id).await {
            send_error(tx, ErrorCode::RateLimited, "Too many connections.", None);
            return false;
        }
        session.user = Some(user);
        true
    }

    async fn handle_auth(
        &self,
        tx: &Outbound,
        addr: SocketAddr,
        session: &mut Session,
        token: &str,
    ) {
        let Some(auth_user) = self.authenticate_token(tx, addr, token).await else {
            return;
        };
        let user = auth_user.to_user();
        let user_id = user.id.clone();
        if !self.install_user(tx, session, user).await {
            return;
        }
        session.authenticated = true;
        send_message(tx, &ServerMessage::Authenticated { user_id });
    }

    async fn handle_join(
        &self,
        tx: &Outbound,
        addr: SocketAddr,
        session: &mut Session,
        room_id: String,
        token: Option<String>,
        user_info: Option<User>,
    ) {
        // A join may authenticate inline; an invalid token rejects the join
        // rather than falling through to anonymous.
        if let Some(token) = token {
            if self.auth.is_some() {
                let Some(auth_user) = self.authenticate_token(tx, addr, &token).await else {
                    return;
                };
                if !self.install_user(tx, session, auth_user.to_user()).await {
                    return;
                }
                session.authenticated = true;
            }
        }

        if self.config.require_auth && !session.authenticated {
            send_error(
                tx,
                ErrorCode::AuthenticationFailed,
                "Authentication required.",
                Some(&room_id),
            );
            return;
        }

        if session.user.is_none() {
            if !self.config.allow_anonymous {
                send_error(
                    tx,
                    ErrorCode::AuthenticationFailed,
                    "Authentication required.",
                    Some(&room_id),
                );
                return;
            }
            // Anonymous joins adopt the supplied descriptor; without one
            // the principal gets a minted unguessable id.
            let user = user_info.unwrap_or_else(|| {
                User::new(format!("anon-{}", Uuid::new_v4().simple()), "Anonymous")
            });
            if !self.install_user(tx, session, user).await {
                return;
            }
        }

        let user = match &session.user {
            Some(user) => user.clone(),
            None => return,
        };

        if let Some(permissions) = &self.permissions {
            if !permissions.check(&user.id, &room_id, Action::Read) {
                send_error(
                    tx,
                    ErrorCode::PermissionDenied,
                    "Permission denied to join room.",
                    Some(&room_id),
                );
                return;
            }
        }

        let room = match self.rooms.get_room(&room_id).await {
            Some(room) => room,
            None if self.config.auto_create_rooms => match self.load_room_snapshot(&room_id).await {
                Some(snapshot) => match self
                    .rooms
                    .create_room_from_snapshot(&room_id, snapshot)
                    .await
                {
                    Ok(room) => room,
                    Err(e) => {
                        log::warn!("discarding corrupt snapshot for room {room_id}: {e}");
                        self.rooms.create_room(&room_id).await
                    }
                },
                None => self.rooms.create_room(&room_id).await,
            },
            None => {
                send_error(
                    tx,
                    ErrorCode::RoomNotFound,
                    &format!("Room '{room_id}' not found."),
                    Some(&room_id),
                );
                return;
            }
        };

        let (state, _) = room.join(user.clone(), tx.clone()).await;
        session.rooms.insert(room_id.clone());
        let users = room.users().await;

        send_message(
            tx,
            &ServerMessage::Joined {
                room_id: room_id.clone(),
                user_id: user.id.clone(),
                users,
                state,
            },
        );
        room.broadcast(
            &ServerMessage::UserJoined {
                room_id,
                user: user.clone(),
            },
            Some(&user.id),
        )
        .await;
    }

    async fn handle_leave(&self, session: &mut Session, room_id: &str) {
        let Some(user) = session.user.clone() else {
            return;
        };
        if !session.rooms.remove(room_id) {
            return;
        }
        self.leave_room(room_id, &user.id).await;
    }

    async fn leave_room(&self, room_id: &str, user_id: &str) {
        let Some(room) = self.rooms.get_room(room_id).await else {
            return;
        };
        room.leave(user_id).await;
        room.broadcast(
            &ServerMessage::UserLeft {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            },
            None,
        )
        .await;
        self.save_room_snapshot(&room).await;
    }

    async fn handle_operation(
        &self,
        tx: &Outbound,
        session: &mut Session,
        room_id: String,
        operation: Operation,
    ) {
        let Some(user) = session.user.clone() else {
            send_error(tx, ErrorCode::AuthenticationFailed, "Not authenticated.", Some(&room_id));
            return;
        };
        if !session.rooms.contains(&room_id) {
            send_error(
                tx,
                ErrorCode::PermissionDenied,
                "Must join room before sending operations.",
                Some(&room_id),
            );
            return;
        }
        if let Some(permissions) = &self.permissions {
            if !permissions.check(&user.id, &room_id, Action::Write) {
                send_error(
                    tx,
                    ErrorCode::PermissionDenied,
                    "Permission denied to write.",
                    Some(&room_id),
                );
                return;
            }
        }
        let Some(room) = self.rooms.get_room(&room_id).await else {
            send_error(
                tx,
                ErrorCode::RoomNotFound,
                &format!("Room '{room_id}' not found."),
                Some(&room_id),
            );
            return;
        };
        match room
            .apply_operation(&operation, self.config.use_server_timestamp)
            .await
        {
            Ok((canonical, applied)) => {
                if !applied {
                    log::debug!("duplicate operation {} rebroadcast as no-op", canonical.id);
                }
                // Everyone gets the canonical operation, the sender
                // included; clients skip their own user id.
                room.broadcast(
                    &ServerMessage::Operation {
                        room_id: room_id.clone(),
                        user_id: user.id,
                        operation: canonical,
                    },
                    None,
                )
                .await;
                if self.config.save_on_operation {
                    self.save_room_snapshot(&room).await;
                }
            }
            Err(e) => {
                log::debug!("rejected operation in room {room_id}: {e}");
                send_error(tx, ErrorCode::InvalidOperation, "Invalid operation.", Some(&room_id));
            }
        }
    }

    async fn handle_sync_request(
        &self,
        tx: &Outbound,
        session: &mut Session,
        room_id: String,
        since_timestamp: f64,
    ) {
        if session.user.is_none() {
            send_error(tx, ErrorCode::AuthenticationFailed, "Not authenticated.", Some(&room_id));
            return;
        }
        if !session.rooms.contains(&room_id) {
            send_error(
                tx,
                ErrorCode::PermissionDenied,
                "Must join room before requesting sync.",
                Some(&room_id),
            );
            return;
        }
        let Some(room) = self.rooms.get_room(&room_id).await else {
            send_error(
                tx,
                ErrorCode::RoomNotFound,
                &format!("Room '{room_id}' not found."),
                Some(&room_id),
            );
            return;
        };
        let state = room.snapshot().await;
        let operations = room.operations_since(since_timestamp).await;
        let version_vector = room.version_vector().await;
        send_message(
            tx,
            &ServerMessage::Sync {
                room_id,
                state,
                operations,
                version_vector,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_call(
        &self,
        tx: &Outbound,
        session: &mut Session,
        room_id: String,
        call_id: String,
        function_name: String,
        args: Vec<Value>,
        kwargs: JsonMap<String, Value>,
    ) {
        let reply = |success: bool, result: Option<Value>, error: Option<String>| {
            ServerMessage::CallResult {
                call_id: call_id.clone(),
                success,
                result,
                error,
            }
        };

        if !session.rooms.contains(&room_id) {
            send_message(
                tx,
                &reply(
                    false,
                    None,
                    Some("Must join room before calling functions.".to_string()),
                ),
            );
            return;
        }
        let Some(room) = self.rooms.get_room(&room_id).await else {
            send_message(
                tx,
                &reply(false, None, Some(format!("Room '{room_id}' not found."))),
            );
            return;
        };
        let Some(function) = room.function(&function_name).await else {
            send_message(
                tx,
                &reply(
                    false,
                    None,
                    Some(format!("Function '{function_name}' not found.")),
                ),
            );
            return;
        };

        if let (Some(permissions), Some(user)) = (&self.permissions, &session.user) {
            for action in &function.required_permissions {
                if !permissions.check(&user.id, &room_id, *action) {
                    send_message(
                        tx,
                        &reply(false, None, Some(format!("Permission denied: {action:?}"))),
                    );
                    return;
                }
            }
        }

        let result = room
            .call(
                &function_name,
                session.user.clone(),
                session.authenticated,
                args,
                kwargs,
                self.config.function_timeout,
            )
            .await;
        match result {
            Ok(value) => send_message(tx, &reply(true, Some(value), None)),
            Err(e) => {
                log::warn!("function call '{function_name}' failed: {e}");
                send_message(tx, &reply(false, None, Some(e.to_string())));
            }
        }
    }

    async fn handle_presence(
        &self,
        tx: &Outbound,
        session: &mut Session,
        room_id: String,
        data: JsonMap<String, Value>,
    ) {
        let Some(user) = session.user.clone() else {
            return;
        };
        if !session.rooms.contains(&room_id) {
            send_error(
                tx,
                ErrorCode::PermissionDenied,
                "Must join room before updating presence.",
                Some(&room_id),
            );
            return;
        }
        let Some(room) = self.rooms.get_room(&room_id).await else {
            return;
        };
        room.update_presence(&user.id, &data).await;
        room.broadcast(
            &ServerMessage::Presence {
                room_id,
                user_id: user.id.clone(),
                data,
            },
            Some(&user.id),
        )
        .await;
    }

    async fn handle_screenshare_start(
        &self,
        tx: &Outbound,
        session: &mut Session,
        room_id: String,
        share_name: Option<String>,
    ) {
        let Some(user) = session.user.clone() else {
            send_error(tx, ErrorCode::AuthenticationFailed, "Not authenticated.", Some(&room_id));
            return;
        };
        if !session.rooms.contains(&room_id) {
            send_error(
                tx,
                ErrorCode::PermissionDenied,
                "Must join room first.",
                Some(&room_id),
            );
            return;
        }
        {
            let mut sharers = self.screen_sharers.write().await;
            if let Some(existing) = sharers.get(&room_id) {
                if existing != &user.id {
                    send_error(
                        tx,
                        ErrorCode::PermissionDenied,
                        "Another user is already sharing in this room.",
                        Some(&room_id),
                    );
                    return;
                }
            }
            sharers.insert(room_id.clone(), user.id.clone());
        }
        let Some(room) = self.rooms.get_room(&room_id).await else {
            return;
        };
        // The sharer needs the echo to start creating offers.
        room.broadcast(
            &ServerMessage::ScreenshareStarted {
                room_id,
                user_id: user.id,
                share_name,
            },
            None,
        )
        .await;
    }

    async fn handle_screenshare_stop(&self, session: &mut Session, room_id: &str) {
        let Some(user) = session.user.clone() else {
            return;
        };
        {
            let mut sharers = self.screen_sharers.write().await;
            if sharers.get(room_id).map(String::as_str) != Some(user.id.as_str()) {
                return;
            }
            sharers.remove(room_id);
        }
        let Some(room) = self.rooms.get_room(room_id).await else {
            return;
        };
        room.broadcast(
            &ServerMessage::ScreenshareStopped {
                room_id: room_id.to_string(),
                user_id: user.id,
            },
            None,
        )
        .await;
    }

    /// Relay an opaque signaling payload to one member; SDP and ICE bodies
    /// are never inspected.
    async fn relay(&self, room_id: &str, target_user_id: &str, msg: ServerMessage) {
        let Some(room) = self.rooms.get_room(room_id).await else {
            return;
        };
        if !room.send_to(target_user_id, &msg).await {
            log::debug!("failed to relay signaling to {target_user_id} in room {room_id}");
        }
    }

    async fn load_room_snapshot(&self, room_id: &str) -> Option<MapSnapshot> {
        let storage = self.storage.as_ref()?;
        match storage.load(&format!("room:{room_id}")).await {
            Ok(Some(blob)) => match serde_json::from_slice(&blob) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    log::warn!("stored snapshot for room {room_id} is corrupt: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("failed to load snapshot for room {room_id}: {e}");
                None
            }
        }
    }

    async fn save_room_snapshot(&self, room: &Arc<Room>) {
        let Some(storage) = &self.storage else {
            return;
        };
        let snapshot = room.snapshot().await;
        let blob = match serde_json::to_vec(&snapshot) {
            Ok(blob) => blob,
            Err(e) => {
                log::warn!("failed to serialize snapshot for room {}: {e}", room.id());
                return;
            }
        };
        if let Err(e) = storage.save(&format!("room:{}", room.id()), &blob).await {
            log::warn!("failed to persist snapshot for room {}: {e}", room.id());
        }
    }

    async fn cleanup_connection(&self, session: &Session) {
        if let Some(user) = &session.user {
            for room_id in &session.rooms {
                let was_sharer = {
                    let mut sharers = self.screen_sharers.write().await;
                    if sharers.get(room_id).map(String::as_str) == Some(user.id.as_str()) {
                        sharers.remove(room_id);
                        true
                    } else {
                        false
                    }
                };
                if was_sharer {
                    if let Some(room) = self.rooms.get_room(room_id).await {
                        room.broadcast(
                            &ServerMessage::ScreenshareStopped {
                                room_id: room_id.clone(),
                                user_id: user.id.clone(),
                            },
                            None,
                        )
                        .await;
                    }
                }
                self.leave_room(room_id, &user.id).await;
            }
            self.release_connection(&user.id).await;
        }
        let mut stats = self.stats.write().await;
        stats.active_connections = stats.active_connections.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.path, "/ws");
        assert!(!config.require_auth);
        assert!(!config.allow_anonymous);
        assert!(config.auto_create_rooms);
        assert!(!config.save_on_operation);
        assert_eq!(config.rate_limit, 100.0);
        assert_eq!(config.max_message_size, 1024 * 1024);
        assert_eq!(config.message_timeout, Duration::from_secs(60));
        assert_eq!(config.function_timeout, Duration::from_secs(30));
        assert_eq!(config.max_connections_per_user, 10);
        assert!(!config.use_server_timestamp);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = CollabServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:8765");
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_register_function_reaches_rooms() {
        use crate::room::{FunctionCall, RegisteredFunction};
        use serde_json::json;
        use std::sync::Arc as StdArc;

        let server = CollabServer::with_defaults();
        server
            .register_function(RegisteredFunction::new(
                "hello",
                StdArc::new(|_call: FunctionCall| Box::pin(async { Ok(json!("hi")) })),
                false,
                Vec::new(),
            ))
            .await;
        let room = server.rooms().create_room("r").await;
        assert!(room.has_function("hello").await);
    }
}
