//! # collabkit — real-time collaboration toolkit
//!
//! Many clients connect to a central broker and mutate shared per-room
//! state whose concurrent writes merge automatically through CRDTs.
//! Clients also exchange transient presence, invoke server-registered
//! functions, and relay WebRTC signaling for peer-to-peer screen sharing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket       ┌──────────────┐
//! │ CollabClient │ ◄──────────────────► │ CollabServer │
//! │  (per user)  │     JSON envelope    │  (broker)    │
//! └──────┬───────┘                      └──────┬───────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐                      ┌──────────────┐
//! │ LwwMap       │                      │ Room         │
//! │ (mirror)     │                      │ (authority)  │
//! └──────┬───────┘                      └──────┬───────┘
//!        │                                     │
//! ┌──────┴───────┐                   ┌─────────┴─────────┐
//! │ OfflineQueue │                   │ StorageBackend    │
//! │ (durable)    │                   │ (snapshots)       │
//! └──────────────┘                   └───────────────────┘
//! ```
//!
//! Every mutation is an [`crdt::Operation`] resolved by `(timestamp,
//! origin)` last-writer-wins order, so replicas converge regardless of
//! delivery order. The broker validates, applies, and rebroadcasts; it
//! never merges authoritatively.
//!
//! ## Modules
//!
//! - [`crdt`] — operations, LWW register/map, counters, OR-set
//! - [`protocol`] — JSON wire envelopes and the bounded codec
//! - [`validate`] — blocked-key, depth, and size screening
//! - [`room`] — authoritative room state, membership, functions
//! - [`server`] — WebSocket broker and per-connection sessions
//! - [`client`] — reconnecting client with local mirrors and listeners
//! - [`queue`] — durable offline operation queue
//! - [`screenshare`] — WebRTC signaling coordinator
//! - [`auth`] / [`permissions`] / [`storage`] — pluggable interfaces
//! - [`limiter`] / [`presence`] — token buckets, transient presence

pub mod auth;
pub mod client;
pub mod crdt;
pub mod limiter;
pub mod permissions;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod room;
pub mod screenshare;
pub mod server;
pub mod storage;
pub mod validate;

// Re-exports for convenience
pub use auth::{AuthError, AuthProvider, AuthUser, StaticTokenAuth};
pub use client::{ClientConfig, ClientError, CollabClient, ConnectionState};
pub use crdt::counter::{GCounter, PnCounter};
pub use crdt::map::{LwwMap, MapSnapshot};
pub use crdt::register::LwwRegister;
pub use crdt::set::OrSet;
pub use crdt::{CrdtError, OpKind, Operation, VersionVector};
pub use limiter::{AuthGuard, RateLimiter};
pub use permissions::{Action, AllowAll, FieldPolicy, FieldRule, GrantTable, PermissionManager};
pub use presence::{PresenceEntry, RoomPresence};
pub use protocol::{
    ClientMessage, ErrorCode, ProtocolError, ServerMessage, User,
};
pub use queue::{OfflineQueue, QueuedOp};
pub use room::{
    FunctionCall, FunctionError, FunctionHandler, RegisteredFunction, Room, RoomManager,
};
pub use screenshare::{
    Annotation, ChannelPayload, IceCandidate, MediaHost, MediaStream, PeerConnection, Point,
    ScreenShareCoordinator, ShareError, ShareRole,
};
pub use server::{CollabServer, ServerConfig, ServerError, ServerStats};
pub use storage::{FileStorage, MemoryStorage, StorageBackend, StorageError};
pub use validate::{ValidateError, BLOCKED_KEYS, MAX_MESSAGE_SIZE, MAX_VALUE_SIZE};
