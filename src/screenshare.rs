//! Screen-share coordinator: per-room WebRTC signaling state machine.
//!
//! The coordinator never touches media bits. The host platform implements
//! [`MediaHost`] and [`PeerConnection`]; the coordinator drives signaling
//! over the broker socket and tracks per-peer state.
//!
//! ```text
//! start_sharing()                broker echo
//!      │                             │
//!      ▼                             ▼
//! acquire media ── screenshare_start ── screenshare_started(self)
//!                                           │
//!                               one offer per other member
//!                                           │
//!                    rtc_offer ⇄ rtc_answer ⇄ rtc_ice_candidate
//!                                           │
//!                        annotations data channel (ordered)
//! ```
//!
//! ICE candidates that arrive before the remote description is set are
//! buffered per peer and flushed on the first remote-description success;
//! nothing else in the state machine depends on timing.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::crdt::now_seconds;
use crate::protocol::{ClientMessage, ServerMessage};

/// Label of the single ordered data channel the sharer creates.
pub const ANNOTATION_CHANNEL: &str = "annotations";

/// Role within a room's screen-share session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareRole {
    Idle,
    Sharer,
    Viewer,
}

/// Opaque handle to a host-side media stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream(pub String);

/// One ICE candidate as relayed over the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u32>,
}

/// Screen-share failures.
#[derive(Debug, Error)]
pub enum ShareError {
    #[error("media host error: {0}")]
    Host(String),
    #[error("no peer connection for user '{0}'")]
    NoPeer(String),
    #[error("not currently sharing")]
    NotSharing,
    #[error("signaling channel closed")]
    SignalChannelClosed,
    #[error("data channel codec error: {0}")]
    Codec(String),
}

/// Host-side peer connection. SDP strings and candidates pass through
/// unchanged; the coordinator only sequences the calls.
pub trait PeerConnection: Send {
    fn create_offer(&mut self) -> Result<String, ShareError>;
    fn create_answer(&mut self) -> Result<String, ShareError>;
    fn set_remote_description(&mut self, sdp: &str) -> Result<(), ShareError>;
    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), ShareError>;
    fn attach_stream(&mut self, stream: &MediaStream) -> Result<(), ShareError>;
    fn replace_stream(&mut self, stream: &MediaStream) -> Result<(), ShareError>;
    fn open_data_channel(&mut self, label: &str) -> Result<(), ShareError>;
    fn send_data(&mut self, payload: &[u8]) -> Result<(), ShareError>;
    fn close(&mut self);
}

/// Host platform integration: media acquisition and peer construction.
pub trait MediaHost: Send + Sync {
    fn acquire_display_media(&self) -> Result<MediaStream, ShareError>;
    fn create_peer(&self, remote_user_id: &str) -> Result<Box<dyn PeerConnection>, ShareError>;
}

/// A normalized point in the shared viewport; both coordinates in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x: x.clamp(0.0, 1.0),
            y: y.clamp(0.0, 1.0),
        }
    }
}

/// A drawn annotation riding the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: Uuid,
    pub author_id: String,
    /// RGB color string, e.g. `#ff4040`.
    pub color: String,
    pub points: Vec<Point>,
    pub timestamp: f64,
}

impl Annotation {
    pub fn new(author_id: impl Into<String>, color: impl Into<String>, points: Vec<Point>) -> Self {
        Self {
            id: Uuid::new_v4(),
            author_id: author_id.into(),
            color: color.into(),
            points,
            timestamp: now_seconds(),
        }
    }
}

/// Small JSON payloads carried by the annotations data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelPayload {
    Annotation(Annotation),
    Cursor {
        user_id: String,
        x: f32,
        y: f32,
    },
    ClearAnnotations {
        author_id: String,
    },
}

struct PeerState {
    conn: Box<dyn PeerConnection>,
    pending_ice: Vec<IceCandidate>,
    remote_set: bool,
    remote_stream: Option<MediaStream>,
}

impl PeerState {
    fn new(conn: Box<dyn PeerConnection>) -> Self {
        Self {
            conn,
            pending_ice: Vec::new(),
            remote_set: false,
            remote_stream: None,
        }
    }

    fn set_remote_description(&mut self, sdp: &str) -> Result<(), ShareError> {
        self.conn.set_remote_description(sdp)?;
        self.remote_set = true;
        // Flush candidates buffered before the description landed.
        for candidate in self.pending_ice.drain(..) {
            self.conn.add_ice_candidate(&candidate)?;
        }
        Ok(())
    }
}

/// Per-room signaling state machine.
pub struct ScreenShareCoordinator {
    room_id: String,
    self_id: String,
    host: Box<dyn MediaHost>,
    signals: mpsc::UnboundedSender<ClientMessage>,
    role: ShareRole,
    sharer_id: Option<String>,
    local_stream: Option<MediaStream>,
    members: Vec<String>,
    peers: HashMap<String, PeerState>,
    /// Candidates that arrived before any peer existed for the sender.
    early_ice: HashMap<String, Vec<IceCandidate>>,
    pending_control: HashSet<String>,
    control_granted_to: Option<String>,
    has_control: bool,
    annotations: Vec<Annotation>,
    cursors: HashMap<String, Point>,
}

impl ScreenShareCoordinator {
    pub fn new(
        room_id: impl Into<String>,
        self_id: impl Into<String>,
        host: Box<dyn MediaHost>,
        signals: mpsc::UnboundedSender<ClientMessage>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            self_id: self_id.into(),
            host,
            signals,
            role: ShareRole::Idle,
            sharer_id: None,
            local_stream: None,
            members: Vec::new(),
            peers: HashMap::new(),
            early_ice: HashMap::new(),
            pending_control: HashSet::new(),
            control_granted_to: None,
            has_control: false,
            annotations: Vec::new(),
            cursors: HashMap::new(),
        }
    }

    pub fn role(&self) -> ShareRole {
        self.role
    }

    pub fn sharer_id(&self) -> Option<&str> {
        self.sharer_id.as_deref()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, user_id: &str) -> bool {
        self.peers.contains_key(user_id)
    }

    pub fn pending_control_requests(&self) -> Vec<String> {
        self.pending_control.iter().cloned().collect()
    }

    pub fn control_granted_to(&self) -> Option<&str> {
        self.control_granted_to.as_deref()
    }

    /// Whether this (viewer-side) coordinator currently holds control.
    pub fn has_control(&self) -> bool {
        self.has_control
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn cursor_of(&self, user_id: &str) -> Option<Point> {
        self.cursors.get(user_id).copied()
    }

    pub fn remote_stream_of(&self, user_id: &str) -> Option<&MediaStream> {
        self.peers
            .get(user_id)
            .and_then(|peer| peer.remote_stream.as_ref())
    }

    /// Seed the member list (from a `joined` response).
    pub fn set_members(&mut self, members: Vec<String>) {
        self.members = members;
    }

    fn signal(&self, msg: ClientMessage) -> Result<(), ShareError> {
        self.signals
            .send(msg)
            .map_err(|_| ShareError::SignalChannelClosed)
    }

    /// Begin sharing. Already-sharing coordinators swap the track on every
    /// live peer connection instead of tearing down; otherwise the role
    /// flips to sharer and offer creation waits for the broker echo.
    pub fn start_sharing(&mut self, share_name: Option<String>) -> Result<(), ShareError> {
        let stream = self.host.acquire_display_media()?;
        if self.role == ShareRole::Sharer {
            for peer in self.peers.values_mut() {
                peer.conn.replace_stream(&stream)?;
            }
            self.local_stream = Some(stream);
            return Ok(());
        }
        self.local_stream = Some(stream);
        self.role = ShareRole::Sharer;
        self.signal(ClientMessage::ScreenshareStart {
            room_id: self.room_id.clone(),
            share_name,
        })
    }

    /// Stop sharing: tear down every peer and notify the room.
    pub fn stop_sharing(&mut self) -> Result<(), ShareError> {
        if self.role != ShareRole::Sharer {
            return Err(ShareError::NotSharing);
        }
        self.reset();
        self.signal(ClientMessage::ScreenshareStop {
            room_id: self.room_id.clone(),
        })
    }

    fn reset(&mut self) {
        for (_, mut peer) in self.peers.drain() {
            peer.conn.close();
        }
        self.role = ShareRole::Idle;
        self.sharer_id = None;
        self.local_stream = None;
        self.early_ice.clear();
        self.pending_control.clear();
        self.control_granted_to = None;
        self.has_control = false;
    }

    fn offer_to(&mut self, user_id: &str) -> Result<(), ShareError> {
        let mut conn = self.host.create_peer(user_id)?;
        if let Some(stream) = &self.local_stream {
            conn.attach_stream(stream)?;
        }
        conn.open_data_channel(ANNOTATION_CHANNEL)?;
        let sdp = conn.create_offer()?;
        let mut peer = PeerState::new(conn);
        if let Some(buffered) = self.early_ice.remove(user_id) {
            peer.pending_ice.extend(buffered);
        }
        self.peers.insert(user_id.to_string(), peer);
        self.signal(ClientMessage::RtcOffer {
            room_id: self.room_id.clone(),
            target_user_id: user_id.to_string(),
            sdp,
        })
    }

    /// Viewer asks the sharer for remote control.
    pub fn request_control(&mut self) -> Result<(), ShareError> {
        let Some(sharer) = self.sharer_id.clone() else {
            return Err(ShareError::NotSharing);
        };
        self.signal(ClientMessage::RemoteControlRequest {
            room_id: self.room_id.clone(),
            target_user_id: sharer,
        })
    }

    /// Sharer answers a pending control request. Granting replaces any
    /// previously granted viewer.
    pub fn respond_control(&mut self, user_id: &str, granted: bool) -> Result<(), ShareError> {
        self.pending_control.remove(user_id);
        if granted {
            self.control_granted_to = Some(user_id.to_string());
        }
        self.signal(ClientMessage::RemoteControlResponse {
            room_id: self.room_id.clone(),
            target_user_id: user_id.to_string(),
            granted,
        })
    }

    /// Sharer revokes control; the controlling viewer flips back.
    pub fn revoke_control(&mut self) -> Result<(), ShareError> {
        let Some(user_id) = self.control_granted_to.take() else {
            return Ok(());
        };
        self.signal(ClientMessage::RemoteControlResponse {
            room_id: self.room_id.clone(),
            target_user_id: user_id,
            granted: false,
        })
    }

    /// Broadcast an annotation to every connected peer.
    pub fn send_annotation(
        &mut self,
        color: impl Into<String>,
        points: Vec<Point>,
    ) -> Result<Annotation, ShareError> {
        let annotation = Annotation::new(self.self_id.clone(), color, points);
        self.broadcast_payload(&ChannelPayload::Annotation(annotation.clone()))?;
        self.annotations.push(annotation.clone());
        Ok(annotation)
    }

    /// Broadcast a cursor position update.
    pub fn send_cursor(&mut self, x: f32, y: f32) -> Result<(), ShareError> {
        let payload = ChannelPayload::Cursor {
            user_id: self.self_id.clone(),
            x,
            y,
        };
        self.broadcast_payload(&payload)
    }

    /// Clear annotations locally and on every peer.
    pub fn clear_annotations(&mut self) -> Result<(), ShareError> {
        self.annotations.clear();
        let payload = ChannelPayload::ClearAnnotations {
            author_id: self.self_id.clone(),
        };
        self.broadcast_payload(&payload)
    }

    fn broadcast_payload(&mut self, payload: &ChannelPayload) -> Result<(), ShareError> {
        let bytes = serde_json::to_vec(payload).map_err(|e| ShareError::Codec(e.to_string()))?;
        for peer in self.peers.values_mut() {
            peer.conn.send_data(&bytes)?;
        }
        Ok(())
    }

    /// Ingest a payload received on the data channel, updating local
    /// annotation and cursor state.
    pub fn ingest_payload(&mut self, bytes: &[u8]) -> Result<ChannelPayload, ShareError> {
        let payload: ChannelPayload =
            serde_json::from_slice(bytes).map_err(|e| ShareError::Codec(e.to_string()))?;
        match &payload {
            ChannelPayload::Annotation(annotation) => self.annotations.push(annotation.clone()),
            ChannelPayload::Cursor { user_id, x, y } => {
                self.cursors.insert(user_id.clone(), Point::new(*x, *y));
            }
            ChannelPayload::ClearAnnotations { .. } => self.annotations.clear(),
        }
        Ok(payload)
    }

    /// The host delivered a remote media stream for a peer.
    pub fn handle_remote_stream(&mut self, user_id: &str, stream: MediaStream) {
        if let Some(peer) = self.peers.get_mut(user_id) {
            peer.remote_stream = Some(stream);
        }
    }

    /// Drive the state machine with a broker message for this room.
    pub fn handle_message(&mut self, msg: &ServerMessage) -> Result<(), ShareError> {
        match msg {
            ServerMessage::ScreenshareStarted { room_id, user_id, .. } if room_id == &self.room_id => {
                self.sharer_id = Some(user_id.clone());
                if user_id == &self.self_id {
                    // Broker echo: now create one offer per other member.
                    let targets: Vec<String> = self
                        .members
                        .iter()
                        .filter(|member| *member != &self.self_id)
                        .cloned()
                        .collect();
                    for target in targets {
                        self.offer_to(&target)?;
                    }
                } else {
                    self.role = ShareRole::Viewer;
                }
            }
            ServerMessage::ScreenshareStopped { room_id, user_id } if room_id == &self.room_id => {
                if self.sharer_id.as_deref() == Some(user_id.as_str()) {
                    self.reset();
                }
            }
            ServerMessage::RtcOffer {
                room_id,
                from_user_id,
                sdp,
            } if room_id == &self.room_id => {
                if !self.peers.contains_key(from_user_id) {
                    let conn = self.host.create_peer(from_user_id)?;
                    let mut peer = PeerState::new(conn);
                    if let Some(buffered) = self.early_ice.remove(from_user_id) {
                        peer.pending_ice.extend(buffered);
                    }
                    self.peers.insert(from_user_id.clone(), peer);
                }
                let answer = {
                    let peer = self
                        .peers
                        .get_mut(from_user_id)
                        .ok_or_else(|| ShareError::NoPeer(from_user_id.clone()))?;
                    peer.set_remote_description(sdp)?;
                    peer.conn.create_answer()?
                };
                self.signal(ClientMessage::RtcAnswer {
                    room_id: self.room_id.clone(),
                    target_user_id: from_user_id.clone(),
                    sdp: answer,
                })?;
            }
            ServerMessage::RtcAnswer {
                room_id,
                from_user_id,
                sdp,
            } if room_id == &self.room_id => {
                let peer = self
                    .peers
                    .get_mut(from_user_id)
                    .ok_or_else(|| ShareError::NoPeer(from_user_id.clone()))?;
                peer.set_remote_description(sdp)?;
            }
            ServerMessage::RtcIceCandidate {
                room_id,
                from_user_id,
                candidate,
                sdp_mid,
                sdp_m_line_index,
            } if room_id == &self.room_id => {
                let ice = IceCandidate {
                    candidate: candidate.clone(),
                    sdp_mid: sdp_mid.clone(),
                    sdp_m_line_index: *sdp_m_line_index,
                };
                match self.peers.get_mut(from_user_id) {
                    Some(peer) if peer.remote_set => peer.conn.add_ice_candidate(&ice)?,
                    Some(peer) => peer.pending_ice.push(ice),
                    None => self
                        .early_ice
                        .entry(from_user_id.clone())
                        .or_default()
                        .push(ice),
                }
            }
            ServerMessage::RemoteControlRequest { room_id, from_user_id }
                if room_id == &self.room_id =>
            {
                if self.role == ShareRole::Sharer {
                    self.pending_control.insert(from_user_id.clone());
                }
            }
            ServerMessage::RemoteControlResponse { room_id, granted, .. }
                if room_id == &self.room_id =>
            {
                self.has_control = *granted;
            }
            ServerMessage::UserJoined { room_id, user } if room_id == &self.room_id => {
                if !self.members.contains(&user.id) {
                    self.members.push(user.id.clone());
                }
                if self.role == ShareRole::Sharer {
                    // Late joiner gets exactly one offer.
                    let target = user.id.clone();
                    self.offer_to(&target)?;
                }
            }
            ServerMessage::UserLeft { room_id, user_id } if room_id == &self.room_id => {
                self.members.retain(|member| member != user_id);
                if let Some(mut peer) = self.peers.remove(user_id) {
                    peer.conn.close();
                }
                self.early_ice.remove(user_id);
                self.pending_control.remove(user_id);
                if self.control_granted_to.as_deref() == Some(user_id.as_str()) {
                    self.control_granted_to = None;
                }
                self.cursors.remove(user_id);
                if self.sharer_id.as_deref() == Some(user_id.as_str()) {
                    // Sharer left: viewers drop remote streams and go idle.
                    self.reset();
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Convenience for hosts that want raw JSON annotation payloads.
pub fn encode_payload(payload: &ChannelPayload) -> Result<Vec<u8>, ShareError> {
    serde_json::to_vec(payload).map_err(|e| ShareError::Codec(e.to_string()))
}

/// Parse a data-channel payload without applying it.
pub fn decode_payload(bytes: &[u8]) -> Result<ChannelPayload, ShareError> {
    let payload: Value =
        serde_json::from_slice(bytes).map_err(|e| ShareError::Codec(e.to_string()))?;
    serde_json::from_value(payload).map_err(|e| ShareError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records every call so tests can assert on the signaling sequence.
    #[derive(Default)]
    struct MockPeerLog {
        offers: AtomicUsize,
        answers: AtomicUsize,
        remote_descriptions: Mutex<Vec<String>>,
        ice: Mutex<Vec<String>>,
        data: Mutex<Vec<Vec<u8>>>,
        channels: Mutex<Vec<String>>,
        attached: AtomicUsize,
        replaced: AtomicUsize,
        closed: AtomicUsize,
    }

    struct MockPeer {
        log: Arc<MockPeerLog>,
    }

    impl PeerConnection for MockPeer {
        fn create_offer(&mut self) -> Result<String, ShareError> {
            self.log.offers.fetch_add(1, Ordering::SeqCst);
            Ok("offer-sdp".to_string())
        }
        fn create_answer(&mut self) -> Result<String, ShareError> {
            self.log.answers.fetch_add(1, Ordering::SeqCst);
            Ok("answer-sdp".to_string())
        }
        fn set_remote_description(&mut self, sdp: &str) -> Result<(), ShareError> {
            self.log
                .remote_descriptions
                .lock()
                .unwrap()
                .push(sdp.to_string());
            Ok(())
        }
        fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), ShareError> {
            self.log.ice.lock().unwrap().push(candidate.candidate.clone());
            Ok(())
        }
        fn attach_stream(&mut self, _stream: &MediaStream) -> Result<(), ShareError> {
            self.log.attached.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn replace_stream(&mut self, _stream: &MediaStream) -> Result<(), ShareError> {
            self.log.replaced.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn open_data_channel(&mut self, label: &str) -> Result<(), ShareError> {
            self.log.channels.lock().unwrap().push(label.to_string());
            Ok(())
        }
        fn send_data(&mut self, payload: &[u8]) -> Result<(), ShareError> {
            self.log.data.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
        fn close(&mut self) {
            self.log.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockHost {
        peers: Mutex<HashMap<String, Arc<MockPeerLog>>>,
        acquisitions: AtomicUsize,
    }

    impl MockHost {
        fn peer_log(&self, user_id: &str) -> Option<Arc<MockPeerLog>> {
            self.peers.lock().unwrap().get(user_id).cloned()
        }
    }

    impl MediaHost for Arc<MockHost> {
        fn acquire_display_media(&self) -> Result<MediaStream, ShareError> {
            let n = self.acquisitions.fetch_add(1, Ordering::SeqCst);
            Ok(MediaStream(format!("display-{n}")))
        }
        fn create_peer(&self, remote_user_id: &str) -> Result<Box<dyn PeerConnection>, ShareError> {
            let log = Arc::new(MockPeerLog::default());
            self.peers
                .lock()
                .unwrap()
                .insert(remote_user_id.to_string(), log.clone());
            Ok(Box::new(MockPeer { log }))
        }
    }

    fn coordinator(
        self_id: &str,
    ) -> (
        ScreenShareCoordinator,
        Arc<MockHost>,
        mpsc::UnboundedReceiver<ClientMessage>,
    ) {
        let host = Arc::new(MockHost::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator =
            ScreenShareCoordinator::new("room", self_id, Box::new(host.clone()), tx);
        (coordinator, host, rx)
    }

    fn started(user_id: &str) -> ServerMessage {
        ServerMessage::ScreenshareStarted {
            room_id: "room".into(),
            user_id: user_id.into(),
            share_name: None,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_start_sharing_defers_offers_until_echo() {
        let (mut coord, host, mut rx) = coordinator("u1");
        coord.set_members(vec!["u1".into(), "u2".into(), "u3".into()]);

        coord.start_sharing(Some("demo".into())).unwrap();
        assert_eq!(coord.role(), ShareRole::Sharer);
        assert_eq!(coord.peer_count(), 0);
        let sent = drain(&mut rx);
        assert!(matches!(sent[0], ClientMessage::ScreenshareStart { .. }));

        // Broker echo triggers one offer per other member.
        coord.handle_message(&started("u1")).unwrap();
        assert_eq!(coord.peer_count(), 2);
        let offers = drain(&mut rx);
        assert_eq!(offers.len(), 2);
        assert!(offers
            .iter()
            .all(|msg| matches!(msg, ClientMessage::RtcOffer { .. })));

        // Each peer got the stream and the annotations channel.
        let log = host.peer_log("u2").unwrap();
        assert_eq!(log.attached.load(Ordering::SeqCst), 1);
        assert_eq!(
            log.channels.lock().unwrap().as_slice(),
            &[ANNOTATION_CHANNEL.to_string()]
        );
    }

    #[test]
    fn test_second_start_replaces_tracks() {
        let (mut coord, host, mut rx) = coordinator("u1");
        coord.set_members(vec!["u1".into(), "u2".into()]);
        coord.start_sharing(None).unwrap();
        coord.handle_message(&started("u1")).unwrap();
        drain(&mut rx);

        coord.start_sharing(None).unwrap();
        // No teardown, no new signaling; the existing peer got the new track.
        assert_eq!(coord.peer_count(), 1);
        assert!(drain(&mut rx).is_empty());
        let log = host.peer_log("u2").unwrap();
        assert_eq!(log.replaced.load(Ordering::SeqCst), 1);
        assert_eq!(log.closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_other_sharer_makes_us_viewer() {
        let (mut coord, _host, _rx) = coordinator("u2");
        coord.set_members(vec!["u1".into(), "u2".into()]);
        coord.handle_message(&started("u1")).unwrap();
        assert_eq!(coord.role(), ShareRole::Viewer);
        assert_eq!(coord.sharer_id(), Some("u1"));
    }

    #[test]
    fn test_viewer_answers_offer() {
        let (mut coord, host, mut rx) = coordinator("u2");
        coord.handle_message(&started("u1")).unwrap();
        coord
            .handle_message(&ServerMessage::RtcOffer {
                room_id: "room".into(),
                from_user_id: "u1".into(),
                sdp: "offer-from-u1".into(),
            })
            .unwrap();

        let sent = drain(&mut rx);
        assert!(matches!(
            sent.as_slice(),
            [ClientMessage::RtcAnswer { target_user_id, .. }] if target_user_id == "u1"
        ));
        let log = host.peer_log("u1").unwrap();
        assert_eq!(
            log.remote_descriptions.lock().unwrap().as_slice(),
            &["offer-from-u1".to_string()]
        );
        assert_eq!(log.answers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ice_buffered_until_remote_description() {
        let (mut coord, host, mut rx) = coordinator("u2");
        coord.handle_message(&started("u1")).unwrap();

        // Candidates before any peer exists are buffered.
        for i in 0..2 {
            coord
                .handle_message(&ServerMessage::RtcIceCandidate {
                    room_id: "room".into(),
                    from_user_id: "u1".into(),
                    candidate: format!("cand-{i}"),
                    sdp_mid: None,
                    sdp_m_line_index: None,
                })
                .unwrap();
        }
        assert_eq!(coord.peer_count(), 0);

        // The offer creates the peer, sets the remote description, and
        // flushes the buffer in arrival order.
        coord
            .handle_message(&ServerMessage::RtcOffer {
                room_id: "room".into(),
                from_user_id: "u1".into(),
                sdp: "offer".into(),
            })
            .unwrap();
        drain(&mut rx);
        let log = host.peer_log("u1").unwrap();
        assert_eq!(
            log.ice.lock().unwrap().as_slice(),
            &["cand-0".to_string(), "cand-1".to_string()]
        );

        // Later candidates go straight through.
        coord
            .handle_message(&ServerMessage::RtcIceCandidate {
                room_id: "room".into(),
                from_user_id: "u1".into(),
                candidate: "cand-late".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
            })
            .unwrap();
        assert_eq!(log.ice.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_sharer_receives_answer_and_flushes_ice() {
        let (mut coord, host, mut rx) = coordinator("u1");
        coord.set_members(vec!["u1".into(), "u2".into()]);
        coord.start_sharing(None).unwrap();
        coord.handle_message(&started("u1")).unwrap();
        drain(&mut rx);

        // ICE from u2 arrives before its answer: buffered on the peer.
        coord
            .handle_message(&ServerMessage::RtcIceCandidate {
                room_id: "room".into(),
                from_user_id: "u2".into(),
                candidate: "early".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
            })
            .unwrap();
        let log = host.peer_log("u2").unwrap();
        assert!(log.ice.lock().unwrap().is_empty());

        coord
            .handle_message(&ServerMessage::RtcAnswer {
                room_id: "room".into(),
                from_user_id: "u2".into(),
                sdp: "answer".into(),
            })
            .unwrap();
        assert_eq!(log.ice.lock().unwrap().as_slice(), &["early".to_string()]);
    }

    #[test]
    fn test_late_joiner_gets_one_offer() {
        // S7: a member joining mid-share triggers exactly one extra offer.
        let (mut coord, _host, mut rx) = coordinator("u1");
        coord.set_members(vec!["u1".into(), "u2".into()]);
        coord.start_sharing(None).unwrap();
        coord.handle_message(&started("u1")).unwrap();
        drain(&mut rx);

        coord
            .handle_message(&ServerMessage::UserJoined {
                room_id: "room".into(),
                user: crate::protocol::User::new("u3", "Third"),
            })
            .unwrap();
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            ClientMessage::RtcOffer { target_user_id, .. } if target_user_id == "u3"
        ));
        assert_eq!(coord.peer_count(), 2);
    }

    #[test]
    fn test_sharer_leaving_resets_viewers() {
        let (mut coord, _host, mut rx) = coordinator("u2");
        coord.set_members(vec!["u1".into(), "u2".into()]);
        coord.handle_message(&started("u1")).unwrap();
        coord
            .handle_message(&ServerMessage::RtcOffer {
                room_id: "room".into(),
                from_user_id: "u1".into(),
                sdp: "offer".into(),
            })
            .unwrap();
        drain(&mut rx);
        coord.handle_remote_stream("u1", MediaStream("remote".into()));
        assert!(coord.remote_stream_of("u1").is_some());

        coord
            .handle_message(&ServerMessage::UserLeft {
                room_id: "room".into(),
                user_id: "u1".into(),
            })
            .unwrap();
        assert_eq!(coord.role(), ShareRole::Idle);
        assert_eq!(coord.peer_count(), 0);
        assert!(coord.remote_stream_of("u1").is_none());
        assert_eq!(coord.sharer_id(), None);
    }

    #[test]
    fn test_screenshare_stopped_resets() {
        let (mut coord, host, mut rx) = coordinator("u2");
        coord.handle_message(&started("u1")).unwrap();
        coord
            .handle_message(&ServerMessage::RtcOffer {
                room_id: "room".into(),
                from_user_id: "u1".into(),
                sdp: "offer".into(),
            })
            .unwrap();
        drain(&mut rx);

        coord
            .handle_message(&ServerMessage::ScreenshareStopped {
                room_id: "room".into(),
                user_id: "u1".into(),
            })
            .unwrap();
        assert_eq!(coord.role(), ShareRole::Idle);
        assert_eq!(host.peer_log("u1").unwrap().closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remote_control_flow() {
        let (mut coord, _host, mut rx) = coordinator("u1");
        coord.set_members(vec!["u1".into(), "u2".into(), "u3".into()]);
        coord.start_sharing(None).unwrap();
        coord.handle_message(&started("u1")).unwrap();
        drain(&mut rx);

        // Two viewers request control.
        for viewer in ["u2", "u3"] {
            coord
                .handle_message(&ServerMessage::RemoteControlRequest {
                    room_id: "room".into(),
                    from_user_id: viewer.into(),
                })
                .unwrap();
        }
        assert_eq!(coord.pending_control_requests().len(), 2);

        coord.respond_control("u2", true).unwrap();
        assert_eq!(coord.control_granted_to(), Some("u2"));
        assert_eq!(coord.pending_control_requests().len(), 1);

        coord.respond_control("u3", false).unwrap();
        assert!(coord.pending_control_requests().is_empty());

        coord.revoke_control().unwrap();
        assert_eq!(coord.control_granted_to(), None);

        let sent = drain(&mut rx);
        let grants: Vec<bool> = sent
            .iter()
            .filter_map(|msg| match msg {
                ClientMessage::RemoteControlResponse { granted, .. } => Some(*granted),
                _ => None,
            })
            .collect();
        assert_eq!(grants, vec![true, false, false]);
    }

    #[test]
    fn test_control_request_cleared_when_viewer_leaves() {
        let (mut coord, _host, mut rx) = coordinator("u1");
        coord.set_members(vec!["u1".into(), "u2".into()]);
        coord.start_sharing(None).unwrap();
        coord.handle_message(&started("u1")).unwrap();
        coord
            .handle_message(&ServerMessage::RemoteControlRequest {
                room_id: "room".into(),
                from_user_id: "u2".into(),
            })
            .unwrap();
        coord.respond_control("u2", true).unwrap();
        drain(&mut rx);

        coord
            .handle_message(&ServerMessage::UserLeft {
                room_id: "room".into(),
                user_id: "u2".into(),
            })
            .unwrap();
        assert!(coord.pending_control_requests().is_empty());
        assert_eq!(coord.control_granted_to(), None);
    }

    #[test]
    fn test_viewer_control_grant_state() {
        let (mut coord, _host, _rx) = coordinator("u2");
        coord.handle_message(&started("u1")).unwrap();
        assert!(!coord.has_control());

        coord
            .handle_message(&ServerMessage::RemoteControlResponse {
                room_id: "room".into(),
                from_user_id: "u1".into(),
                granted: true,
            })
            .unwrap();
        assert!(coord.has_control());

        coord
            .handle_message(&ServerMessage::RemoteControlResponse {
                room_id: "room".into(),
                from_user_id: "u1".into(),
                granted: false,
            })
            .unwrap();
        assert!(!coord.has_control());
    }

    #[test]
    fn test_annotation_payload_roundtrip() {
        let (mut coord, host, mut rx) = coordinator("u1");
        coord.set_members(vec!["u1".into(), "u2".into()]);
        coord.start_sharing(None).unwrap();
        coord.handle_message(&started("u1")).unwrap();
        drain(&mut rx);

        let annotation = coord
            .send_annotation("#ff4040", vec![Point::new(0.25, 0.75), Point::new(1.5, -0.5)])
            .unwrap();
        // Points clamp to the normalized viewport.
        assert_eq!(annotation.points[1], Point { x: 1.0, y: 0.0 });
        assert_eq!(coord.annotations().len(), 1);

        let sent = host.peer_log("u2").unwrap().data.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        match decode_payload(&sent[0]).unwrap() {
            ChannelPayload::Annotation(received) => {
                assert_eq!(received.id, annotation.id);
                assert_eq!(received.author_id, "u1");
                assert_eq!(received.color, "#ff4040");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_cursor_and_clear_payloads() {
        let (mut coord, _host, _rx) = coordinator("u2");
        let cursor = encode_payload(&ChannelPayload::Cursor {
            user_id: "u3".into(),
            x: 0.5,
            y: 0.5,
        })
        .unwrap();
        coord.ingest_payload(&cursor).unwrap();
        assert_eq!(coord.cursor_of("u3"), Some(Point { x: 0.5, y: 0.5 }));

        let annotation = encode_payload(&ChannelPayload::Annotation(Annotation::new(
            "u3",
            "#00ff00",
            vec![Point::new(0.1, 0.2)],
        )))
        .unwrap();
        coord.ingest_payload(&annotation).unwrap();
        assert_eq!(coord.annotations().len(), 1);

        let clear = encode_payload(&ChannelPayload::ClearAnnotations {
            author_id: "u3".into(),
        })
        .unwrap();
        coord.ingest_payload(&clear).unwrap();
        assert!(coord.annotations().is_empty());

        assert!(coord.ingest_payload(b"not json").is_err());
    }

    #[test]
    fn test_stop_sharing_requires_sharing() {
        let (mut coord, _host, _rx) = coordinator("u1");
        assert!(matches!(coord.stop_sharing(), Err(ShareError::NotSharing)));
    }

    #[test]
    fn test_messages_for_other_rooms_ignored() {
        let (mut coord, _host, _rx) = coordinator("u2");
        coord
            .handle_message(&ServerMessage::ScreenshareStarted {
                room_id: "elsewhere".into(),
                user_id: "u1".into(),
                share_name: None,
            })
            .unwrap();
        assert_eq!(coord.role(), ShareRole::Idle);
        assert_eq!(coord.sharer_id(), None);
    }
}
