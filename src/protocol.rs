//! JSON wire protocol: message envelopes, error codes, and the bounded codec.
//!
//! Every frame is a single JSON object with a `type` discriminator.
//! The codec enforces the 1 MiB message bound on both encode and decode,
//! and every embedded operation, snapshot, and presence payload is run
//! through structural validation before it reaches a handler.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;

use crate::crdt::map::MapSnapshot;
use crate::crdt::{Operation, VersionVector};
use crate::validate::{self, ValidateError, MAX_MESSAGE_SIZE, MAX_PRESENCE_SIZE};

/// Maximum positional arguments per function call.
pub const MAX_CALL_ARGS: usize = 100;
/// Maximum SDP payload size (64 KiB).
pub const MAX_SDP_SIZE: usize = 64 * 1024;
/// Maximum ICE candidate payload size.
pub const MAX_CANDIDATE_SIZE: usize = 4096;

/// A participant as seen by the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: JsonMap<String, Value>,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            metadata: JsonMap::new(),
        }
    }

    fn validate(&self) -> Result<(), ValidateError> {
        validate::check_value(&Value::Object(self.metadata.clone()))
    }
}

/// Messages a client sends to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
    },
    Join {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_info: Option<User>,
    },
    Leave {
        room_id: String,
    },
    Operation {
        room_id: String,
        operation: Operation,
    },
    SyncRequest {
        room_id: String,
        #[serde(default)]
        since_timestamp: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_vector: Option<VersionVector>,
    },
    Call {
        room_id: String,
        call_id: String,
        function_name: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: JsonMap<String, Value>,
    },
    Presence {
        room_id: String,
        data: JsonMap<String, Value>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    ScreenshareStart {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        share_name: Option<String>,
    },
    ScreenshareStop {
        room_id: String,
    },
    RtcOffer {
        room_id: String,
        target_user_id: String,
        sdp: String,
    },
    RtcAnswer {
        room_id: String,
        target_user_id: String,
        sdp: String,
    },
    RtcIceCandidate {
        room_id: String,
        target_user_id: String,
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_m_line_index: Option<u32>,
    },
    RemoteControlRequest {
        room_id: String,
        target_user_id: String,
    },
    RemoteControlResponse {
        room_id: String,
        target_user_id: String,
        granted: bool,
    },
}

/// Messages the broker sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Authenticated {
        user_id: String,
    },
    Joined {
        room_id: String,
        user_id: String,
        users: Vec<User>,
        state: MapSnapshot,
    },
    Operation {
        room_id: String,
        user_id: String,
        operation: Operation,
    },
    Sync {
        room_id: String,
        state: MapSnapshot,
        #[serde(default)]
        operations: Vec<Operation>,
        #[serde(default)]
        version_vector: VersionVector,
    },
    CallResult {
        call_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Presence {
        room_id: String,
        user_id: String,
        data: JsonMap<String, Value>,
    },
    UserJoined {
        room_id: String,
        user: User,
    },
    UserLeft {
        room_id: String,
        user_id: String,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    Ping,
    Pong {
        timestamp: f64,
    },
    ScreenshareStarted {
        room_id: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        share_name: Option<String>,
    },
    ScreenshareStopped {
        room_id: String,
        user_id: String,
    },
    RtcOffer {
        room_id: String,
        from_user_id: String,
        sdp: String,
    },
    RtcAnswer {
        room_id: String,
        from_user_id: String,
        sdp: String,
    },
    RtcIceCandidate {
        room_id: String,
        from_user_id: String,
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_m_line_index: Option<u32>,
    },
    RemoteControlRequest {
        room_id: String,
        from_user_id: String,
    },
    RemoteControlResponse {
        room_id: String,
        from_user_id: String,
        granted: bool,
    },
}

/// Protocol-level error codes carried in `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthenticationFailed,
    PermissionDenied,
    RoomNotFound,
    InvalidMessage,
    InvalidOperation,
    FunctionNotFound,
    FunctionError,
    RateLimited,
    InternalError,
}

/// Codec failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error(transparent)]
    Invalid(#[from] ValidateError),
    #[error("invalid function name '{0}'")]
    BadFunctionName(String),
    #[error("too many call arguments ({0})")]
    TooManyArgs(usize),
    #[error("field '{field}' of {size} bytes exceeds limit of {limit}")]
    FieldTooLarge {
        field: &'static str,
        size: usize,
        limit: usize,
    },
}

/// Function names must match `^[A-Za-z_][A-Za-z0-9_]*$`.
pub fn is_valid_function_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn check_presence_data(data: &JsonMap<String, Value>) -> Result<(), ProtocolError> {
    let size = validate::serialized_size(&Value::Object(data.clone()));
    if size > MAX_PRESENCE_SIZE {
        return Err(ProtocolError::FieldTooLarge {
            field: "data",
            size,
            limit: MAX_PRESENCE_SIZE,
        });
    }
    for (key, value) in data {
        if validate::is_blocked_key(key) {
            return Err(ValidateError::DangerousKey(key.clone()).into());
        }
        validate::check_value(value)?;
    }
    Ok(())
}

impl ClientMessage {
    /// Structural validation run on every encode and decode.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ClientMessage::Operation { operation, .. } => {
                operation.validate()?;
            }
            ClientMessage::Presence { data, .. } => {
                check_presence_data(data)?;
            }
            ClientMessage::Call {
                function_name,
                args,
                kwargs,
                ..
            } => {
                if !is_valid_function_name(function_name) {
                    return Err(ProtocolError::BadFunctionName(function_name.clone()));
                }
                if args.len() > MAX_CALL_ARGS {
                    return Err(ProtocolError::TooManyArgs(args.len()));
                }
                for arg in args {
                    validate::check_value(arg)?;
                }
                for (key, value) in kwargs {
                    if validate::is_blocked_key(key) {
                        return Err(ValidateError::DangerousKey(key.clone()).into());
                    }
                    validate::check_value(value)?;
                }
            }
            ClientMessage::Join { user_info, .. } => {
                if let Some(user) = user_info {
                    user.validate()?;
                }
            }
            ClientMessage::RtcOffer { sdp, .. } | ClientMessage::RtcAnswer { sdp, .. } => {
                if sdp.len() > MAX_SDP_SIZE {
                    return Err(ProtocolError::FieldTooLarge {
                        field: "sdp",
                        size: sdp.len(),
                        limit: MAX_SDP_SIZE,
                    });
                }
            }
            ClientMessage::RtcIceCandidate { candidate, .. } => {
                if candidate.len() > MAX_CANDIDATE_SIZE {
                    return Err(ProtocolError::FieldTooLarge {
                        field: "candidate",
                        size: candidate.len(),
                        limit: MAX_CANDIDATE_SIZE,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl ServerMessage {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ServerMessage::Operation { operation, .. } => {
                operation.validate()?;
            }
            ServerMessage::Joined { state, .. } => {
                state.validate()?;
            }
            ServerMessage::Sync {
                state, operations, ..
            } => {
                state.validate()?;
                for op in operations {
                    op.validate()?;
                }
            }
            ServerMessage::Presence { data, .. } => {
                check_presence_data(data)?;
            }
            _ => {}
        }
        Ok(())
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    let raw = serde_json::to_string(msg).map_err(|e| ProtocolError::Json(e.to_string()))?;
    if raw.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: raw.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }
    Ok(raw)
}

pub fn encode_client(msg: &ClientMessage) -> Result<String, ProtocolError> {
    msg.validate()?;
    encode(msg)
}

pub fn decode_client(raw: &str) -> Result<ClientMessage, ProtocolError> {
    if raw.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: raw.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }
    let msg: ClientMessage =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Json(e.to_string()))?;
    msg.validate()?;
    Ok(msg)
}

pub fn encode_server(msg: &ServerMessage) -> Result<String, ProtocolError> {
    msg.validate()?;
    encode(msg)
}

pub fn decode_server(raw: &str) -> Result<ServerMessage, ProtocolError> {
    if raw.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: raw.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }
    let msg: ServerMessage =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Json(e.to_string()))?;
    msg.validate()?;
    Ok(msg)
}
