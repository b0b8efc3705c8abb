//! The wire-level [`Frame`] type and the typed payloads dispatched to
//! user callbacks.

use serde_json::Value;

/// Topic reserved for client/server heartbeats.
pub const HEARTBEAT_TOPIC: &str = "phoenix";
/// Event name for heartbeats, sent on [`HEARTBEAT_TOPIC`].
pub const HEARTBEAT_EVENT: &str = "heartbeat";
/// Event used to push a refreshed access token to the server.
pub const ACCESS_TOKEN_EVENT: &str = "access_token";

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";
pub const PHX_CLOSE: &str = "phx_close";
pub const PHX_ERROR: &str = "phx_error";
pub const PHX_REPLY: &str = "phx_reply";
pub const PRESENCE_STATE: &str = "presence_state";
pub const PRESENCE_DIFF: &str = "presence_diff";

/// Wire protocol version appended to the websocket URL's `vsn` parameter.
pub const VSN: &str = "1.0.0";

/// The payload carried by a [`Frame`]. JSON frames carry structured
/// values; frames whose payload is a raw byte buffer are encoded/decoded
/// through the compact binary form instead (§4.B).
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    Json(Value),
    /// Raw bytes, carried by a push or broadcast frame.
    Binary(Vec<u8>),
    /// A reply whose response was carried as raw bytes on the wire.
    BinaryReply { status: String, response: Vec<u8> },
}

impl FramePayload {
    pub fn as_json(&self) -> Value {
        match self {
            FramePayload::Json(v) => v.clone(),
            FramePayload::Binary(b) => Value::Array(b.iter().map(|x| Value::from(*x)).collect()),
            FramePayload::BinaryReply { status, response } => serde_json::json!({
                "status": status,
                "response": response,
            }),
        }
    }

    pub fn status(&self) -> Option<&str> {
        match self {
            FramePayload::Json(Value::Object(map)) => map.get("status").and_then(Value::as_str),
            FramePayload::BinaryReply { status, .. } => Some(status),
            _ => None,
        }
    }
}

/// The unit of exchange with the server (§3 Data model).
///
/// Invariant: a reply frame carries the same `ref_` as the request it
/// answers.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Identifies a channel's current join generation. Absent on
    /// server-originated pushes (broadcasts, presence diffs, ...).
    pub join_ref: Option<String>,
    /// Identifies a specific request/reply pair. Absent on broadcasts.
    pub ref_: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: FramePayload,
}

impl Frame {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            join_ref: None,
            ref_: None,
            topic: topic.into(),
            event: event.into(),
            payload: FramePayload::Json(payload),
        }
    }

    pub fn with_ref(mut self, ref_: impl Into<String>) -> Self {
        self.ref_ = Some(ref_.into());
        self
    }

    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    pub fn is_reply(&self) -> bool {
        self.event == PHX_REPLY
    }
}

/// One CRDT presence record. Must carry a unique `presence_ref`.
pub type PresenceMeta = Value;

/// `presence_ref` extraction, shared by [`crate::presence::Presence`] and
/// tests.
pub fn presence_ref(meta: &PresenceMeta) -> Option<&str> {
    meta.get("presence_ref").and_then(Value::as_str)
}

/// A snapshot of presence state: key -> non-empty ordered list of metas.
pub type PresenceStateMap = std::collections::HashMap<String, Vec<PresenceMeta>>;

/// A presence diff message: joins/leaves keyed by presence key.
#[derive(Debug, Clone, Default)]
pub struct PresenceDiffMsg {
    pub joins: PresenceStateMap,
    pub leaves: PresenceStateMap,
}

/// A transformed postgres_changes payload, built by [`crate::channel`]'s
/// event router before it reaches a user callback.
#[derive(Debug, Clone)]
pub struct PostgresChangePayload {
    pub schema: String,
    pub table: String,
    pub commit_timestamp: Option<String>,
    pub event_type: String,
    pub errors: Option<Value>,
    pub new: Value,
    pub old: Value,
}

/// The typed payload handed to a channel's user callbacks (design note:
/// "Dynamic listeners" — a sum type the dispatcher narrows before
/// invoking a typed handler).
#[derive(Debug, Clone)]
pub enum ChannelPayload {
    Broadcast(Value),
    PresenceState(PresenceStateMap),
    PresenceDiff(PresenceDiffMsg),
    PostgresChange(PostgresChangePayload),
    System(Value),
}

/// User-visible channel subscribe statuses (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStatus {
    Subscribed,
    TimedOut,
    Closed,
    ChannelError,
}

/// Terminal status of a [`crate::push::Push`] or a `send`/`unsubscribe`
/// call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyStatus {
    Ok,
    Error,
    Timeout,
}

impl ReplyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Error => "error",
            ReplyStatus::Timeout => "timeout",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "ok" => ReplyStatus::Ok,
            "timeout" => ReplyStatus::Timeout,
            _ => ReplyStatus::Error,
        }
    }
}
