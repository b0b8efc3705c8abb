//! The transport interface the engine is built against (§6). Concrete
//! implementations — a `tokio-tungstenite` socket, an in-memory fake for
//! tests — live outside this crate.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::codec::WireData;
use crate::message::ReplyStatus;

/// Events a transport reports back to the [`crate::client::Client`]
/// that owns it.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    Message(WireData),
    Error(String),
    Close { code: u16, reason: String },
}

/// What the engine needs from an underlying socket: send, close, and an
/// event stream. The core never assumes anything else about it (§6).
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, data: WireData) -> Result<(), String>;
    async fn close(&self, code: u16, reason: &str);
}

/// Builds a fresh [`Transport`] plus its event stream on every
/// `connect()`/reconnect attempt. The `url`/`params`/`headers` options of
/// §6 are resolved here, outside the core, so params can be recomputed
/// on every call as the spec requires.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(std::sync::Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), String>;
}

/// The broadcast HTTP fallback collaborator (§6): posts a broadcast
/// message over HTTP when the channel isn't pushable. Implemented with
/// `reqwest` in the root crate.
#[async_trait::async_trait]
pub trait BroadcastFallback: Send + Sync {
    async fn post_broadcast(&self, sub_topic: &str, event: &str, payload: Value, private: bool) -> ReplyStatus;
}
