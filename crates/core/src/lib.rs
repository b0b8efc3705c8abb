//! Transport-agnostic protocol engine for Phoenix-style realtime channels:
//! multiplexed broadcast/presence/Postgres-changes subscriptions over a
//! single socket, with join/leave handshaking, push/reply correlation,
//! reconnect backoff, and a presence CRDT.
//!
//! This crate has no opinion about how bytes reach the server — see
//! [`Transport`] and [`Connector`]. A concrete `tokio-tungstenite`
//! implementation lives in the `phoenix-realtime` crate that wraps this
//! one.

mod backoff;
mod channel;
mod client;
mod codec;
mod error;
mod filters;
mod message;
mod presence;
mod push;
mod transport;

pub use backoff::{default_delay_fn, BackoffTimer, DelayFn};
pub use channel::{Channel, ChannelClient, ChannelState, JoinConfig, MAX_PUSH_BUFFER_SIZE};
pub use client::{
    AccessTokenProvider, Client, ClientOptions, ConnectionState, HeartbeatStatus,
};
pub use codec::{decode, encode, WireData};
pub use error::Error;
pub use filters::PostgresChangesFilter;
pub use message::{
    ChannelPayload, Frame, FramePayload, PostgresChangePayload, PresenceDiffMsg, PresenceMeta,
    PresenceStateMap, ReplyStatus, SubscribeStatus, ACCESS_TOKEN_EVENT, HEARTBEAT_EVENT,
    HEARTBEAT_TOPIC, PHX_CLOSE, PHX_ERROR, PHX_JOIN, PHX_LEAVE, PHX_REPLY, PRESENCE_DIFF,
    PRESENCE_STATE, VSN,
};
pub use presence::Presence;
pub use push::{Push, PushSink};
pub use transport::{BroadcastFallback, Connector, Transport, TransportEvent};
