//! `phoenix-realtime`: a client library that multiplexes broadcast,
//! presence, and Postgres change-data-capture channels over a single
//! Phoenix-style realtime websocket, with reconnect backoff and
//! push/reply correlation.
//!
//! The protocol engine — connection lifecycle, channel state machine,
//! push/reply correlation, presence CRDT, wire codec — lives in
//! [`phoenix_realtime_core`] and knows nothing about networking. This
//! crate supplies the collaborators that engine is built against: a
//! `tokio-tungstenite` [`Transport`](phoenix_realtime_core::Transport),
//! a `reqwest`-backed broadcast HTTP fallback, and WebSocket URL
//! construction — then wires them together behind [`RealtimeClient`].

pub mod broadcast_http;
pub mod client;
pub mod config;
pub mod error;
pub mod transport;
pub mod url;

pub use client::RealtimeClient;
pub use config::RealtimeClientOptions;
pub use error::Error;

pub use phoenix_realtime_core::{
    AccessTokenProvider, Channel, ChannelPayload, ChannelState, ConnectionState, HeartbeatStatus,
    PostgresChangePayload, PostgresChangesFilter, Presence, PresenceDiffMsg, PresenceMeta,
    PresenceStateMap, ReplyStatus, SubscribeStatus,
};

/// A convenience module for common imports.
pub mod prelude {
    pub use crate::{Error, RealtimeClient, RealtimeClientOptions};
    pub use phoenix_realtime_core::{
        Channel, ChannelPayload, ChannelState, ConnectionState, PostgresChangePayload,
        PostgresChangesFilter, ReplyStatus, SubscribeStatus,
    };
}
