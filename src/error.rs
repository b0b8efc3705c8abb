//! Error type for the parts of the crate that sit outside the
//! transport-agnostic engine: URL/query construction, the
//! `tokio-tungstenite` transport, and the `reqwest` broadcast HTTP
//! fallback. Follows the teacher's `RealtimeError` in
//! `crates/realtime/src/error.rs` — one variant per failure mode, with
//! `#[from]` conversions at the boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The protocol engine reported a failure (bad frame, subscription
    /// mismatch, channel/transport error already classified by the core).
    #[error(transparent)]
    Core(#[from] phoenix_realtime_core::Error),

    /// The WebSocket connection failed at the `tokio-tungstenite` layer.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The configured endpoint could not be parsed into a URL.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// The endpoint's URL was structurally valid but unusable (bad scheme).
    #[error("configuration error: {0}")]
    Config(String),

    /// The `reqwest`-backed broadcast HTTP fallback failed to send.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encoding/decoding outside the core's own codec.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
