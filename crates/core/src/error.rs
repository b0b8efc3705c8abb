//! Error types for the realtime protocol engine.

use thiserror::Error;

/// Errors surfaced by the protocol engine.
///
/// Per the engine's propagation policy, most of these are recorded and
/// logged internally rather than returned to callers — they exist so
/// internal plumbing (the codec, the push/channel state machines) has a
/// typed way to fail. `subscribe`/`send`/`push` callers only ever see
/// [`Error::SubscriptionMismatch`] and [`Error::HookContractViolation`]
/// synchronously; everything else is delivered through the status
/// callbacks described in the channel and push contracts.
#[derive(Error, Debug)]
pub enum Error {
    /// A frame could not be decoded: unknown binary `kind`, a declared
    /// length reading past end-of-buffer, or a malformed JSON 5-tuple.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// The postgres_changes bindings a channel joined with did not match,
    /// index for index, the server's list of assigned ids in the join reply.
    #[error("subscription mismatch: {0}")]
    SubscriptionMismatch(String),

    /// A user-supplied `on_message` hook returned nothing for a non-empty
    /// payload, violating its contract.
    #[error("on_message hook returned no payload for a non-empty message")]
    HookContractViolation,

    /// The underlying transport failed to send or could not be constructed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A channel operation was attempted in a state that forbids it.
    #[error("channel error: {0}")]
    Channel(String),

    /// JSON serialization or deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
