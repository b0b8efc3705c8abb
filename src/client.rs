//! The facade entry point: wires the protocol engine in
//! `phoenix_realtime_core` to the concrete `tokio-tungstenite` transport
//! and `reqwest` broadcast fallback defined in this crate. Grounded in
//! the teacher's `RealtimeClient::new`/`new_with_options` constructor
//! pair in `crates/realtime/src/client.rs`.

use std::sync::Arc;

use phoenix_realtime_core::{Channel, Client as CoreClient, ConnectionState};

use crate::broadcast_http::BroadcastHttpFallback;
use crate::config::RealtimeClientOptions;
use crate::error::Error;
use crate::transport::TungsteniteConnector;

/// A client library that multiplexes channels over a Phoenix-style
/// realtime websocket, with the default production collaborators
/// already wired: `tokio-tungstenite` for the socket, `reqwest` for the
/// broadcast HTTP fallback.
pub struct RealtimeClient {
    inner: Arc<CoreClient>,
    broadcast_fallback: Arc<BroadcastHttpFallback>,
}

impl RealtimeClient {
    /// Creates a client with default options. `endpoint` is the
    /// project's base URL, e.g. `https://example.supabase.co`.
    pub fn new(endpoint: &str, api_key: &str) -> Result<Self, Error> {
        Self::new_with_options(endpoint, api_key, RealtimeClientOptions::default())
    }

    pub fn new_with_options(
        endpoint: &str,
        api_key: &str,
        options: RealtimeClientOptions,
    ) -> Result<Self, Error> {
        let connector = Arc::new(TungsteniteConnector::new(endpoint, api_key, options.clone()));
        let inner = CoreClient::new(connector, options.engine.clone());
        let broadcast_fallback = Arc::new(BroadcastHttpFallback::new(endpoint, api_key)?);

        Ok(Self { inner, broadcast_fallback })
    }

    /// Opens the socket. No-op if already connected. The broadcast HTTP
    /// fallback is wired on the first call, since `set_broadcast_fallback`
    /// is async and this is the first async entry point a caller reaches
    /// after construction.
    pub async fn connect(&self) -> Result<(), Error> {
        let fallback: Arc<dyn phoenix_realtime_core::BroadcastFallback> =
            self.broadcast_fallback.clone();
        self.inner.set_broadcast_fallback(fallback).await;
        self.inner.connect().await.map_err(Error::Core)
    }

    /// Closes the socket with no automatic reconnect.
    pub async fn disconnect(&self, code: u16, reason: &str) {
        self.inner.disconnect(code, reason).await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state().await
    }

    /// Creates (or replaces, per the engine's single-topic rule) a
    /// channel for `topic`.
    pub async fn channel(&self, topic: impl Into<String>) -> Arc<Channel> {
        self.inner.channel(topic).await
    }

    /// Installs a provider the engine asks for a fresh token on
    /// reconnect and on a schedule; failures fall back to the
    /// last-known token (§7 "Token-provider failures").
    pub async fn set_access_token_provider(
        &self,
        provider: Arc<dyn phoenix_realtime_core::AccessTokenProvider>,
    ) {
        self.inner.set_access_token_provider(provider).await;
    }

    /// Sets a static access token used both by the socket (re-announced
    /// to every joined channel via the `access_token` event) and by the
    /// broadcast HTTP fallback's `Authorization` header.
    pub async fn set_access_token(&self, token: Option<String>) {
        self.broadcast_fallback.set_access_token(token.clone());
        self.inner.set_auth(token).await;
    }

    /// The underlying transport-agnostic engine, for callers who need
    /// direct access to lifecycle hooks (`on_open`/`on_close`/`on_error`)
    /// not re-exposed on this facade.
    pub fn core(&self) -> &Arc<CoreClient> {
        &self.inner
    }
}
