//! Connection-level configuration (§6 "Configuration (recognized
//! options)"): the options that belong to the concrete transport and
//! HTTP fallback rather than to the protocol engine, which has its own
//! [`phoenix_realtime_core::ClientOptions`]. Named after the teacher's
//! `RealtimeClientOptions` in `crates/realtime/src/client.rs`, with
//! `new`/`with_*` builder methods in the same style.

use std::collections::HashMap;
use std::sync::Arc;

use phoenix_realtime_core::ClientOptions;

/// A `(key, value)` param list recomputed on every connect attempt, so
/// a refreshed token or timestamp can be folded in without reconnecting
/// through stale state (§6: "`params` may be a callable for per-connect
/// refresh").
pub trait ParamsProvider: Send + Sync {
    fn params(&self) -> Vec<(String, String)>;
}

impl<F> ParamsProvider for F
where
    F: Fn() -> Vec<(String, String)> + Send + Sync,
{
    fn params(&self) -> Vec<(String, String)> {
        (self)()
    }
}

/// Construction-time options for [`crate::RealtimeClient`].
#[derive(Clone)]
pub struct RealtimeClientOptions {
    /// Extra headers forwarded to the WebSocket handshake and to the
    /// broadcast HTTP fallback request.
    pub headers: HashMap<String, String>,

    /// Extra query params appended to the WebSocket URL on every
    /// connect attempt, beyond `apikey`/`vsn`.
    pub params: Option<Arc<dyn ParamsProvider>>,

    /// Protocol-engine options (timeouts, heartbeat interval, reconnect
    /// backoff, log level) — passed straight through to
    /// [`phoenix_realtime_core::Client::new`].
    pub engine: ClientOptions,
}

impl std::fmt::Debug for RealtimeClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClientOptions")
            .field("headers", &self.headers)
            .field("params", &self.params.is_some())
            .finish()
    }
}

impl Default for RealtimeClientOptions {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            params: None,
            engine: ClientOptions::default(),
        }
    }
}

impl RealtimeClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_params(mut self, provider: impl ParamsProvider + 'static) -> Self {
        self.params = Some(Arc::new(provider));
        self
    }

    pub fn with_engine_options(mut self, engine: ClientOptions) -> Self {
        self.engine = engine;
        self
    }

    pub(crate) fn resolved_params(&self) -> Vec<(String, String)> {
        self.params.as_ref().map(|p| p.params()).unwrap_or_default()
    }
}
