//! WebSocket endpoint construction (§6 "WebSocket URL"): append
//! `/websocket` to the configured endpoint and attach the protocol
//! version plus whatever the caller wants forwarded as query params.
//! Grounded in the teacher's `RealtimeClient::connect()` URL assembly in
//! `crates/realtime/src/client.rs`, generalized so params are recomputed
//! on every call instead of baked in once.

use url::Url;

use crate::error::Error;

pub const WIRE_PROTOCOL_VERSION: &str = "1.0.0";

/// Builds the `ws(s)://.../realtime/v1/websocket?...` URL a [`Connector`]
/// dials on every (re)connect attempt.
///
/// `endpoint` is the project's HTTP(S) base URL (e.g.
/// `https://example.supabase.co`); `api_key` becomes the `apikey` query
/// param; `params` are additional query params forwarded verbatim
/// (closed over by the caller so they can change across reconnects, per
/// §6's "`params` may be a callable for per-connect refresh").
pub fn build_websocket_url(
    endpoint: &str,
    api_key: &str,
    params: &[(String, String)],
) -> Result<Url, Error> {
    let base = Url::parse(endpoint).map_err(Error::Url)?;
    let scheme = match base.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => base.scheme(),
        other => return Err(Error::Config(format!("unsupported URL scheme: {other}"))),
    };

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| Error::Config(format!("cannot use scheme {scheme} with this URL")))?;
    url.set_path("/realtime/v1/websocket");

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        query.append_pair("apikey", api_key);
        query.append_pair("vsn", WIRE_PROTOCOL_VERSION);
        for (key, value) in params {
            query.append_pair(key, value);
        }
    }

    Ok(url)
}

/// Rewrites a project endpoint to the `http(s)` base the broadcast
/// fallback POSTs against (§6 "Broadcast HTTP fallback"), undoing a
/// `ws`/`wss` scheme if the caller configured one.
pub fn http_base_url(endpoint: &str) -> Result<Url, Error> {
    let mut url = Url::parse(endpoint).map_err(Error::Url)?;
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        "http" | "https" => return Ok(url),
        other => return Err(Error::Config(format!("unsupported URL scheme: {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::Config(format!("cannot use scheme {scheme} with this URL")))?;
    Ok(url)
}
