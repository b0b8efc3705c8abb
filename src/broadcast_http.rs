//! The `reqwest`-backed broadcast HTTP fallback (§6 "Broadcast HTTP
//! fallback"): used when a channel sends a broadcast while it isn't
//! pushable. Grounded in the teacher's `FunctionsClient` in
//! `crates/functions/src/lib.rs` — same `reqwest::Client`, same
//! `apikey`/`Authorization: Bearer` header pair, same
//! `path_segments_mut` URL building.

use std::time::Duration;

use phoenix_realtime_core::{BroadcastFallback, ReplyStatus};
use reqwest::StatusCode;
use serde_json::json;
use tracing::warn;
use url::Url;

use crate::transport::DEFAULT_FETCH_TIMEOUT;
use crate::url::http_base_url;

/// Posts `{"messages":[{"topic","event","payload","private"}]}` to
/// `<endpoint>/api/broadcast`, per §6.
pub struct BroadcastHttpFallback {
    http_client: reqwest::Client,
    base_url: Url,
    api_key: String,
    access_token: std::sync::Mutex<Option<String>>,
    timeout: Duration,
}

impl BroadcastHttpFallback {
    pub fn new(endpoint: &str, api_key: impl Into<String>) -> Result<Self, crate::error::Error> {
        Ok(Self {
            http_client: reqwest::Client::new(),
            base_url: http_base_url(endpoint)?,
            api_key: api_key.into(),
            access_token: std::sync::Mutex::new(None),
            timeout: DEFAULT_FETCH_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Kept in sync with the Client's own access token so the fallback
    /// path authenticates the same way the socket does.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.lock().unwrap() = token;
    }

    fn broadcast_url(&self) -> Result<Url, crate::error::Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| crate::error::Error::Config("broadcast endpoint is not a base URL".into()))?
            .push("api")
            .push("broadcast");
        Ok(url)
    }
}

#[async_trait::async_trait]
impl BroadcastFallback for BroadcastHttpFallback {
    async fn post_broadcast(
        &self,
        sub_topic: &str,
        event: &str,
        payload: serde_json::Value,
        private: bool,
    ) -> ReplyStatus {
        let url = match self.broadcast_url() {
            Ok(url) => url,
            Err(error) => {
                warn!(%error, "could not build broadcast fallback URL");
                return ReplyStatus::Error;
            }
        };

        let body = json!({
            "messages": [{
                "topic": sub_topic,
                "event": event,
                "payload": payload,
                "private": private,
            }],
        });

        let token = self.access_token.lock().unwrap().clone();
        let mut request = self
            .http_client
            .post(url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .header("apikey", &self.api_key)
            .json(&body);
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        match request.send().await {
            Ok(response) if response.status() == StatusCode::OK => ReplyStatus::Ok,
            Ok(response) => {
                warn!(status = %response.status(), "broadcast fallback rejected");
                ReplyStatus::Error
            }
            Err(error) if error.is_timeout() => ReplyStatus::Timeout,
            Err(error) => {
                warn!(%error, "broadcast fallback request failed");
                ReplyStatus::Error
            }
        }
    }
}
