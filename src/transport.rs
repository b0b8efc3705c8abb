//! The production [`Transport`]/[`Connector`]: a real `tokio-tungstenite`
//! socket. Grounded in the teacher's `RealtimeClient::connect()` in
//! `crates/realtime/src/client.rs` — same `connect_async`, same
//! writer-task/reader-task split over an `mpsc` channel — adapted to
//! report state back as [`TransportEvent`]s instead of mutating client
//! fields directly, since the engine that owns this transport lives in
//! a separate, transport-agnostic crate.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use phoenix_realtime_core::{Connector, Transport, TransportEvent, WireData};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::config::RealtimeClientOptions;
use crate::error::Error;
use crate::url::build_websocket_url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Wraps the sink half of a live socket. The read half is drained by a
/// background task spawned from [`TungsteniteConnector::connect`]; this
/// struct only ever writes, matching the engine's assumption that it
/// exclusively owns outbound traffic on the transport.
pub struct TungsteniteTransport {
    outbound: mpsc::UnboundedSender<Message>,
}

#[async_trait::async_trait]
impl Transport for TungsteniteTransport {
    async fn send(&self, data: WireData) -> Result<(), String> {
        let message = match data {
            WireData::Text(text) => Message::Text(text),
            WireData::Binary(bytes) => Message::Binary(bytes),
        };
        self.outbound
            .send(message)
            .map_err(|error| format!("socket writer task gone: {error}"))
    }

    async fn close(&self, code: u16, reason: &str) {
        let frame = Message::Close(Some(CloseFrame {
            code: code.into(),
            reason: reason.to_string().into(),
        }));
        let _ = self.outbound.send(frame);
    }
}

/// Builds a fresh WebSocket connection on every (re)connect attempt, per
/// §6: the URL's query params are recomputed from
/// [`RealtimeClientOptions::resolved_params`] each time so a refreshed
/// access token is reflected without restarting the process.
pub struct TungsteniteConnector {
    endpoint: String,
    api_key: String,
    options: RealtimeClientOptions,
}

impl TungsteniteConnector {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, options: RealtimeClientOptions) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            options,
        }
    }

    fn build_url(&self) -> Result<Url, Error> {
        build_websocket_url(&self.endpoint, &self.api_key, &self.options.resolved_params())
    }
}

#[async_trait::async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), String> {
        let url = self.build_url().map_err(|error| error.to_string())?;
        debug!(%url, "dialing realtime websocket");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|error| error.to_string())?;
        let (write, read) = ws_stream.split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::channel(64);

        spawn_writer(write, outbound_rx);
        spawn_reader(read, events_tx.clone());
        let _ = events_tx.try_send(TransportEvent::Open);

        Ok((Arc::new(TungsteniteTransport { outbound: outbound_tx }), events_rx))
    }
}

fn spawn_writer(
    mut write: futures_util::stream::SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) {
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if let Err(error) = write.send(message).await {
                warn!(%error, "websocket write failed");
                break;
            }
        }
        let _ = write.close().await;
    });
}

fn spawn_reader(
    mut read: futures_util::stream::SplitStream<WsStream>,
    events_tx: mpsc::Sender<TransportEvent>,
) {
    tokio::spawn(async move {
        while let Some(frame) = read.next().await {
            let event = match frame {
                Ok(Message::Text(text)) => TransportEvent::Message(WireData::Text(text)),
                Ok(Message::Binary(bytes)) => TransportEvent::Message(WireData::Binary(bytes)),
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1000, String::new()));
                    let _ = events_tx.send(TransportEvent::Close { code, reason }).await;
                    return;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(error) => TransportEvent::Error(error.to_string()),
            };
            if events_tx.send(event).await.is_err() {
                return;
            }
        }
        let _ = events_tx
            .send(TransportEvent::Close { code: 1006, reason: "connection dropped".into() })
            .await;
    });
}

/// How long the broadcast HTTP fallback's abort signal waits before
/// giving up (§6: "Timeout is enforced by an abort signal"), mirrored
/// here for symmetry with the push timeout default.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
