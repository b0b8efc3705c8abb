//! Owns the single socket a set of [`Channel`]s are multiplexed over:
//! connection lifecycle, heartbeat, access-token refresh, send
//! buffering, ref generation, and ingress dispatch (§4.F).

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::{default_delay_fn, BackoffTimer, DelayFn};
use crate::channel::{Channel, ChannelClient, ChannelState};
use crate::codec;
use crate::error::Error;
use crate::message::{
    Frame, ReplyStatus, ACCESS_TOKEN_EVENT, HEARTBEAT_EVENT, HEARTBEAT_TOPIC,
};
use crate::transport::{BroadcastFallback, Connector, Transport, TransportEvent};

/// A JS-style "safe integer" boundary: the ref counter wraps back to 0
/// here rather than at `u64::MAX`, matching the original client's
/// behavior and keeping refs representable without precision loss in
/// any consumer that parses them as a double.
const MAX_SAFE_REF: u64 = 9_007_199_254_740_991;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Status observed by an `on_heartbeat` hook (§4.F "Heartbeat").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Sent,
    Ok,
    Timeout,
    Error,
}

/// Supplies the current access token on demand. Failures (sync or
/// async) are swallowed by the client, which falls back to whatever
/// token it already holds in memory.
#[async_trait::async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn get_token(&self) -> Result<String, String>;
}

/// Every option from §6's configuration table that belongs to the
/// protocol engine rather than to a concrete transport (the transport's
/// own `headers`/`params` live with the [`Connector`] implementation).
pub struct ClientOptions {
    pub timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_after_fn: DelayFn,
    pub log_level: Option<tracing::Level>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_after_fn: default_delay_fn(),
            log_level: None,
        }
    }
}

impl Clone for ClientOptions {
    fn clone(&self) -> Self {
        Self {
            timeout: self.timeout,
            heartbeat_interval: self.heartbeat_interval,
            reconnect_after_fn: self.reconnect_after_fn.clone(),
            log_level: self.log_level,
        }
    }
}

type OpenHook = Box<dyn FnMut() + Send>;
type CloseHook = Box<dyn FnMut(u16, String) + Send>;
type ErrorHook = Box<dyn FnMut(String) + Send>;
type HeartbeatHook = Box<dyn FnMut(HeartbeatStatus) + Send>;
type MessageHook = Box<dyn FnMut(&Frame) + Send>;

pub struct Client {
    connector: Arc<dyn Connector>,
    options: ClientOptions,

    token_provider: Mutex<Option<Arc<dyn AccessTokenProvider>>>,
    broadcast_fallback: Mutex<Option<Arc<dyn BroadcastFallback>>>,
    access_token: StdMutex<Option<String>>,

    state: Mutex<ConnectionState>,
    connected_flag: AtomicBool,
    state_change_tx: broadcast::Sender<ConnectionState>,
    manually_closed: AtomicBool,

    transport: Mutex<Option<Arc<dyn Transport>>>,
    outbound_tx: StdMutex<Option<mpsc::UnboundedSender<Frame>>>,
    send_buffer: StdMutex<VecDeque<Frame>>,

    channels: Mutex<Vec<Arc<Channel>>>,
    next_ref: AtomicU64,

    pending_heartbeat_ref: Mutex<Option<String>>,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
    reconnect_timer: BackoffTimer,

    on_open_hooks: Mutex<Vec<OpenHook>>,
    on_close_hooks: Mutex<Vec<CloseHook>>,
    on_error_hooks: Mutex<Vec<ErrorHook>>,
    on_heartbeat_hooks: Mutex<Vec<HeartbeatHook>>,
    on_message_hooks: Mutex<Vec<MessageHook>>,

    self_weak: StdMutex<Weak<Client>>,
}

impl Client {
    pub fn new(connector: Arc<dyn Connector>, options: ClientOptions) -> Arc<Self> {
        let (state_change_tx, _) = broadcast::channel(16);
        let reconnect_timer = BackoffTimer::new(options.reconnect_after_fn.clone());
        let client = Arc::new(Self {
            connector,
            options,
            token_provider: Mutex::new(None),
            broadcast_fallback: Mutex::new(None),
            access_token: StdMutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            connected_flag: AtomicBool::new(false),
            state_change_tx,
            manually_closed: AtomicBool::new(false),
            transport: Mutex::new(None),
            outbound_tx: StdMutex::new(None),
            send_buffer: StdMutex::new(VecDeque::new()),
            channels: Mutex::new(Vec::new()),
            next_ref: AtomicU64::new(0),
            pending_heartbeat_ref: Mutex::new(None),
            heartbeat_handle: Mutex::new(None),
            reconnect_timer,
            on_open_hooks: Mutex::new(Vec::new()),
            on_close_hooks: Mutex::new(Vec::new()),
            on_error_hooks: Mutex::new(Vec::new()),
            on_heartbeat_hooks: Mutex::new(Vec::new()),
            on_message_hooks: Mutex::new(Vec::new()),
            self_weak: StdMutex::new(Weak::new()),
        });
        *client.self_weak.lock().unwrap() = Arc::downgrade(&client);
        client
    }

    pub async fn set_access_token_provider(&self, provider: Arc<dyn AccessTokenProvider>) {
        *self.token_provider.lock().await = Some(provider);
    }

    pub async fn set_broadcast_fallback(&self, fallback: Arc<dyn BroadcastFallback>) {
        *self.broadcast_fallback.lock().await = Some(fallback);
    }

    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_change_tx.subscribe()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    pub async fn on_open<F>(&self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.on_open_hooks.lock().await.push(Box::new(cb));
    }

    pub async fn on_close<F>(&self, cb: F)
    where
        F: FnMut(u16, String) + Send + 'static,
    {
        self.on_close_hooks.lock().await.push(Box::new(cb));
    }

    pub async fn on_error<F>(&self, cb: F)
    where
        F: FnMut(String) + Send + 'static,
    {
        self.on_error_hooks.lock().await.push(Box::new(cb));
    }

    pub async fn on_heartbeat<F>(&self, cb: F)
    where
        F: FnMut(HeartbeatStatus) + Send + 'static,
    {
        self.on_heartbeat_hooks.lock().await.push(Box::new(cb));
    }

    pub async fn on_message<F>(&self, cb: F)
    where
        F: FnMut(&Frame) + Send + 'static,
    {
        self.on_message_hooks.lock().await.push(Box::new(cb));
    }

    // ---- connection lifecycle -------------------------------------

    /// No-op if a socket is already open.
    pub fn connect(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>> {
        Box::pin(async move {
            if self.transport.lock().await.is_some() {
                return Ok(());
            }
            self.manually_closed.store(false, Ordering::SeqCst);
            self.set_connection_state(ConnectionState::Connecting).await;

            let (transport, events) = self
                .connector
                .connect()
                .await
                .map_err(Error::Transport)?;
            *self.transport.lock().await = Some(transport.clone());

            let (tx, rx) = mpsc::unbounded_channel::<Frame>();
            *self.outbound_tx.lock().unwrap() = Some(tx);

            let writer_transport = transport;
            let writer_client = self.clone();
            tokio::spawn(async move {
                let mut rx = rx;
                while let Some(frame) = rx.recv().await {
                    let wire = codec::encode(&frame);
                    if let Err(message) = writer_transport.send(wire).await {
                        warn!(%message, "transport send failed");
                        writer_client.handle_close(1006, message).await;
                        break;
                    }
                }
            });

            let reader_client = self.clone();
            tokio::spawn(async move {
                reader_client.run_event_loop(events).await;
            });

            Ok(())
        })
    }

    /// Closes the socket, clears the heartbeat timer, and resets the
    /// reconnect backoff. No automatic reconnect follows.
    pub async fn disconnect(self: &Arc<Self>, code: u16, reason: &str) {
        self.manually_closed.store(true, Ordering::SeqCst);
        self.reconnect_timer.reset().await;
        self.stop_heartbeat().await;
        if let Some(transport) = self.transport.lock().await.take() {
            transport.close(code, reason).await;
        }
        *self.outbound_tx.lock().unwrap() = None;
        self.set_connection_state(ConnectionState::Disconnected).await;
    }

    async fn run_event_loop(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Open => self.handle_open().await,
                TransportEvent::Message(data) => self.handle_message(data).await,
                TransportEvent::Error(message) => self.handle_error(message).await,
                TransportEvent::Close { code, reason } => {
                    self.handle_close(code, reason).await;
                    break;
                }
            }
        }
    }

    async fn handle_open(self: &Arc<Self>) {
        info!("realtime connection open");
        self.set_connection_state(ConnectionState::Connected).await;
        self.flush_send_buffer().await;
        self.reconnect_timer.reset().await;
        self.start_heartbeat().await;
        for hook in self.on_open_hooks.lock().await.iter_mut() {
            hook();
        }
    }

    async fn handle_message(self: &Arc<Self>, data: crate::codec::WireData) {
        let frame = match codec::decode(&data) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "dropping malformed frame");
                return;
            }
        };

        if let Some(ref_) = &frame.ref_ {
            let mut pending = self.pending_heartbeat_ref.lock().await;
            if pending.as_deref() == Some(ref_.as_str()) {
                pending.take();
                drop(pending);
                let status = frame.payload.status().map(ReplyStatus::from_str).unwrap_or(ReplyStatus::Error);
                let hb_status = if status == ReplyStatus::Ok { HeartbeatStatus::Ok } else { HeartbeatStatus::Error };
                for hook in self.on_heartbeat_hooks.lock().await.iter_mut() {
                    hook(hb_status);
                }
            }
        }

        debug!(topic = %frame.topic, event = %frame.event, "inbound frame");
        for hook in self.on_message_hooks.lock().await.iter_mut() {
            hook(&frame);
        }

        let payload = frame.payload.as_json();
        let matching: Vec<Arc<Channel>> = {
            let channels = self.channels.lock().await;
            channels.iter().filter(|c| c.topic() == frame.topic).cloned().collect()
        };
        for channel in matching {
            channel.trigger(&frame.event, &payload, frame.ref_.as_deref()).await;
        }
    }

    async fn handle_error(self: &Arc<Self>, message: String) {
        warn!(%message, "transport error");
        self.trigger_phx_error_on_all_channels().await;
        for hook in self.on_error_hooks.lock().await.iter_mut() {
            hook(message.clone());
        }
    }

    async fn handle_close(self: &Arc<Self>, code: u16, reason: String) {
        info!(code, %reason, "realtime connection closed");
        *self.transport.lock().await = None;
        *self.outbound_tx.lock().unwrap() = None;
        self.stop_heartbeat().await;
        self.set_connection_state(ConnectionState::Disconnected).await;
        self.trigger_phx_error_on_all_channels().await;
        for hook in self.on_close_hooks.lock().await.iter_mut() {
            hook(code, reason.clone());
        }

        if !self.manually_closed.load(Ordering::SeqCst) {
            self.schedule_reconnect().await;
        }
    }

    async fn trigger_phx_error_on_all_channels(&self) {
        let channels: Vec<Arc<Channel>> = self.channels.lock().await.clone();
        for channel in channels {
            channel.handle_socket_error().await;
        }
    }

    async fn schedule_reconnect(self: &Arc<Self>) {
        self.set_connection_state(ConnectionState::Reconnecting).await;
        let this = self.clone();
        self.reconnect_timer
            .schedule(move || {
                let this = this.clone();
                Box::pin(async move {
                    if let Err(error) = this.connect().await {
                        warn!(%error, "reconnect attempt failed");
                    }
                })
            })
            .await;
    }

    async fn set_connection_state(&self, state: ConnectionState) {
        let mut current = self.state.lock().await;
        if *current != state {
            *current = state;
            self.connected_flag.store(state == ConnectionState::Connected, Ordering::SeqCst);
            let _ = self.state_change_tx.send(state);
        }
    }

    // ---- heartbeat --------------------------------------------------

    async fn start_heartbeat(self: &Arc<Self>) {
        self.stop_heartbeat().await;
        let this = self.clone();
        let interval = self.options.heartbeat_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                this.tick_heartbeat().await;
            }
        });
        *self.heartbeat_handle.lock().await = Some(handle);
    }

    async fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_handle.lock().await.take() {
            handle.abort();
        }
        self.pending_heartbeat_ref.lock().await.take();
    }

    async fn tick_heartbeat(self: &Arc<Self>) {
        {
            let pending = self.pending_heartbeat_ref.lock().await;
            if pending.is_some() {
                drop(pending);
                for hook in self.on_heartbeat_hooks.lock().await.iter_mut() {
                    hook(HeartbeatStatus::Timeout);
                }
                if let Some(transport) = self.transport.lock().await.clone() {
                    transport.close(1000, "heartbeat timeout").await;
                }
                return;
            }
        }

        self.refresh_access_token().await;

        let ref_ = self.next_ref_value();
        *self.pending_heartbeat_ref.lock().await = Some(ref_.clone());
        let frame = Frame::new(HEARTBEAT_TOPIC, HEARTBEAT_EVENT, json!({})).with_ref(ref_);
        self.send_frame_internal(frame);
        for hook in self.on_heartbeat_hooks.lock().await.iter_mut() {
            hook(HeartbeatStatus::Sent);
        }
    }

    // ---- access token -------------------------------------------------

    /// Bypasses the provider and sets the token directly.
    pub async fn set_auth(self: &Arc<Self>, token: Option<String>) {
        *self.access_token.lock().unwrap() = token.clone();
        self.push_access_token_to_channels(token).await;
    }

    async fn refresh_access_token(self: &Arc<Self>) {
        let provider = self.token_provider.lock().await.clone();
        let Some(provider) = provider else { return };
        match provider.get_token().await {
            Ok(token) => {
                *self.access_token.lock().unwrap() = Some(token.clone());
                self.push_access_token_to_channels(Some(token)).await;
            }
            Err(error) => {
                warn!(%error, "access token provider failed, keeping previous token");
            }
        }
    }

    /// Updates the join payload of every joined channel so a future
    /// rejoin carries the new token, and pushes it immediately on each
    /// already-joined channel's own topic.
    async fn push_access_token_to_channels(self: &Arc<Self>, token: Option<String>) {
        let Some(token) = token else { return };
        let channels: Vec<Arc<Channel>> = self.channels.lock().await.clone();
        for channel in channels {
            if channel.state().await == ChannelState::Joined {
                channel
                    .push(ACCESS_TOKEN_EVENT, json!({ "access_token": token }), None)
                    .await;
            }
        }
    }

    // ---- ref generation -----------------------------------------------

    fn next_ref_value(&self) -> String {
        let value = self.next_ref.fetch_add(1, Ordering::SeqCst);
        if value >= MAX_SAFE_REF {
            self.next_ref.store(0, Ordering::SeqCst);
        }
        value.to_string()
    }

    // ---- send buffering -------------------------------------------------

    fn send_frame_internal(&self, frame: Frame) {
        let tx = self.outbound_tx.lock().unwrap().clone();
        let delivered = match tx {
            Some(tx) => tx.send(frame.clone()).is_ok(),
            None => false,
        };
        if !delivered {
            self.send_buffer.lock().unwrap().push_back(frame);
        }
    }

    async fn flush_send_buffer(&self) {
        let drained: Vec<Frame> = {
            let mut buffer = self.send_buffer.lock().unwrap();
            buffer.drain(..).collect()
        };
        for frame in drained {
            self.send_frame_internal(frame);
        }
    }

    // ---- channel lifecycle ---------------------------------------------

    /// Constructs a new channel, first leaving any existing channel on
    /// the same topic that is `joined` or `joining` (the server allows
    /// only one live subscription per topic).
    pub async fn channel(self: &Arc<Self>, topic: impl Into<String>) -> Arc<Channel> {
        let topic = topic.into();
        self.leave_open_topic(&topic).await;
        let client: Arc<dyn ChannelClient> = self.clone();
        let channel = Channel::new(topic, client);
        self.channels.lock().await.push(channel.clone());
        channel
    }

    async fn leave_open_topic(&self, topic: &str) {
        let existing: Vec<Arc<Channel>> = {
            let channels = self.channels.lock().await;
            channels.iter().filter(|c| c.topic() == topic).cloned().collect()
        };
        for channel in existing {
            if matches!(channel.state().await, ChannelState::Joined | ChannelState::Joining) {
                channel.unsubscribe().await;
            }
        }
    }

    /// Erases a channel from the set by identity.
    pub async fn remove_channel(&self, channel: &Arc<Channel>) {
        self.channels.lock().await.retain(|c| !Arc::ptr_eq(c, channel));
    }
}

#[async_trait::async_trait]
impl ChannelClient for Client {
    fn next_ref(&self) -> String {
        self.next_ref_value()
    }

    fn is_connected(&self) -> bool {
        self.connected_flag.load(Ordering::SeqCst)
    }

    fn send_frame(&self, frame: Frame) {
        self.send_frame_internal(frame);
    }

    fn current_access_token(&self) -> Option<String> {
        self.access_token.lock().unwrap().clone()
    }

    fn default_push_timeout(&self) -> Duration {
        self.options.timeout
    }

    async fn broadcast_http_fallback(&self, sub_topic: &str, event: &str, payload: serde_json::Value, private: bool) -> ReplyStatus {
        let fallback = self.broadcast_fallback.lock().await.clone();
        match fallback {
            Some(fallback) => fallback.post_broadcast(sub_topic, event, payload, private).await,
            None => ReplyStatus::Error,
        }
    }

    async fn remove_channel(&self, channel: Arc<Channel>) {
        Client::remove_channel(self, &channel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireData;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    struct FakeTransport {
        sent: StdMutex<Vec<WireData>>,
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, data: WireData) -> Result<(), String> {
            self.sent.lock().unwrap().push(data);
            Ok(())
        }

        async fn close(&self, _code: u16, _reason: &str) {}
    }

    struct FakeConnector {
        opens: Arc<StdAtomicU64>,
    }

    #[async_trait::async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), String> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(8);
            let _ = tx.send(TransportEvent::Open).await;
            Ok((Arc::new(FakeTransport { sent: StdMutex::new(Vec::new()) }), rx))
        }
    }

    #[tokio::test]
    async fn connect_transitions_to_connected_on_open() {
        let connector = Arc::new(FakeConnector { opens: Arc::new(StdAtomicU64::new(0)) });
        let client = Client::new(connector, ClientOptions::default());
        client.connect().await.unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(client.connection_state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn connect_is_a_no_op_when_already_connected() {
        let opens = Arc::new(StdAtomicU64::new(0));
        let connector = Arc::new(FakeConnector { opens: opens.clone() });
        let client = Client::new(connector, ClientOptions::default());
        client.connect().await.unwrap();
        tokio::task::yield_now().await;
        client.connect().await.unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ref_values_are_stringified_and_increase() {
        let connector: Arc<dyn Connector> = Arc::new(FakeConnector { opens: Arc::new(StdAtomicU64::new(0)) });
        let client = Client::new(connector, ClientOptions::default());
        assert_eq!(client.next_ref_value(), "0");
        assert_eq!(client.next_ref_value(), "1");
        assert_eq!(client.next_ref_value(), "2");
    }
}
