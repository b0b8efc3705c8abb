//! State machine for one topic: join, pushes, per-event bindings,
//! rejoin, leave, teardown; hosts a [`Presence`] sub-object (§4.D).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backoff::{default_delay_fn, BackoffTimer};
use crate::filters::PostgresChangesFilter;
use crate::message::{
    ChannelPayload, Frame, FramePayload, PostgresChangePayload, PresenceDiffMsg, PresenceStateMap,
    ReplyStatus, SubscribeStatus, PHX_CLOSE, PHX_ERROR, PHX_JOIN, PHX_LEAVE, PHX_REPLY,
};
use crate::presence::Presence;
use crate::push::{Push, PushSink};

/// Maximum number of un-replied-to pushes a channel will buffer while
/// not pushable before it starts evicting the oldest (§4.D).
pub const MAX_PUSH_BUFFER_SIZE: usize = 100;

/// Default per-push timeout (§5).
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Joining,
    Joined,
    Leaving,
    Errored,
}

/// What a [`Channel`] needs from whatever owns the socket. Implemented
/// by [`crate::client::Client`]; kept as a trait so the channel never
/// depends on connection or transport machinery directly.
#[async_trait::async_trait]
pub trait ChannelClient: Send + Sync {
    fn next_ref(&self) -> String;
    fn is_connected(&self) -> bool;
    fn send_frame(&self, frame: Frame);
    fn current_access_token(&self) -> Option<String>;
    /// The default per-push timeout, taken from client configuration
    /// (§6 "timeout").
    fn default_push_timeout(&self) -> Duration;
    async fn broadcast_http_fallback(
        &self,
        sub_topic: &str,
        event: &str,
        payload: Value,
        private: bool,
    ) -> ReplyStatus;
    /// Erases `channel` from the client's channel set (§4.F `_remove`).
    /// Called once a leave has fully torn the channel down so inbound
    /// frames for its topic stop being routed to it.
    async fn remove_channel(&self, channel: Arc<Channel>);
}

type PayloadCallback = Box<dyn FnMut(ChannelPayload) + Send>;

enum BindingFilter {
    Broadcast(String),
    PostgresChanges(PostgresChangesFilter),
    System(String),
}

struct Binding {
    filter: BindingFilter,
    callback: PayloadCallback,
}

/// A channel's join-time configuration, rebuilt whenever a binding is
/// added or the channel (re)subscribes.
#[derive(Debug, Clone, Default)]
pub struct JoinConfig {
    pub broadcast_ack: bool,
    pub broadcast_self: bool,
    pub presence_enabled: bool,
    pub private: bool,
}

/// A lightweight, weakly-held [`PushSink`] so a [`Push`] never keeps its
/// owning channel alive — avoids the Channel/Push ownership cycle noted
/// as a design hazard.
pub(crate) struct ChannelSink {
    channel: Weak<Channel>,
}

impl PushSink for ChannelSink {
    fn send_push(&self, event: String, payload: Value, ref_: String) {
        if let Some(channel) = self.channel.upgrade() {
            channel.dispatch_push_frame(event, payload, ref_);
        }
    }

    fn next_ref(&self) -> String {
        match self.channel.upgrade() {
            Some(channel) => channel.client.next_ref(),
            None => "0".to_string(),
        }
    }
}

pub(crate) type ChannelPush = Push<ChannelSink>;

pub struct Channel {
    topic: String,
    client: Arc<dyn ChannelClient>,
    state: Mutex<ChannelState>,
    joined_once: AtomicBool,
    join_ref: StdRwLock<Option<String>>,
    join_push: Mutex<Option<Arc<ChannelPush>>>,
    push_buffer: Mutex<VecDeque<Arc<ChannelPush>>>,
    in_flight: StdMutex<HashMap<String, Arc<ChannelPush>>>,
    bindings: Mutex<HashMap<&'static str, Vec<Binding>>>,
    postgres_bindings: Mutex<Vec<PostgresChangesFilter>>,
    presence: Mutex<Presence>,
    rejoin_timer: BackoffTimer,
    config: Mutex<JoinConfig>,
    self_weak: StdMutex<Weak<Channel>>,
    subscribe_callback: Mutex<Option<Box<dyn FnMut(SubscribeStatus, Option<String>) + Send>>>,
}

impl Channel {
    pub fn new(topic: impl Into<String>, client: Arc<dyn ChannelClient>) -> Arc<Self> {
        let channel = Arc::new(Self {
            topic: topic.into(),
            client,
            state: Mutex::new(ChannelState::Closed),
            joined_once: AtomicBool::new(false),
            join_ref: StdRwLock::new(None),
            join_push: Mutex::new(None),
            push_buffer: Mutex::new(VecDeque::new()),
            in_flight: StdMutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            postgres_bindings: Mutex::new(Vec::new()),
            presence: Mutex::new(Presence::new()),
            rejoin_timer: BackoffTimer::new(default_delay_fn()),
            config: Mutex::new(JoinConfig::default()),
            self_weak: StdMutex::new(Weak::new()),
            subscribe_callback: Mutex::new(None),
        });
        *channel.self_weak.lock().unwrap() = Arc::downgrade(&channel);
        channel
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn state(&self) -> ChannelState {
        *self.state.lock().await
    }

    fn sink(self: &Arc<Self>) -> Arc<ChannelSink> {
        Arc::new(ChannelSink {
            channel: self.self_weak.lock().unwrap().clone(),
        })
    }

    async fn set_state(&self, state: ChannelState) {
        let mut current = self.state.lock().await;
        if *current != state {
            debug!(topic = %self.topic, from = ?*current, to = ?state, "channel state transition");
            *current = state;
        }
    }

    // ---- binding registration --------------------------------------

    pub async fn on_broadcast<F>(self: &Arc<Self>, event: impl Into<String>, callback: F)
    where
        F: FnMut(ChannelPayload) + Send + 'static,
    {
        let mut bindings = self.bindings.lock().await;
        bindings.entry("broadcast").or_default().push(Binding {
            filter: BindingFilter::Broadcast(event.into()),
            callback: Box::new(callback),
        });
    }

    pub async fn on_system<F>(self: &Arc<Self>, event: impl Into<String>, callback: F)
    where
        F: FnMut(ChannelPayload) + Send + 'static,
    {
        let mut bindings = self.bindings.lock().await;
        bindings.entry("system").or_default().push(Binding {
            filter: BindingFilter::System(event.into()),
            callback: Box::new(callback),
        });
    }

    pub async fn on_postgres_changes<F>(self: &Arc<Self>, filter: PostgresChangesFilter, callback: F)
    where
        F: FnMut(ChannelPayload) + Send + 'static,
    {
        self.postgres_bindings.lock().await.push(filter.clone());
        let mut bindings = self.bindings.lock().await;
        bindings.entry("postgres_changes").or_default().push(Binding {
            filter: BindingFilter::PostgresChanges(filter),
            callback: Box::new(callback),
        });
    }

    /// Registering a presence binding while already `joined` re-announces
    /// the channel's configuration with `presence.enabled = true` (§4.D
    /// "Reconfiguring presence mid-flight") — the one case where binding
    /// mutates channel state as a side effect. This leaves and rejoins at
    /// the protocol level without running the user-leave teardown: the
    /// broadcast/system/postgres_changes bindings the reconfigure exists
    /// to keep serving must still be in place once the rejoin completes.
    pub async fn on_presence<FJoin, FLeave, FSync>(
        self: &Arc<Self>,
        on_join: Option<FJoin>,
        on_leave: Option<FLeave>,
        on_sync: Option<FSync>,
    ) where
        FJoin: FnMut(&str, &[Value], &[Value]) + Send + 'static,
        FLeave: FnMut(&str, &[Value], &[Value]) + Send + 'static,
        FSync: FnMut() + Send + 'static,
    {
        {
            let mut presence = self.presence.lock().await;
            if let Some(cb) = on_join {
                presence.on_join(cb);
            }
            if let Some(cb) = on_leave {
                presence.on_leave(cb);
            }
            if let Some(cb) = on_sync {
                presence.on_sync(cb);
            }
        }
        self.config.lock().await.presence_enabled = true;

        if self.state().await == ChannelState::Joined {
            let this = self.clone();
            tokio::spawn(async move {
                this.leave_handshake().await;
                this.reset_transient_state().await;
                this.set_state(ChannelState::Closed).await;
                this.do_join().await;
            });
        }
    }

    // ---- subscribe / join -------------------------------------------

    fn build_join_payload(&self, postgres_bindings: &[PostgresChangesFilter], config: &JoinConfig) -> Value {
        let access_token = self.client.current_access_token();
        json!({
            "config": {
                "broadcast": { "ack": config.broadcast_ack, "self": config.broadcast_self },
                "presence": { "enabled": config.presence_enabled },
                "postgres_changes": postgres_bindings,
                "private": config.private,
            },
            "access_token": access_token,
        })
    }

    /// `subscribe(callback)` may only succeed while `closed`; calling it
    /// again is an idempotent no-op (`joined_once` is a latch). The
    /// callback persists across rejoins and fires with `SUBSCRIBED`,
    /// `CHANNEL_ERROR`, or `TIMED_OUT` each time a join attempt resolves.
    pub async fn subscribe<F>(self: &Arc<Self>, callback: Option<F>)
    where
        F: FnMut(SubscribeStatus, Option<String>) + Send + 'static,
    {
        if self.joined_once.swap(true, Ordering::SeqCst) {
            if *self.state.lock().await != ChannelState::Closed {
                return;
            }
        }

        if let Some(callback) = callback {
            *self.subscribe_callback.lock().await = Some(Box::new(callback));
        }
        self.presence.lock().await.reset_for_rejoin();
        self.do_join().await;
    }

    async fn invoke_subscribe_callback(&self, status: SubscribeStatus, detail: Option<String>) {
        if let Some(cb) = self.subscribe_callback.lock().await.as_mut() {
            cb(status, detail);
        }
    }

    fn do_join(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.set_state(ChannelState::Joining).await;

            let new_join_ref = self.client.next_ref();
            *self.join_ref.write().unwrap() = Some(new_join_ref.clone());

            let postgres_bindings = self.postgres_bindings.lock().await.clone();
            let config = self.config.lock().await.clone();
            let payload = self.build_join_payload(&postgres_bindings, &config);

            let push = Push::new(self.sink(), PHX_JOIN, payload, self.client.default_push_timeout());
            *self.join_push.lock().await = Some(push.clone());

            let this = self.clone();
            push.receive(ReplyStatus::Ok, move |response| {
                let this = this.clone();
                let response = response.clone();
                tokio::spawn(async move {
                    this.handle_join_ok(response).await;
                });
            })
            .await;

            let this_err = self.clone();
            push.receive(ReplyStatus::Error, move |response| {
                let this_err = this_err.clone();
                let response = response.clone();
                tokio::spawn(async move {
                    this_err.handle_join_failed(SubscribeStatus::ChannelError, Some(response.to_string())).await;
                });
            })
            .await;

            let this_timeout = self.clone();
            push.receive(ReplyStatus::Timeout, move |_| {
                let this_timeout = this_timeout.clone();
                tokio::spawn(async move {
                    this_timeout.handle_join_failed(SubscribeStatus::TimedOut, None).await;
                });
            })
            .await;

            self.send_and_register(push).await;
        })
    }

    async fn handle_join_ok(self: &Arc<Self>, response: Value) {
        let reply_postgres_changes = response
            .get("response")
            .and_then(|r| r.get("postgres_changes"))
            .or_else(|| response.get("postgres_changes"))
            .cloned()
            .unwrap_or(Value::Array(vec![]));

        if let Err(message) = self.stamp_postgres_ids(&reply_postgres_changes).await {
            warn!(topic = %self.topic, %message, "postgres_changes subscription mismatch");
            self.unsubscribe().await;
            self.set_state(ChannelState::Errored).await;
            self.invoke_subscribe_callback(SubscribeStatus::ChannelError, Some(message)).await;
            return;
        }

        self.set_state(ChannelState::Joined).await;
        self.rejoin_timer.reset().await;
        self.flush_push_buffer().await;
        info!(topic = %self.topic, "channel joined");
        self.invoke_subscribe_callback(SubscribeStatus::Subscribed, None).await;
    }

    async fn stamp_postgres_ids(&self, server_list: &Value) -> Result<(), String> {
        let server_entries = server_list.as_array().cloned().unwrap_or_default();
        let mut bindings = self.postgres_bindings.lock().await;

        if server_entries.len() != bindings.len() {
            return Err(format!(
                "server returned {} postgres_changes ids, client has {} bindings",
                server_entries.len(),
                bindings.len()
            ));
        }

        for (binding, server_entry) in bindings.iter_mut().zip(server_entries.iter()) {
            let event = server_entry.get("event").and_then(Value::as_str).unwrap_or_default();
            let schema = server_entry.get("schema").and_then(Value::as_str).unwrap_or_default();
            let table = server_entry.get("table").and_then(Value::as_str).unwrap_or_default();
            let filter = server_entry.get("filter").and_then(Value::as_str);
            let id = server_entry.get("id").and_then(Value::as_str);

            if !binding.matches_server_entry(event, schema, table, filter) {
                return Err(format!(
                    "binding ({}, {}, {}, {:?}) did not match server entry ({}, {}, {}, {:?})",
                    binding.event, binding.schema, binding.table, binding.filter, event, schema, table, filter
                ));
            }
            binding.id = id.map(str::to_string);
        }

        // Mirror the stamped ids into the binding table used for dispatch.
        let stamped = bindings.clone();
        drop(bindings);
        let mut table = self.bindings.lock().await;
        if let Some(list) = table.get_mut("postgres_changes") {
            for (b, stamped) in list.iter_mut().zip(stamped.iter()) {
                if let BindingFilter::PostgresChanges(f) = &mut b.filter {
                    f.id = stamped.id.clone();
                }
            }
        }
        Ok(())
    }

    async fn handle_join_failed(self: &Arc<Self>, status: SubscribeStatus, detail: Option<String>) {
        if self.state().await == ChannelState::Leaving {
            return;
        }
        self.set_state(ChannelState::Errored).await;
        self.invoke_subscribe_callback(status, detail).await;

        let this = self.clone();
        self.rejoin_timer
            .schedule(move || {
                let this = this.clone();
                Box::pin(async move {
                    if this.state().await == ChannelState::Errored {
                        this.do_join().await;
                    }
                })
            })
            .await;
    }

    /// Triggered by the Client when the socket errors or closes (§4.D:
    /// "joined -- socket error -> errored"). Ignored while leaving or
    /// already closed, per the race-with-deliberate-teardown rule.
    pub async fn handle_socket_error(self: &Arc<Self>) {
        let state = self.state().await;
        if matches!(state, ChannelState::Leaving | ChannelState::Closed) {
            return;
        }
        self.handle_join_failed(SubscribeStatus::ChannelError, Some("socket error".to_string())).await;
    }

    // ---- push ----------------------------------------------------------

    fn is_pushable(&self) -> bool {
        self.client.is_connected()
    }

    /// `push(event, payload, timeout?)` — requires `joined_once`. Sends
    /// immediately when pushable and joined; otherwise enqueues into
    /// `push_buffer` (capped at [`MAX_PUSH_BUFFER_SIZE`], oldest evicted
    /// first).
    pub async fn push(self: &Arc<Self>, event: impl Into<String>, payload: Value, timeout: Option<Duration>) -> Arc<ChannelPush> {
        let push = Push::new(self.sink(), event, payload, timeout.unwrap_or_else(|| self.client.default_push_timeout()));

        let joined = self.state().await == ChannelState::Joined;
        if self.is_pushable() && joined {
            self.send_and_register(push.clone()).await;
        } else {
            let mut buffer = self.push_buffer.lock().await;
            if buffer.len() >= MAX_PUSH_BUFFER_SIZE {
                if let Some(evicted) = buffer.pop_front() {
                    warn!(topic = %self.topic, "push buffer full, evicting oldest push");
                    evicted.destroy().await;
                }
            }
            buffer.push_back(push.clone());
        }
        push
    }

    /// Sends a push outside the ordinary joined/pushable gate — used for
    /// the join push itself and for `phx_leave`, both of which must go
    /// out regardless of the channel's current join state.
    async fn send_and_register(self: &Arc<Self>, push: Arc<ChannelPush>) {
        push.send().await;
        if let Some(ref_) = push.current_ref().await {
            self.register_in_flight(ref_, push).await;
        }
    }

    async fn flush_push_buffer(self: &Arc<Self>) {
        let drained: Vec<_> = {
            let mut buffer = self.push_buffer.lock().await;
            buffer.drain(..).collect()
        };
        for push in drained {
            self.send_and_register(push).await;
        }
    }

    fn dispatch_push_frame(self: &Arc<Self>, event: String, payload: Value, ref_: String) {
        let join_ref = self.join_ref.read().unwrap().clone();
        let frame = Frame {
            join_ref,
            ref_: Some(ref_),
            topic: self.topic.clone(),
            event,
            payload: FramePayload::Json(payload),
        };
        self.client.send_frame(frame);
    }

    /// Registers a sent push by its raw ref so a later `chan_reply_<ref>`
    /// frame can be matched back to it in [`Channel::trigger`] (§4.C).
    pub async fn register_in_flight(&self, ref_: String, push: Arc<ChannelPush>) {
        self.in_flight.lock().unwrap().insert(ref_, push);
    }

    // ---- send (user-facing wrapper) ------------------------------------

    /// `send({type, event, payload}, opts)` (§4.D). Returns the terminal
    /// status of the push, or the synthesized HTTP-fallback result for
    /// broadcasts sent while not pushable.
    pub async fn send_broadcast(self: &Arc<Self>, event: impl Into<String>, payload: Value, ack: bool) -> ReplyStatus {
        let event = event.into();
        let joined = self.state().await == ChannelState::Joined;

        if !(self.is_pushable() && joined) {
            let private = self.config.lock().await.private;
            return self
                .client
                .broadcast_http_fallback(&self.topic, &event, payload, private)
                .await;
        }

        if !ack {
            // Optimistic: resolves "ok" immediately without waiting on
            // a reply, per broadcast.ack == false.
            let wrapped = json!({"type": "broadcast", "event": event, "payload": payload});
            self.push("broadcast", wrapped, None).await;
            return ReplyStatus::Ok;
        }

        let wrapped = json!({"type": "broadcast", "event": event, "payload": payload});
        let push = self.push("broadcast", wrapped, None).await;
        await_terminal_status(&push).await
    }

    pub async fn track(self: &Arc<Self>, payload: Value) -> ReplyStatus {
        let push = self.push("presence", json!({"type": "presence", "event": "track", "payload": payload}), None).await;
        await_terminal_status(&push).await
    }

    pub async fn untrack(self: &Arc<Self>) -> ReplyStatus {
        let push = self.push("presence", json!({"type": "presence", "event": "untrack"}), None).await;
        await_terminal_status(&push).await
    }

    // ---- leave / teardown -----------------------------------------------

    /// Sends the `phx_leave` handshake and awaits its terminal status.
    /// Idempotent: a channel already `leaving` or `closed` returns `Ok`
    /// without putting a frame on the wire. Shared by `unsubscribe` and
    /// by the presence mid-flight reconfigure in [`Channel::on_presence`],
    /// which needs the protocol-level leave without the rest of
    /// `unsubscribe`'s teardown.
    async fn leave_handshake(self: &Arc<Self>) -> ReplyStatus {
        let mut state = self.state.lock().await;
        if *state == ChannelState::Leaving || *state == ChannelState::Closed {
            return ReplyStatus::Ok;
        }
        *state = ChannelState::Leaving;
        drop(state);

        if let Some(join_push) = self.join_push.lock().await.take() {
            join_push.destroy().await;
        }

        if self.is_pushable() {
            // Bypass the joined-state gate `push()` applies: a leave must
            // go out now, regardless of the state we just left.
            let push = Push::new(self.sink(), PHX_LEAVE, Value::Null, self.client.default_push_timeout());
            self.send_and_register(push.clone()).await;
            await_terminal_status(&push).await
        } else {
            ReplyStatus::Ok
        }
    }

    /// Destroys all buffered pushes, the join push, and the rejoin
    /// timer, and clears the in-flight reply table. Leaves `bindings`
    /// alone, since the presence reconfigure rejoin relies on that.
    async fn reset_transient_state(self: &Arc<Self>) {
        self.rejoin_timer.reset().await;

        if let Some(join_push) = self.join_push.lock().await.take() {
            join_push.destroy().await;
        }

        let drained: Vec<_> = {
            let mut buffer = self.push_buffer.lock().await;
            buffer.drain(..).collect()
        };
        for push in drained {
            push.destroy().await;
        }

        self.in_flight.lock().unwrap().clear();
    }

    /// Idempotent: repeated calls produce exactly one leave frame on the
    /// wire. Regardless of outcome, the channel is erased from the
    /// client's channel set once torn down (§4.F `_remove`).
    pub async fn unsubscribe(self: &Arc<Self>) -> ReplyStatus {
        let status = self.leave_handshake().await;
        self.teardown().await;
        self.client.remove_channel(self.clone()).await;
        status
    }

    /// Resets transient join state and clears bindings. Safe to call
    /// repeatedly. Used for a real leave, not for the presence
    /// reconfigure's leave-then-rejoin, which must keep bindings intact.
    pub async fn teardown(self: &Arc<Self>) {
        self.reset_transient_state().await;
        self.bindings.lock().await.clear();
        self.set_state(ChannelState::Closed).await;
    }

    // ---- event routing (_trigger) ---------------------------------------

    /// Routes one inbound frame (§4.D "Event routing") to bindings, the
    /// presence sub-object, or an in-flight push's reply hooks.
    pub async fn trigger(self: &Arc<Self>, event: &str, payload: &Value, ref_: Option<&str>) {
        if is_lifecycle_event(event) {
            if let Some(ref_) = ref_ {
                let current = self.join_ref.read().unwrap().clone();
                if current.as_deref() != Some(ref_) {
                    debug!(topic = %self.topic, event, "dropping stale lifecycle reply from a prior join generation");
                    return;
                }
            }
        }

        if event == PHX_REPLY {
            if let Some(ref_) = ref_ {
                let push = self.in_flight.lock().unwrap().remove(ref_);
                if let Some(push) = push {
                    let status = payload
                        .get("status")
                        .and_then(Value::as_str)
                        .map(ReplyStatus::from_str)
                        .unwrap_or(ReplyStatus::Error);
                    let response = payload.get("response").cloned().unwrap_or(Value::Null);
                    push.deliver(status, response).await;
                }
            }
            return;
        }

        if event == "presence_state" {
            if let Ok(state) = serde_json::from_value::<PresenceStateMap>(payload.clone()) {
                self.presence.lock().await.handle_state(state);
            }
            return;
        }
        if event == "presence_diff" {
            if let Ok(diff) = parse_presence_diff(payload) {
                self.presence.lock().await.handle_diff(diff);
            }
            return;
        }

        if matches!(event, "insert" | "update" | "delete" | "INSERT" | "UPDATE" | "DELETE") {
            self.dispatch_postgres_changes(event, payload).await;
            return;
        }

        self.dispatch_generic(event, payload).await;
    }

    async fn dispatch_postgres_changes(self: &Arc<Self>, event: &str, payload: &Value) {
        let ids: Vec<String> = payload
            .get("ids")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let mut bindings = self.bindings.lock().await;
        let Some(candidates) = bindings.get_mut("postgres_changes") else { return };

        for binding in candidates.iter_mut() {
            let BindingFilter::PostgresChanges(filter) = &binding.filter else { continue };
            let event_matches = filter.event == "*" || filter.event.eq_ignore_ascii_case(event);
            let id_matches = match &filter.id {
                Some(id) => ids.iter().any(|candidate| candidate == id),
                None => false,
            };
            if event_matches && id_matches {
                let transformed = transform_postgres_payload(event, payload);
                (binding.callback)(ChannelPayload::PostgresChange(transformed));
            }
        }
    }

    async fn dispatch_generic(self: &Arc<Self>, event: &str, payload: &Value) {
        let sub_event = payload.get("event").and_then(Value::as_str);
        let mut bindings = self.bindings.lock().await;

        if let Some(candidates) = bindings.get_mut("broadcast") {
            for binding in candidates.iter_mut() {
                let BindingFilter::Broadcast(want) = &binding.filter else { continue };
                if matches_event(want, sub_event.or(Some(event))) {
                    let inner = payload.get("payload").cloned().unwrap_or_else(|| payload.clone());
                    (binding.callback)(ChannelPayload::Broadcast(inner));
                }
            }
        }

        if let Some(candidates) = bindings.get_mut("system") {
            for binding in candidates.iter_mut() {
                let BindingFilter::System(want) = &binding.filter else { continue };
                if matches_event(want, sub_event.or(Some(event))) {
                    (binding.callback)(ChannelPayload::System(payload.clone()));
                }
            }
        }
    }
}

fn matches_event(filter_event: &str, actual: Option<&str>) -> bool {
    filter_event == "*" || actual.map(|a| a == filter_event).unwrap_or(false)
}

fn is_lifecycle_event(event: &str) -> bool {
    matches!(event, PHX_CLOSE | PHX_ERROR | PHX_LEAVE | PHX_JOIN)
}

/// Resolves once a push's reply is recorded, mirroring the
/// promise-like return described in the design notes: whichever of
/// ok/error/timeout fires first wins, the rest are no-ops.
async fn await_terminal_status<S: PushSink + 'static>(push: &Arc<Push<S>>) -> ReplyStatus {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let slot = Arc::new(StdMutex::new(Some(tx)));

    for status in [ReplyStatus::Ok, ReplyStatus::Error, ReplyStatus::Timeout] {
        let slot = slot.clone();
        push.receive(status, move |_| {
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send(status);
            }
        })
        .await;
    }

    rx.await.unwrap_or(ReplyStatus::Error)
}

fn transform_postgres_payload(event: &str, payload: &Value) -> PostgresChangePayload {
    let data = payload.get("data").cloned().unwrap_or_else(|| payload.clone());
    let schema = data.get("schema").and_then(Value::as_str).unwrap_or("public").to_string();
    let table = data.get("table").and_then(Value::as_str).unwrap_or_default().to_string();
    let commit_timestamp = data.get("commit_timestamp").and_then(Value::as_str).map(str::to_string);
    let errors = data.get("errors").cloned();
    let record = data.get("record").cloned().unwrap_or(Value::Null);
    let old_record = data.get("old_record").cloned().unwrap_or(Value::Null);

    let event_upper = event.to_uppercase();
    let (new, old) = match event_upper.as_str() {
        "INSERT" => (record, Value::Null),
        "UPDATE" => (record, old_record),
        "DELETE" => (Value::Null, old_record),
        _ => (record, old_record),
    };

    PostgresChangePayload {
        schema,
        table,
        commit_timestamp,
        event_type: event_upper,
        errors,
        new,
        old,
    }
}

fn parse_presence_diff(payload: &Value) -> Result<PresenceDiffMsg, serde_json::Error> {
    let joins: PresenceStateMap = payload
        .get("joins")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    let leaves: PresenceStateMap = payload
        .get("leaves")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    Ok(PresenceDiffMsg { joins, leaves })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct FakeClient {
        next_ref: AtomicU64,
        connected: AtomicBool,
        sent: StdMutex<Vec<Frame>>,
        token: StdMutex<Option<String>>,
    }

    impl FakeClient {
        fn new(connected: bool) -> Arc<Self> {
            Arc::new(Self {
                next_ref: AtomicU64::new(0),
                connected: AtomicBool::new(connected),
                sent: StdMutex::new(Vec::new()),
                token: StdMutex::new(None),
            })
        }

        fn last_frame(&self) -> Frame {
            self.sent.lock().unwrap().last().cloned().unwrap()
        }

        fn frames_matching(&self, event: &str) -> Vec<Frame> {
            self.sent.lock().unwrap().iter().filter(|f| f.event == event).cloned().collect()
        }
    }

    #[async_trait::async_trait]
    impl ChannelClient for FakeClient {
        fn next_ref(&self) -> String {
            self.next_ref.fetch_add(1, Ordering::SeqCst).to_string()
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn send_frame(&self, frame: Frame) {
            self.sent.lock().unwrap().push(frame);
        }

        fn current_access_token(&self) -> Option<String> {
            self.token.lock().unwrap().clone()
        }

        fn default_push_timeout(&self) -> Duration {
            DEFAULT_PUSH_TIMEOUT
        }

        async fn broadcast_http_fallback(&self, _sub_topic: &str, _event: &str, _payload: Value, _private: bool) -> ReplyStatus {
            ReplyStatus::Ok
        }

        async fn remove_channel(&self, _channel: Arc<Channel>) {}
    }

    fn ok_join_reply() -> Value {
        json!({"status": "ok", "response": {"postgres_changes": []}})
    }

    #[tokio::test]
    async fn subscribe_sends_join_and_transitions_to_joined_on_ok_reply() {
        let client = FakeClient::new(true);
        let channel = Channel::new("room:1", client.clone());
        channel.subscribe(None::<fn(SubscribeStatus, Option<String>)>).await;
        assert_eq!(channel.state().await, ChannelState::Joining);

        let join_frame = client.last_frame();
        assert_eq!(join_frame.event, PHX_JOIN);
        let ref_ = join_frame.ref_.clone().unwrap();

        channel.trigger(PHX_REPLY, &ok_join_reply(), Some(&ref_)).await;
        assert_eq!(channel.state().await, ChannelState::Joined);
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_after_first_attempt() {
        let client = FakeClient::new(true);
        let channel = Channel::new("room:1", client.clone());
        channel.subscribe(None::<fn(SubscribeStatus, Option<String>)>).await;
        let sent_after_first = client.sent.lock().unwrap().len();
        channel.subscribe(None::<fn(SubscribeStatus, Option<String>)>).await;
        assert_eq!(client.sent.lock().unwrap().len(), sent_after_first);
    }

    #[tokio::test]
    async fn push_buffers_while_joining_and_flushes_after_join() {
        let client = FakeClient::new(true);
        let channel = Channel::new("room:1", client.clone());
        channel.subscribe(None::<fn(SubscribeStatus, Option<String>)>).await;
        let join_ref = client.last_frame().ref_.clone().unwrap();

        let pushed = channel.push("custom", json!({"a": 1}), None).await;
        assert!(!pushed.is_sent().await);
        assert_eq!(client.sent.lock().unwrap().len(), 1, "custom push must not hit the wire before joined");

        channel.trigger(PHX_REPLY, &ok_join_reply(), Some(&join_ref)).await;
        assert_eq!(channel.state().await, ChannelState::Joined);
        assert!(pushed.is_sent().await);
        assert_eq!(client.sent.lock().unwrap().len(), 2, "join plus the flushed custom push");
    }

    #[tokio::test]
    async fn unsubscribe_sends_exactly_one_leave_frame_when_called_twice() {
        let client = FakeClient::new(true);
        let channel = Channel::new("room:1", client.clone());
        channel.subscribe(None::<fn(SubscribeStatus, Option<String>)>).await;
        let join_ref = client.last_frame().ref_.clone().unwrap();
        channel.trigger(PHX_REPLY, &ok_join_reply(), Some(&join_ref)).await;

        let first = channel.clone();
        let handle = tokio::spawn(async move { first.unsubscribe().await });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let leave_ref = client.frames_matching(PHX_LEAVE).last().unwrap().ref_.clone().unwrap();
        channel.trigger(PHX_REPLY, &json!({"status": "ok", "response": {}}), Some(&leave_ref)).await;
        handle.await.unwrap();

        channel.unsubscribe().await;
        assert_eq!(client.frames_matching(PHX_LEAVE).len(), 1);
    }

    #[tokio::test]
    async fn postgres_changes_dispatch_only_after_id_stamped() {
        let client = FakeClient::new(true);
        let channel = Channel::new("room:1", client.clone());
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received2 = received.clone();
        channel
            .on_postgres_changes(PostgresChangesFilter::new("INSERT", "public", "todos"), move |payload| {
                if let ChannelPayload::PostgresChange(change) = payload {
                    received2.lock().unwrap().push(change.event_type.clone());
                }
            })
            .await;

        channel.subscribe(None::<fn(SubscribeStatus, Option<String>)>).await;
        let join_ref = client.last_frame().ref_.clone().unwrap();
        channel
            .trigger(
                PHX_REPLY,
                &json!({
                    "status": "ok",
                    "response": {"postgres_changes": [{"event": "INSERT", "schema": "public", "table": "todos", "filter": null, "id": "42"}]},
                }),
                Some(&join_ref),
            )
            .await;

        channel
            .trigger(
                "INSERT",
                &json!({"ids": ["42"], "data": {"schema": "public", "table": "todos", "record": {"id": 1}}}),
                None,
            )
            .await;

        assert_eq!(*received.lock().unwrap(), vec!["INSERT".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_mismatch_reports_channel_error_and_unsubscribes() {
        let client = FakeClient::new(true);
        let channel = Channel::new("room:1", client.clone());
        channel
            .on_postgres_changes(PostgresChangesFilter::new("INSERT", "public", "todos"), |_| {})
            .await;

        let statuses = Arc::new(StdMutex::new(Vec::new()));
        let statuses2 = statuses.clone();
        channel
            .subscribe(Some(move |status: SubscribeStatus, _detail: Option<String>| {
                statuses2.lock().unwrap().push(status);
            }))
            .await;
        let join_ref = client.last_frame().ref_.clone().unwrap();

        // Server returns zero ids for one client binding: a mismatch.
        // This spawns handle_join_ok, which calls unsubscribe() and
        // blocks on the leave push's own reply — one never arrives, so
        // it resolves only once that push's timeout fires.
        channel
            .trigger(PHX_REPLY, &json!({"status": "ok", "response": {"postgres_changes": []}}), Some(&join_ref))
            .await;

        tokio::time::advance(DEFAULT_PUSH_TIMEOUT + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(statuses.lock().unwrap().last(), Some(&SubscribeStatus::ChannelError));
    }

    #[tokio::test]
    async fn broadcast_dispatch_matches_named_event() {
        let client = FakeClient::new(true);
        let channel = Channel::new("room:1", client.clone());
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received2 = received.clone();
        channel
            .on_broadcast("cursor-moved", move |payload| {
                if let ChannelPayload::Broadcast(value) = payload {
                    received2.lock().unwrap().push(value);
                }
            })
            .await;

        channel
            .trigger("broadcast", &json!({"event": "cursor-moved", "payload": {"x": 1}}), None)
            .await;

        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(received.lock().unwrap()[0], json!({"x": 1}));
    }

    #[tokio::test]
    async fn push_buffer_evicts_oldest_past_capacity() {
        let client = FakeClient::new(false);
        let channel = Channel::new("room:1", client.clone());
        for i in 0..(MAX_PUSH_BUFFER_SIZE + 1) {
            channel.push("event", json!({"i": i}), None).await;
        }
        // Not pushable: nothing hit the wire, and the buffer never
        // exceeds its cap even though MAX_PUSH_BUFFER_SIZE + 1 pushes
        // were enqueued.
        assert!(client.sent.lock().unwrap().is_empty());
    }
}
