//! A single in-flight request tracking its server reply, timeout, and
//! status listeners (§4.C).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::message::ReplyStatus;

/// A status hook registered via [`Push::receive`].
type Hook = Box<dyn FnMut(&Value) + Send>;

/// Sink a [`Push`] uses to actually hand a built frame to whatever owns
/// the wire (a `Channel`, which forwards to the `Client`). Kept generic
/// so `push.rs` has no dependency on the channel/client modules.
pub trait PushSink: Send + Sync {
    /// Builds the payload (lazily, so a resent push carries the
    /// freshest auth token) and sends it with the given `ref_`,
    /// registering a one-shot reply binding for `chan_reply_<ref_>`.
    fn send_push(&self, event: String, payload: Value, ref_: String);

    /// Allocates a fresh outbound ref.
    fn next_ref(&self) -> String;
}

struct Inner {
    hooks: HashMap<ReplyStatus, Vec<Hook>>,
    received: Option<(ReplyStatus, Value)>,
    sent: bool,
    ref_: Option<String>,
    timeout: Duration,
    timeout_handle: Option<JoinHandle<()>>,
}

/// Tracks one outbound request/reply pair.
///
/// `event` and `payload` are fixed at construction (a buffered push's
/// "freshest token" requirement is satisfied one level up, by the
/// channel rebuilding the join payload before each `resend`).
pub struct Push<S: PushSink> {
    sink: Arc<S>,
    event: String,
    payload: Value,
    inner: Mutex<Inner>,
}

impl<S: PushSink + 'static> Push<S> {
    pub fn new(sink: Arc<S>, event: impl Into<String>, payload: Value, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sink,
            event: event.into(),
            payload,
            inner: Mutex::new(Inner {
                hooks: HashMap::new(),
                received: None,
                sent: false,
                ref_: None,
                timeout,
                timeout_handle: None,
            }),
        })
    }

    /// Idempotent to failure: a push that has already recorded a
    /// `"timeout"` status returns immediately without resending.
    pub async fn send(self: &Arc<Self>) {
        {
            let inner = self.inner.lock().await;
            if matches!(inner.received, Some((ReplyStatus::Timeout, _))) {
                return;
            }
        }

        let ref_ = self.sink.next_ref();
        {
            let mut inner = self.inner.lock().await;
            inner.ref_ = Some(ref_.clone());
            inner.sent = true;

            let this = self.clone();
            let timeout = inner.timeout;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                this.deliver(ReplyStatus::Timeout, Value::Null).await;
            });
            if let Some(prev) = inner.timeout_handle.replace(handle) {
                prev.abort();
            }
        }

        self.sink.send_push(self.event.clone(), self.payload.clone(), ref_);
    }

    /// Called by the channel when a `chan_reply_<ref>` frame for this
    /// push's current `ref_` arrives.
    pub async fn deliver(self: &Arc<Self>, status: ReplyStatus, response: Value) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.timeout_handle.take() {
            handle.abort();
        }
        inner.received = Some((status, response.clone()));
        if let Some(hooks) = inner.hooks.get_mut(&status) {
            for hook in hooks.iter_mut() {
                hook(&response);
            }
        }
    }

    /// Registers a status hook. If a matching terminal status is
    /// already recorded, the callback fires immediately. Returns
    /// `self` so callers can chain `.receive(...).receive(...)`.
    pub async fn receive<F>(self: &Arc<Self>, status: ReplyStatus, mut callback: F) -> Arc<Self>
    where
        F: FnMut(&Value) + Send + 'static,
    {
        let mut inner = self.inner.lock().await;
        if let Some((recorded, response)) = inner.received.clone() {
            if recorded == status {
                callback(&response);
            }
        }
        inner
            .hooks
            .entry(status)
            .or_default()
            .push(Box::new(callback));
        drop(inner);
        self.clone()
    }

    /// Cancels current state and resends with a new timeout.
    pub async fn resend(self: &Arc<Self>, new_timeout: Duration) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(handle) = inner.timeout_handle.take() {
                handle.abort();
            }
            inner.ref_ = None;
            inner.received = None;
            inner.sent = false;
            inner.timeout = new_timeout;
        }
        self.send().await;
    }

    /// Cancels the timeout and releases hooks. Safe to call more than
    /// once.
    pub async fn destroy(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.timeout_handle.take() {
            handle.abort();
        }
        inner.hooks.clear();
    }

    pub async fn is_sent(self: &Arc<Self>) -> bool {
        self.inner.lock().await.sent
    }

    pub async fn current_ref(self: &Arc<Self>) -> Option<String> {
        self.inner.lock().await.ref_.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        counter: AtomicU64,
        sent: StdMutex<Vec<(String, Value, String)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                counter: AtomicU64::new(0),
                sent: StdMutex::new(Vec::new()),
            })
        }
    }

    impl PushSink for RecordingSink {
        fn send_push(&self, event: String, payload: Value, ref_: String) {
            self.sent.lock().unwrap().push((event, payload, ref_));
        }

        fn next_ref(&self) -> String {
            self.counter.fetch_add(1, Ordering::SeqCst).to_string()
        }
    }

    #[tokio::test]
    async fn send_registers_ref_and_forwards_to_sink() {
        let sink = RecordingSink::new();
        let push = Push::new(sink.clone(), "evt", serde_json::json!({"a": 1}), Duration::from_secs(5));
        push.send().await;
        assert!(push.is_sent().await);
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
        assert_eq!(push.current_ref().await, Some("0".to_string()));
    }

    #[tokio::test]
    async fn receive_fires_immediately_when_already_resolved() {
        let sink = RecordingSink::new();
        let push = Push::new(sink, "evt", Value::Null, Duration::from_secs(5));
        push.send().await;
        push.deliver(ReplyStatus::Ok, serde_json::json!({"x": 1})).await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        push.receive(ReplyStatus::Ok, move |v| seen2.lock().unwrap().push(v.clone()))
            .await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn receive_does_not_fire_for_mismatched_status() {
        let sink = RecordingSink::new();
        let push = Push::new(sink, "evt", Value::Null, Duration::from_secs(5));
        push.send().await;
        push.deliver(ReplyStatus::Error, Value::Null).await;

        let seen = Arc::new(StdMutex::new(0u64));
        let seen2 = seen.clone();
        push.receive(ReplyStatus::Ok, move |_| {
            *seen2.lock().unwrap() += 1;
        })
        .await;
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_delivers_timeout_status() {
        let sink = RecordingSink::new();
        let push = Push::new(sink, "evt", Value::Null, Duration::from_millis(10));
        let fired = Arc::new(StdMutex::new(false));
        let fired2 = fired.clone();
        push.receive(ReplyStatus::Timeout, move |_| {
            *fired2.lock().unwrap() = true;
        })
        .await;
        push.send().await;
        tokio::time::advance(Duration::from_millis(20)).await;
        tokio::task::yield_now().await;
        assert!(*fired.lock().unwrap());
    }

    #[tokio::test]
    async fn send_is_idempotent_after_timeout_recorded() {
        let sink = RecordingSink::new();
        let push = Push::new(sink.clone(), "evt", Value::Null, Duration::from_secs(5));
        push.send().await;
        push.deliver(ReplyStatus::Timeout, Value::Null).await;
        push.send().await;
        // second send() must not have produced another sink call
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let sink = RecordingSink::new();
        let push = Push::new(sink, "evt", Value::Null, Duration::from_secs(5));
        push.send().await;
        push.destroy().await;
        push.destroy().await;
    }
}
