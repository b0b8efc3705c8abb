//! End-to-end coverage of the real `tokio-tungstenite` transport: a mock
//! WebSocket server answers the handshake and replies `ok` to
//! `phx_join`/`phx_leave`, the way the teacher's own
//! `crates/realtime/tests/integration_test.rs` mock server does. This is
//! the one place the actual socket is exercised — everything else is
//! covered against the transport-agnostic engine in `crates/core`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use phoenix_realtime::RealtimeClient;
use phoenix_realtime_core::{ConnectionState, SubscribeStatus};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

/// Binds an ephemeral port, accepts one connection, and replies `ok` to
/// every `phx_join`/`phx_leave` frame it sees.
async fn start_mock_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else { return };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else { return };

        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    let arr = value.as_array().unwrap();
                    let (join_ref, ref_, topic, event) =
                        (arr[0].clone(), arr[1].clone(), arr[2].clone(), arr[3].as_str().unwrap());
                    if matches!(event, "phx_join" | "phx_leave") {
                        let reply = json!([
                            join_ref, ref_, topic, "phx_reply",
                            {"status": "ok", "response": {"postgres_changes": []}},
                        ]);
                        if ws.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    (addr, handle)
}

#[tokio::test]
async fn connects_and_joins_a_channel_over_a_real_socket() {
    let (addr, _server) = start_mock_server().await;
    let endpoint = format!("http://{addr}");

    let client = RealtimeClient::new(&endpoint, "test-anon-key").unwrap();
    client.connect().await.unwrap();

    for _ in 0..20 {
        if client.connection_state().await == ConnectionState::Connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    let channel = client.channel("room:lobby").await;
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let statuses2 = statuses.clone();
    channel
        .subscribe(Some(move |status: SubscribeStatus, _detail: Option<String>| {
            let statuses2 = statuses2.clone();
            tokio::spawn(async move { statuses2.lock().await.push(status) });
        }))
        .await;

    let mut joined = false;
    for _ in 0..40 {
        if statuses.lock().await.last() == Some(&SubscribeStatus::Subscribed) {
            joined = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(joined, "channel never reached Subscribed");

    client.disconnect(1000, "test done").await;
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
}
