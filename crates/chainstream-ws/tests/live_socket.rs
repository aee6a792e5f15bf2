//! End-to-end tests against a local socket.io-shaped websocket peer.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response as HandshakeResponse};
use tokio_tungstenite::tungstenite::Message;

use chainstream_ws::{ActionQuery, ClientConfig, RecordKind, StreamClient, StreamError};

const OPEN: &str = r#"0{"sid":"fJ3pVWHQbkTTAJxIAAAB","upgrades":[],"pingInterval":25000,"pingTimeout":60000}"#;
const LIB_UPDATE: &str = r#"42["lib_update",{"chain_id":"1064487b","block_num":100,"block_id":"0000006493"}]"#;
const ACTION: &str = r#"42["message",{"type":"action_trace","mode":"live","message":"{\"act\":{\"account\":\"eosio.token\",\"name\":\"transfer\",\"authorization\":[],\"data\":{\"from\":\"alice\",\"to\":\"bob\",\"quantity\":\"1.0000 WAX\"}},\"@timestamp\":\"2021-01-28T19:37:19.000\",\"block_num\":\"101\",\"global_sequence\":7,\"trx_id\":\"abc\"}"}]"#;

/// How the fake peer ends the session.
#[derive(Clone, Copy)]
enum Ending {
    /// Sends the socket.io disconnect itself.
    PeerDisconnects,
    /// Waits for the client to say goodbye.
    AwaitClient,
}

struct Seen {
    uri: String,
    user_agent: String,
}

/// Serve one connection. Every text frame received (apart from probes) is
/// forwarded on the returned channel.
async fn serve_once(ending: Ending) -> (String, oneshot::Receiver<Seen>, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = oneshot::channel();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, resp: HandshakeResponse| -> Result<HandshakeResponse, ErrorResponse> {
            let user_agent = req
                .headers()
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let _ = seen_tx.send(Seen {
                uri: req.uri().to_string(),
                user_agent,
            });
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback).await.unwrap();
        ws.send(Message::Text(OPEN.into())).await.unwrap();
        ws.send(Message::Text("40".into())).await.unwrap();

        let mut announced = false;
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Text(text) if text == "2" => {
                    let _ = ws.send(Message::Text("3".into())).await;
                }
                Message::Text(text) => {
                    let subscribe = text.starts_with("420[");
                    let _ = frames_tx.send(text);
                    if subscribe && !announced {
                        announced = true;
                        ws.send(Message::Text(LIB_UPDATE.into())).await.unwrap();
                        ws.send(Message::Text(ACTION.into())).await.unwrap();
                        if let Ending::PeerDisconnects = ending {
                            // records in flight are dropped once the client cancels
                            time::sleep(Duration::from_millis(200)).await;
                            ws.send(Message::Text("41".into())).await.unwrap();
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    (format!("http://{addr}"), seen_rx, frames_rx)
}

fn config() -> ClientConfig {
    ClientConfig {
        idle_timeout_ms: 5_000,
        shutdown_grace_ms: 1_000,
        ..ClientConfig::default()
    }
    .with_user_agent("chainstream-test/1")
}

#[tokio::test]
async fn streams_head_and_actions_until_peer_exit() {
    let (url, seen, mut frames) = serve_once(Ending::PeerDisconnects).await;
    let (client, mut streams) = StreamClient::connect(&url, config()).await.unwrap();

    let seen = seen.await.unwrap();
    assert_eq!(seen.uri, "/socket.io/?EIO=3&transport=websocket");
    assert_eq!(seen.user_agent, "chainstream-test/1");

    client
        .subscribe(ActionQuery::new("eosio.token", "", "transfer").by_block(101, 200))
        .await
        .unwrap();
    let request = time::timeout(Duration::from_secs(2), frames.recv()).await.unwrap().unwrap();
    assert!(request.starts_with(r#"420["action_stream_request",{"contract":"eosio.token""#), "{request}");
    assert!(request.contains(r#""start_from":101"#));
    assert!(request.contains(r#""read_until":200"#));

    let resp = time::timeout(Duration::from_secs(2), streams.responses.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resp.kind(), RecordKind::Action);
    let trace = resp.into_action().unwrap();
    assert_eq!(trace.block_num, 101);
    assert_eq!(trace.act.field("to").and_then(|v| v.as_str()), Some("bob"));

    let err = time::timeout(Duration::from_secs(2), streams.errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, StreamError::PeerExit));
    assert!(client.is_cancelled());
    assert_eq!(client.lib_num(), 100);
    assert_eq!(client.handshake().map(|h| h.sid).as_deref(), Some("fJ3pVWHQbkTTAJxIAAAB"));
    client.close().await;
}

#[tokio::test]
async fn close_says_goodbye() {
    let (url, _seen, mut frames) = serve_once(Ending::AwaitClient).await;
    let (client, mut streams) = StreamClient::connect(&url, config()).await.unwrap();
    client.subscribe(ActionQuery::new("eosio.token", "", "")).await.unwrap();

    let first = time::timeout(Duration::from_secs(2), streams.responses.recv()).await.unwrap();
    assert!(first.is_some());

    time::timeout(Duration::from_secs(2), client.close()).await.unwrap();
    let mut tail = Vec::new();
    while let Ok(Some(frame)) = time::timeout(Duration::from_secs(1), frames.recv()).await {
        tail.push(frame);
    }
    assert_eq!(tail.last().map(String::as_str), Some("41"));
    assert!(streams.errors.try_recv().is_err());
}

#[tokio::test]
async fn refuses_unknown_scheme() {
    let err = StreamClient::connect("ftp://example.com", config()).await.err().unwrap();
    assert!(matches!(err, StreamError::InvalidUrl(_)));
}

#[tokio::test]
async fn connect_failure_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = StreamClient::connect(format!("ws://{addr}"), config()).await.err().unwrap();
    assert!(matches!(err, StreamError::Connect { .. }));
    assert!(err.is_fatal());
}
