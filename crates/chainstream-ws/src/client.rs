//! Streaming client: one websocket, one subscription.
//!
//! ```text
//! transport read ──▶ read loop (classify in order) ──▶ decode task per event
//!                        │ control frames                 │
//!                        ▼                                ├──▶ head state
//!                    handshake / exit                     └──▶ responses channel
//! keepalive task ──▶ transport write ◀── subscribe()
//! ```
//!
//! Teardown goes through a single cancellation signal. Once it fires no
//! further responses are delivered, the keepalive task sends the peer's
//! disconnect frame and both background tasks exit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use chainstream_core::{ChainHead, Classifier, Handshake, Query, Response, StreamError};

use crate::config::ClientConfig;
use crate::dispatch::Dispatcher;
use crate::head::HeadState;
use crate::keepalive::{self, SharedWriter};
use crate::subscription::{self, SubscriptionSlot};
use crate::transport::{self, FrameReader, FrameWriter};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, no subscription yet.
    Connected,
    /// Subscription sent; records are flowing.
    Subscribed,
    /// Cancelled; background tasks are winding down.
    Closing,
    /// Both background tasks have exited.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Subscribed => write!(f, "subscribed"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Channels the caller receives from.
pub struct Streams {
    /// Decoded action and delta records.
    pub responses: mpsc::Receiver<Response>,
    /// Per-frame protocol errors and the one fatal error that ended the
    /// connection, if any.
    pub errors: mpsc::UnboundedReceiver<StreamError>,
}

/// Resolves once `flag` is raised. Returns `false` if the sender went away
/// first.
pub(crate) async fn wait_raised(flag: &mut watch::Receiver<bool>) -> bool {
    flag.wait_for(|raised| *raised).await.is_ok()
}

/// State shared by the client handle and its background tasks.
#[derive(Debug)]
pub(crate) struct Shared {
    shutdown: watch::Sender<bool>,
    pub subscription: SubscriptionSlot,
    pub head: HeadState,
    handshake: watch::Sender<Option<Handshake>>,
    live_tasks: AtomicUsize,
}

impl Shared {
    fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        let (handshake, _) = watch::channel(None);
        Self {
            shutdown,
            subscription: SubscriptionSlot::new(),
            head: HeadState::new(),
            handshake,
            live_tasks: AtomicUsize::new(0),
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Fire the cancellation signal. Safe to call any number of times.
    pub fn cancel(&self) {
        let fired = self.shutdown.send_if_modified(|stop| !std::mem::replace(stop, true));
        if fired {
            debug!("connection cancelled");
        }
    }

    /// Record the peer's handshake. Only the first one counts.
    pub fn set_handshake(&self, handshake: Handshake) {
        self.handshake.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(handshake);
            true
        });
    }

    pub fn handshake_signal(&self) -> watch::Receiver<Option<Handshake>> {
        self.handshake.subscribe()
    }
}

/// Decrements the live-task count when a background task ends, however it ends.
struct TaskGuard(Arc<Shared>);

impl TaskGuard {
    fn new(shared: &Arc<Shared>) -> Self {
        shared.live_tasks.fetch_add(1, Ordering::SeqCst);
        Self(shared.clone())
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.live_tasks.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Client for one stream subscription.
///
/// Create with [`StreamClient::connect`], call [`subscribe`](Self::subscribe)
/// once, then consume [`Streams`]. There is no reconnection: when the
/// connection ends, build a new client.
pub struct StreamClient {
    url: String,
    shared: Arc<Shared>,
    writer: SharedWriter,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_grace: Duration,
}

impl StreamClient {
    /// Dial `url` and start the keepalive and read tasks.
    ///
    /// `url` is the peer's base URL (e.g. `wss://wax.eosusa.io`); the
    /// socket.io endpoint path is appended.
    pub async fn connect(url: impl Into<String>, config: ClientConfig) -> Result<(Self, Streams), StreamError> {
        let url = url.into();
        let (reader, writer) = transport::connect(&url, &config).await?;
        Ok(Self::from_transport(url, reader, writer, config))
    }

    /// Start a client over an already-established transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_transport<R, W>(url: impl Into<String>, reader: R, writer: W, config: ClientConfig) -> (Self, Streams)
    where
        R: FrameReader,
        W: FrameWriter,
    {
        let capacity = config.channel_capacity.max(1);
        let (resp_tx, resp_rx) = mpsc::channel(capacity);
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new());
        let writer = keepalive::shared_writer(writer);

        let keepalive_task = {
            let guard = TaskGuard::new(&shared);
            // an explicit interval wins over the peer's
            let peer_hint = config
                .ping_interval_ms
                .is_none()
                .then(|| shared.handshake_signal());
            let run = keepalive::run(
                writer.clone(),
                config.ping_interval(),
                shared.shutdown_signal(),
                peer_hint,
                err_tx.clone(),
            );
            tokio::spawn(async move {
                let _guard = guard;
                run.await;
            })
        };

        let read_task = {
            let guard = TaskGuard::new(&shared);
            let dispatcher = Dispatcher {
                reader,
                shared: shared.clone(),
                classifier: Arc::new(Classifier::new(config.trace_kinds.clone())),
                responses: resp_tx,
                errors: err_tx,
                idle: config.idle_timeout(),
                in_flight: Arc::new(Semaphore::new(capacity)),
            };
            tokio::spawn(async move {
                let _guard = guard;
                dispatcher.run().await;
            })
        };

        let client = Self {
            url: url.into(),
            shared,
            writer,
            tasks: Mutex::new(vec![keepalive_task, read_task]),
            shutdown_grace: config.shutdown_grace(),
        };
        let streams = Streams {
            responses: resp_rx,
            errors: err_rx,
        };
        (client, streams)
    }

    /// Send the connection's one subscription request.
    ///
    /// Fails with [`StreamError::Busy`] if a subscription was already sent
    /// and with [`StreamError::Closed`] once the connection is cancelled;
    /// neither sends anything. A write failure cancels the connection.
    pub async fn subscribe(&self, query: impl Into<Query>) -> Result<(), StreamError> {
        if self.shared.is_cancelled() {
            return Err(StreamError::Closed);
        }
        match subscription::subscribe(&self.shared.subscription, &self.writer, query.into()).await {
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "subscription write failed");
                self.shared.cancel();
                Err(e)
            }
            other => other,
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.shared.live_tasks.load(Ordering::SeqCst) == 0 {
            ConnectionState::Closed
        } else if self.shared.is_cancelled() {
            ConnectionState::Closing
        } else if self.shared.subscription.is_active() {
            ConnectionState::Subscribed
        } else {
            ConnectionState::Connected
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.subscription.is_active()
    }

    /// The query this connection is streaming.
    pub fn query(&self) -> Option<&Query> {
        self.shared.subscription.query()
    }

    /// Latest head-of-chain reported by the peer.
    pub fn head(&self) -> Option<ChainHead> {
        self.shared.head.get()
    }

    /// Last irreversible block number, 0 until the first `lib_update`.
    pub fn lib_num(&self) -> u64 {
        self.shared.head.lib_num()
    }

    /// Receiver notified on every head-of-chain change.
    pub fn watch_head(&self) -> watch::Receiver<Option<ChainHead>> {
        self.shared.head.watch()
    }

    /// The peer's session handshake, once received.
    pub fn handshake(&self) -> Option<Handshake> {
        self.shared.handshake.borrow().clone()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fire the cancellation signal without waiting for teardown.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Resolves once the connection has been cancelled, by anyone.
    pub async fn cancelled(&self) {
        let mut signal = self.shared.shutdown_signal();
        wait_raised(&mut signal).await;
    }

    /// Cancel and wait for both background tasks to exit.
    ///
    /// Tasks still running after the configured grace period are aborted.
    /// Calling this more than once is harmless.
    pub async fn close(&self) {
        self.shared.cancel();
        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for mut handle in handles {
            if time::timeout(self.shutdown_grace, &mut handle).await.is_err() {
                warn!(url = %self.url, "background task still running after grace period, aborting");
                handle.abort();
            }
        }
        info!(url = %self.url, "stream closed");
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

#[cfg(test)]
mod tests {
    use chainstream_core::{ActionQuery, DeltaQuery, Mode, RecordKind};

    use super::*;
    use crate::transport::mock::{self, MockPeer};
    use crate::transport::Frame;

    const LIB_UPDATE: &str = r#"42["lib_update",{"chain_id":"X","block_num":100,"block_id":"Y"}]"#;
    const ACTION_TRACE: &str = r#"42["message",{"type":"action_trace","mode":"live","message":"{\"action_ordinal\":5,\"creator_action_ordinal\":1,\"act\":{\"account\":\"m.federation\",\"name\":\"logmine\",\"authorization\":[{\"actor\":\"m.federation\",\"permission\":\"log\"}],\"data\":{\"miner\":\"sp4ay.wam\",\"bounty\":\"0.4048 TLM\"}},\"context_free\":false,\"elapsed\":\"76\",\"@timestamp\":\"2021-01-28T19:37:19.000\",\"block_num\":100856033,\"producer\":\"cryptolions1\",\"trx_id\":\"53cdc7714dc40cc0042c45215dd48023afad51d54dcce75ddb6354c85d064888\",\"global_sequence\":957257254,\"receipts\":[{\"receiver\":\"m.federation\",\"global_sequence\":\"957257254\",\"recv_sequence\":\"36534368\",\"auth_sequence\":[{\"account\":\"m.federation\",\"sequence\":\"50649143\"}]}],\"code_sequence\":36,\"abi_sequence\":10,\"notified\":[\"m.federation\"]}"}]"#;
    const DELTA_TRACE: &str = r#"42["message",{"type":"delta_trace","mode":"history","message":"{\"code\":\"m.federation\",\"scope\":\"m.federation\",\"table\":\"bags\",\"primary_key\":\"16158474573985087488\",\"payer\":\"w.zay.wam\",\"@timestamp\":\"2021-01-28T19:03:01.000\",\"present\":true,\"block_num\":100851918,\"block_id\":\"0602e0ce\",\"data\":{\"account\":\"w.zay.wam\",\"locked\":false}}"}]"#;
    const BAD_DELTA: &str = r#"42["message",{"type":"delta_trace","mode":"live","message":"{\"code\":"}]"#;

    fn config() -> ClientConfig {
        ClientConfig {
            idle_timeout_ms: 2_000,
            shutdown_grace_ms: 500,
            ..Default::default()
        }
    }

    fn start(config: ClientConfig) -> (StreamClient, Streams, MockPeer) {
        let (reader, writer, peer) = mock::pair();
        let (client, streams) = StreamClient::from_transport("ws://mock", reader, writer, config);
        (client, streams, peer)
    }

    async fn subscribed() -> (StreamClient, Streams, MockPeer) {
        let (client, streams, mut peer) = start(config());
        client
            .subscribe(ActionQuery::new("m.federation", "", "logmine"))
            .await
            .unwrap();
        peer.drain();
        (client, streams, peer)
    }

    async fn next_response(streams: &mut Streams) -> Response {
        time::timeout(Duration::from_secs(2), streams.responses.recv())
            .await
            .expect("response timed out")
            .expect("response channel closed")
    }

    async fn next_error(streams: &mut Streams) -> StreamError {
        time::timeout(Duration::from_secs(2), streams.errors.recv())
            .await
            .expect("error timed out")
            .expect("error channel closed")
    }

    async fn wait_for_head(client: &StreamClient) -> ChainHead {
        let mut rx = client.watch_head();
        let head = time::timeout(Duration::from_secs(2), rx.wait_for(Option::is_some))
            .await
            .expect("head update timed out")
            .unwrap()
            .clone();
        head.unwrap()
    }

    #[tokio::test]
    async fn lib_update_sets_head_without_response() {
        let (client, mut streams, peer) = subscribed().await;
        peer.send_text(LIB_UPDATE);

        let head = wait_for_head(&client).await;
        assert_eq!(head.block_num, 100);
        assert_eq!(head.chain_id, "X");
        assert_eq!(client.lib_num(), 100);

        peer.send_text(LIB_UPDATE);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.head(), Some(head));
        assert!(streams.responses.try_recv().is_err());
        client.close().await;
    }

    #[tokio::test]
    async fn action_trace_is_delivered() {
        let (client, mut streams, peer) = subscribed().await;
        peer.send_text(ACTION_TRACE);

        let resp = next_response(&mut streams).await;
        assert_eq!(resp.kind(), RecordKind::Action);
        assert_eq!(resp.mode(), Mode::Live);
        assert!(matches!(resp.delta(), Err(StreamError::NotDelta)));
        let trace = resp.action().unwrap();
        assert_eq!(trace.block_num, 100856033);
        assert_eq!(trace.act.field("miner").and_then(|v| v.as_str()), Some("sp4ay.wam"));
        assert_eq!(trace.receipts[0].global_sequence, 957257254);
        client.close().await;
    }

    #[tokio::test]
    async fn delta_trace_is_delivered_with_envelope_mode() {
        let (client, mut streams, peer) = subscribed().await;
        peer.send_text(DELTA_TRACE);

        let resp = next_response(&mut streams).await;
        assert_eq!(resp.mode(), Mode::History);
        assert!(matches!(resp.action(), Err(StreamError::NotAction)));
        assert_eq!(resp.delta().unwrap().table, "bags");
        client.close().await;
    }

    #[tokio::test]
    async fn malformed_delta_reports_one_error() {
        let (client, mut streams, peer) = subscribed().await;
        peer.send_text(BAD_DELTA);

        let err = next_error(&mut streams).await;
        assert!(matches!(err, StreamError::Deserialization(_)));
        assert!(!client.is_cancelled());

        peer.send_text(ACTION_TRACE);
        let resp = next_response(&mut streams).await;
        assert_eq!(resp.kind(), RecordKind::Action);
        assert!(streams.errors.try_recv().is_err());
        client.close().await;
    }

    #[tokio::test]
    async fn noise_is_dropped() {
        let (client, mut streams, peer) = subscribed().await;
        for frame in [
            r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":60000}"#,
            "40",
            "3",
            r#"42[{"status":"ok"},1]"#,
            r#"42["message"]"#,
            r#"42["message",{"type":"action_trace"}]"#,
            r#"42["message",{"type":"unknown","message":"{}"}]"#,
            r#"42["status",{"up":true}]"#,
            r#"43["message",{}]"#,
        ] {
            peer.send_text(frame);
        }
        peer.send_frame(Frame::Binary(vec![1, 2, 3]));
        peer.send_text(DELTA_TRACE);

        let resp = next_response(&mut streams).await;
        assert_eq!(resp.kind(), RecordKind::Delta);
        time::sleep(Duration::from_millis(50)).await;
        assert!(streams.responses.try_recv().is_err());
        assert!(streams.errors.try_recv().is_err());
        assert_eq!(client.handshake().map(|h| h.ping_interval), Some(25_000));
        assert_eq!(client.state(), ConnectionState::Subscribed);
        client.close().await;
    }

    #[tokio::test]
    async fn second_subscribe_is_busy() {
        let (client, _streams, mut peer) = subscribed().await;
        let err = client
            .subscribe(DeltaQuery::new("m.federation", "bags", "", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Busy));
        assert!(peer.drain().is_empty());
        assert!(matches!(client.query(), Some(Query::Actions(_))));
        assert!(!client.is_cancelled());
        client.close().await;
    }

    #[tokio::test]
    async fn frames_wait_for_subscription() {
        let (client, mut streams, mut peer) = start(config());
        assert_eq!(client.state(), ConnectionState::Connected);
        peer.send_text(ACTION_TRACE);
        time::sleep(Duration::from_millis(50)).await;
        assert!(streams.responses.try_recv().is_err());

        client.subscribe(ActionQuery::new("m.federation", "", "logmine")).await.unwrap();
        assert!(peer.drain()[0].starts_with("420[\"action_stream_request\""));
        let resp = next_response(&mut streams).await;
        assert_eq!(resp.kind(), RecordKind::Action);
        client.close().await;
    }

    #[tokio::test]
    async fn peer_disconnect_is_fatal() {
        let (client, mut streams, peer) = subscribed().await;
        peer.send_text("41");

        let err = next_error(&mut streams).await;
        assert!(err.is_peer_exit());
        time::timeout(Duration::from_secs(2), client.cancelled()).await.unwrap();
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn websocket_close_is_fatal() {
        let (client, mut streams, peer) = subscribed().await;
        peer.send_frame(Frame::Close);
        assert!(next_error(&mut streams).await.is_peer_exit());
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn transport_error_is_reported_once() {
        let (client, mut streams, peer) = subscribed().await;
        peer.send_error(StreamError::WebSocket("connection reset".into()));

        let err = next_error(&mut streams).await;
        assert!(matches!(err, StreamError::WebSocket(_)));
        client.close().await;
        assert!(streams.errors.try_recv().is_err());
        assert!(matches!(
            client.subscribe(ActionQuery::new("a", "", "")).await,
            Err(StreamError::Closed)
        ));
    }

    #[tokio::test]
    async fn idle_peer_times_out() {
        let (client, mut streams, _peer) = start(ClientConfig {
            idle_timeout_ms: 100,
            ping_interval_ms: Some(1_000),
            ..config()
        });
        client.subscribe(DeltaQuery::new("c", "t", "", "")).await.unwrap();

        let err = next_error(&mut streams).await;
        assert!(matches!(err, StreamError::Timeout { ms: 100 }));
        assert!(client.is_cancelled());
        client.close().await;
    }

    #[tokio::test]
    async fn cancel_stops_delivery_and_tasks() {
        let (client, mut streams, mut peer) = subscribed().await;
        peer.send_text(ACTION_TRACE);
        next_response(&mut streams).await;

        client.cancel();
        client.cancel();
        time::timeout(Duration::from_secs(1), client.close()).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);

        peer.send_text(ACTION_TRACE);
        time::sleep(Duration::from_millis(50)).await;
        assert!(streams.responses.try_recv().is_err());
        assert_eq!(peer.drain().last().map(String::as_str), Some("41"));

        // second close is a no-op
        time::timeout(Duration::from_millis(100), client.close()).await.unwrap();
    }

    #[tokio::test]
    async fn write_failure_on_subscribe_cancels() {
        let (client, _streams, peer) = start(config());
        peer.fail_writes();
        let err = client.subscribe(ActionQuery::new("a", "", "")).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(client.is_cancelled());
        assert!(!client.is_subscribed());
        client.close().await;
    }

    #[tokio::test]
    async fn failed_ping_is_not_fatal() {
        let (client, mut streams, peer) = start(ClientConfig {
            ping_interval_ms: Some(20),
            ..config()
        });
        peer.fail_writes();

        let err = next_error(&mut streams).await;
        assert!(matches!(err, StreamError::Keepalive(_)));
        assert!(!err.is_fatal());
        assert!(!client.is_cancelled());
        assert_eq!(client.state(), ConnectionState::Connected);
        client.close().await;
    }

    #[tokio::test]
    async fn slow_consumer_pauses_reading() {
        let (client, mut streams, mut peer) = start(ClientConfig {
            channel_capacity: 1,
            ..config()
        });
        client.subscribe(ActionQuery::new("m.federation", "", "logmine")).await.unwrap();
        peer.drain();
        for _ in 0..5 {
            peer.send_text(ACTION_TRACE);
        }
        peer.send_text("41");

        // the disconnect stays unread while records are waiting
        time::sleep(Duration::from_millis(100)).await;
        assert!(streams.errors.try_recv().is_err());
        assert!(!client.is_cancelled());

        for _ in 0..5 {
            assert_eq!(next_response(&mut streams).await.kind(), RecordKind::Action);
        }
        assert!(next_error(&mut streams).await.is_peer_exit());
        client.close().await;
    }
}
