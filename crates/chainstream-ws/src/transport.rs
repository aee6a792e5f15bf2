//! Raw socket abstraction: connect, read frame, write frame, close.
//!
//! The reader and writer halves are separate traits so the read loop can own
//! one while the keepalive task and the subscription share the other.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

use chainstream_core::envelope;
use chainstream_core::StreamError;

use crate::config::ClientConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One inbound websocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Read half of a transport.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Next frame, or `Ok(None)` once the stream has ended.
    async fn read_frame(&mut self) -> Result<Option<Frame>, StreamError>;
}

/// Write half of a transport.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn write_frame(&mut self, text: &str) -> Result<(), StreamError>;

    /// Send a websocket close and flush.
    async fn close(&mut self) -> Result<(), StreamError>;
}

/// Read half of a tungstenite connection.
pub struct WsReader {
    stream: SplitStream<WsStream>,
}

/// Write half of a tungstenite connection.
pub struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

fn ws_err(e: tungstenite::Error) -> StreamError {
    StreamError::WebSocket(e.to_string())
}

fn connect_err(url: &str, reason: impl ToString) -> StreamError {
    StreamError::Connect {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

/// Dial `base_url` plus the socket.io endpoint suffix.
///
/// Fails without leaving anything running if the handshake does not
/// complete within the connect timeout.
pub async fn connect(base_url: &str, config: &ClientConfig) -> Result<(WsReader, WsWriter), StreamError> {
    let url = envelope::endpoint(base_url)?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| StreamError::InvalidUrl(format!("{url}: {e}")))?;
    let headers = request.headers_mut();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&config.user_agent).map_err(|e| connect_err(&url, format!("invalid user agent: {e}")))?,
    );
    for (name, value) in &config.headers {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| connect_err(&url, format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| connect_err(&url, format!("invalid value for header '{name}': {e}")))?;
        headers.insert(header, value);
    }

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);
    ws_config.max_frame_size = Some(config.max_message_size);

    let connector = if config.insecure_tls {
        tracing::warn!(url = %url, "TLS certificate verification disabled");
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| connect_err(&url, e))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    tracing::info!(url = %url, "connecting via WebSocket");
    let dial = tokio_tungstenite::connect_async_tls_with_config(request, Some(ws_config), false, connector);
    let (ws, _response) = time::timeout(config.connect_timeout(), dial)
        .await
        .map_err(|_| connect_err(&url, format!("timed out after {}ms", config.connect_timeout_ms)))?
        .map_err(|e| connect_err(&url, e))?;
    tracing::info!(url = %url, "WebSocket connected");

    let (sink, stream) = ws.split();
    Ok((WsReader { stream }, WsWriter { sink }))
}

#[async_trait]
impl FrameReader for WsReader {
    async fn read_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        loop {
            let frame = match self.stream.next().await {
                None => return Ok(None),
                Some(Err(tungstenite::Error::ConnectionClosed)) => return Ok(None),
                Some(Err(e)) => return Err(ws_err(e)),
                Some(Ok(Message::Text(text))) => Frame::Text(text),
                Some(Ok(Message::Binary(data))) => Frame::Binary(data),
                Some(Ok(Message::Ping(data))) => Frame::Ping(data),
                Some(Ok(Message::Pong(data))) => Frame::Pong(data),
                Some(Ok(Message::Close(_))) => Frame::Close,
                // raw frames only show up on the write path
                Some(Ok(Message::Frame(_))) => continue,
            };
            return Ok(Some(frame));
        }
    }
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn write_frame(&mut self, text: &str) -> Result<(), StreamError> {
        self.sink.send(Message::Text(text.to_owned())).await.map_err(ws_err)
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.sink.close().await.map_err(ws_err)
    }
}
