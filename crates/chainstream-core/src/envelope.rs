//! Engine.IO v3 / socket.io v2 text-frame envelope.
//!
//! Every inbound text frame starts with a packet-type prefix:
//!
//! | prefix | meaning                          |
//! |--------|----------------------------------|
//! | `0`    | open, followed by handshake JSON |
//! | `1`    | close                            |
//! | `2`    | ping                             |
//! | `3`    | pong (answer to our probe)       |
//! | `6`    | noop                             |
//! | `40`   | namespace connect                |
//! | `41`   | namespace disconnect             |
//! | `42`   | event: `["name", payload]`       |
//!
//! Outbound requests are emitted as `420["name", body]`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::StreamError;

/// Path and query string selecting the transport the peer expects.
pub const SOCKET_PATH: &str = "/socket.io/?EIO=3&transport=websocket";

/// Liveness probe.
pub const PROBE: &str = "2";

/// Graceful namespace disconnect.
pub const DISCONNECT: &str = "41";

const EVENT_PREFIX: &str = "42";
const EMIT_PREFIX: &str = "420";

/// Body of the `0` open packet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Handshake {
    pub sid: String,
    pub upgrades: Vec<String>,
    /// Milliseconds between client probes the peer expects.
    pub ping_interval: u64,
    /// Milliseconds the peer waits for a probe before dropping us.
    pub ping_timeout: u64,
}

/// Classification of one inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope<'a> {
    /// `None` when the handshake body did not parse.
    Open(Option<Handshake>),
    Close,
    Ping,
    Pong,
    Noop,
    Connect,
    Disconnect,
    /// Event frame; holds the JSON text after the `42` prefix.
    Event(&'a str),
    /// Anything else (acks, errors, binary placeholders, upgrades).
    Other,
}

impl Envelope<'_> {
    /// Control frames are consumed by the connection and never surfaced.
    pub fn is_control(&self) -> bool {
        !matches!(self, Self::Event(_) | Self::Other)
    }

    /// The peer is going away.
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Close | Self::Disconnect)
    }
}

/// Classify a frame by its prefix. Does not parse event payloads.
pub fn classify(text: &str) -> Envelope<'_> {
    if let Some(rest) = text.strip_prefix(EVENT_PREFIX) {
        return Envelope::Event(rest);
    }
    match text {
        "1" => Envelope::Close,
        "2" => Envelope::Ping,
        "3" => Envelope::Pong,
        "6" => Envelope::Noop,
        "40" => Envelope::Connect,
        "41" => Envelope::Disconnect,
        _ => match text.strip_prefix('0') {
            Some(body) if body.starts_with('{') => {
                Envelope::Open(serde_json::from_str(body).ok())
            }
            Some("") => Envelope::Open(None),
            _ if text.starts_with("40") => Envelope::Connect,
            _ => Envelope::Other,
        },
    }
}

/// Decode the body of an event frame into `(event name, payload)`.
///
/// Invalid JSON is a protocol error. Valid JSON of the wrong shape (not an
/// array, not exactly two elements, a non-string name) is `Ok(None)`: the
/// peer interleaves status messages of other shapes on the same stream.
pub fn decode_event(body: &str) -> Result<Option<(String, Value)>, StreamError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| StreamError::Protocol(format!("malformed event frame: {e}")))?;
    let Value::Array(mut items) = value else {
        return Ok(None);
    };
    if items.len() != 2 {
        return Ok(None);
    }
    let payload = items.pop().unwrap_or(Value::Null);
    match items.pop() {
        Some(Value::String(name)) => Ok(Some((name, payload))),
        _ => Ok(None),
    }
}

/// Encode an outbound event emission: `420["name",<body>]`.
pub fn encode_event<T: Serialize + ?Sized>(name: &str, body: &T) -> Result<String, StreamError> {
    let frame = serde_json::to_string(&(name, body)).map_err(StreamError::Encode)?;
    Ok(format!("{EMIT_PREFIX}{frame}"))
}

/// Build the websocket URL for a caller-supplied base URL.
///
/// Trailing slashes are trimmed and `http(s)` is mapped to `ws(s)`.
pub fn endpoint(base: &str) -> Result<String, StreamError> {
    let trimmed = base.trim().trim_end_matches('/');
    let parsed = Url::parse(trimmed).map_err(|e| StreamError::InvalidUrl(format!("{trimmed}: {e}")))?;
    let scheme = match parsed.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(StreamError::InvalidUrl(format!(
                "unsupported scheme '{other}' in {trimmed}"
            )))
        }
    };
    if parsed.host_str().is_none() {
        return Err(StreamError::InvalidUrl(format!("missing host in {trimmed}")));
    }
    let rest = &trimmed[parsed.scheme().len()..];
    Ok(format!("{scheme}{rest}{SOCKET_PATH}"))
}
