//! Stream error types.

use thiserror::Error;

/// Errors that can occur while connecting, subscribing or decoding a stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Dial or websocket handshake failed.
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    /// The endpoint URL could not be turned into a websocket URL.
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),

    /// WebSocket read/write failure on an established connection.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A keepalive probe could not be written. The read loop decides
    /// whether the connection is dead, so this alone is not fatal.
    #[error("keepalive probe failed: {0}")]
    Keepalive(String),

    /// Nothing was received within the idle window.
    #[error("read timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The peer sent its disconnect signal or closed the socket.
    #[error("websocket closed by peer")]
    PeerExit,

    /// The connection has already been torn down.
    #[error("connection closed")]
    Closed,

    /// A subscription already exists on this connection.
    #[error("websocket subscription already active, please use a new client for additional subscriptions")]
    Busy,

    /// The query cannot be sent as-is.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A request could not be serialized.
    #[error("encode error: {0}")]
    Encode(serde_json::Error),

    /// A frame classified as an event was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An event payload could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// Asked a delta response for its action view.
    #[error("not an action")]
    NotAction,

    /// Asked an action response for its delta view.
    #[error("not a delta")]
    NotDelta,
}

impl StreamError {
    /// Returns `true` if this error ends the connection.
    ///
    /// Everything else only affects a single frame or call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::WebSocket(_)
                | Self::Timeout { .. }
                | Self::PeerExit
                | Self::Closed
        )
    }

    /// Returns `true` if the peer asked us to go away.
    pub fn is_peer_exit(&self) -> bool {
        matches!(self, Self::PeerExit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(StreamError::PeerExit.is_fatal());
        assert!(StreamError::Timeout { ms: 25_000 }.is_fatal());
        assert!(StreamError::WebSocket("reset".into()).is_fatal());
        assert!(!StreamError::Busy.is_fatal());
        assert!(!StreamError::Keepalive("broken pipe".into()).is_fatal());
        assert!(!StreamError::Protocol("bad frame".into()).is_fatal());
        assert!(!StreamError::NotDelta.is_fatal());
    }

    #[test]
    fn messages_are_not_empty() {
        for err in [
            StreamError::PeerExit,
            StreamError::Busy,
            StreamError::NotAction,
            StreamError::NotDelta,
            StreamError::Closed,
        ] {
            assert!(!err.to_string().is_empty());
        }
    }
}
