//! Client configuration.

use std::time::Duration;

use chainstream_core::TraceKinds;
use serde::{Deserialize, Serialize};

/// Configuration for a [`StreamClient`](crate::StreamClient) connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Skip TLS certificate and hostname verification.
    #[serde(default)]
    pub insecure_tls: bool,
    /// `User-Agent` sent with the websocket handshake.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Extra handshake headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Read idle window; the connection is declared dead after this long
    /// without an inbound frame.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Probe period. Defaults to two thirds of the idle window.
    #[serde(default)]
    pub ping_interval_ms: Option<u64>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Largest inbound websocket message accepted.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Capacity of the response channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// How long `close()` waits for background tasks before aborting them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub trace_kinds: TraceKinds,
}

fn default_user_agent() -> String {
    format!("chainstream/{}", env!("CARGO_PKG_VERSION"))
}
fn default_idle_timeout_ms() -> u64 { 25_000 }
fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_max_message_size() -> usize { 8_192 }
fn default_channel_capacity() -> usize { 1_024 }
fn default_shutdown_grace_ms() -> u64 { 2_000 }

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            insecure_tls: false,
            user_agent: default_user_agent(),
            headers: vec![],
            idle_timeout_ms: default_idle_timeout_ms(),
            ping_interval_ms: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            max_message_size: default_max_message_size(),
            channel_capacity: default_channel_capacity(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            trace_kinds: TraceKinds::default(),
        }
    }
}

impl ClientConfig {
    pub fn insecure(mut self) -> Self {
        self.insecure_tls = true;
        self
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Add a handshake header (can be called multiple times).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout_ms = idle.as_millis() as u64;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_trace_kinds(mut self, kinds: TraceKinds) -> Self {
        self.trace_kinds = kinds;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        let ms = self
            .ping_interval_ms
            .unwrap_or(self.idle_timeout_ms * 2 / 3)
            .max(1);
        Duration::from_millis(ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
