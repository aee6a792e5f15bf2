//! chainstream-ws: websocket client for Hyperion-style blockchain streams.
//!
//! # Features
//! - One subscription per connection (`action_stream_request` or `delta_stream_request`)
//! - Keepalive probes and an idle deadline on reads
//! - Last irreversible block tracking from `lib_update` events
//! - Per-frame decode errors on a side channel; the stream keeps going
//! - Single cancellation signal with graceful disconnect

pub mod client;
pub mod config;
mod dispatch;
pub mod head;
mod keepalive;
pub mod subscription;
pub mod transport;

pub use client::{ConnectionState, StreamClient, Streams};
pub use config::ClientConfig;
pub use head::HeadState;
pub use subscription::SubscriptionSlot;
pub use transport::{Frame, FrameReader, FrameWriter};

pub use chainstream_core::{
    ActionQuery, ActionTrace, Bound, ChainHead, DeltaQuery, Mode, Query, RecordKind, Response, StreamError,
    TableDelta, TraceKinds,
};
