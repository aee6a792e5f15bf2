//! Subscription management.
//!
//! A connection carries at most one subscription for its whole lifetime.
//! The slot records the query once its request has been written and arms
//! the read loop, which stays parked until then because the peer emits no
//! data before a subscription exists.

use std::sync::OnceLock;

use tokio::sync::watch;
use tracing::info;

use chainstream_core::{envelope, Query, StreamError};

use crate::keepalive::SharedWriter;

/// The single subscription slot of a connection.
#[derive(Debug)]
pub struct SubscriptionSlot {
    query: OnceLock<Query>,
    armed: watch::Sender<bool>,
}

impl Default for SubscriptionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionSlot {
    pub fn new() -> Self {
        let (armed, _) = watch::channel(false);
        Self {
            query: OnceLock::new(),
            armed,
        }
    }

    /// Returns `true` once a request has been sent.
    pub fn is_active(&self) -> bool {
        self.query.get().is_some()
    }

    /// The query this connection is streaming, if any.
    pub fn query(&self) -> Option<&Query> {
        self.query.get()
    }

    /// Receiver that flips to `true` when the subscription is sent.
    pub fn armed(&self) -> watch::Receiver<bool> {
        self.armed.subscribe()
    }

    fn activate(&self, query: Query) {
        let _ = self.query.set(query);
        self.armed.send_replace(true);
    }
}

/// Validate, encode and write `query`, then arm the read loop.
///
/// Nothing is written and the slot is left untouched unless every step
/// succeeds.
pub(crate) async fn subscribe(
    slot: &SubscriptionSlot,
    writer: &SharedWriter,
    query: Query,
) -> Result<(), StreamError> {
    if slot.is_active() {
        return Err(StreamError::Busy);
    }
    query.validate()?;
    let frame = envelope::encode_event(query.event_name(), &query)?;

    let mut w = writer.lock().await;
    // re-checked under the writer lock: two callers may have raced past the first check
    if slot.is_active() {
        return Err(StreamError::Busy);
    }
    w.write_frame(&frame).await?;
    let event = query.event_name();
    // armed before the lock is released so a waiting caller sees Busy
    slot.activate(query);
    drop(w);

    info!(event, "subscription request sent");
    Ok(())
}
