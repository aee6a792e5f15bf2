//! Keepalive: the only task that writes probe frames.
//!
//! The peer drops clients that stay silent for its idle window, so a probe
//! (`2`) is written every period. A failed probe is reported as
//! [`StreamError::Keepalive`], which is not fatal; the read loop decides
//! when the connection is dead. On cancellation the task writes the
//! graceful disconnect (`41`) and closes the socket.
//!
//! Unless the period is configured explicitly, the `pingInterval` from the
//! peer's open handshake replaces it when it is shorter. It is never
//! lengthened: probes also keep the read side's idle deadline fed through
//! the peer's acks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use chainstream_core::envelope::{DISCONNECT, PROBE};
use chainstream_core::{Handshake, StreamError};

use crate::client::wait_raised;
use crate::transport::FrameWriter;

/// Write half shared by keepalive and the subscription.
pub(crate) type SharedWriter = Arc<Mutex<Box<dyn FrameWriter>>>;

pub(crate) fn shared_writer<W: FrameWriter>(writer: W) -> SharedWriter {
    let boxed: Box<dyn FrameWriter> = Box::new(writer);
    Arc::new(Mutex::new(boxed))
}

const TEARDOWN_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

fn schedule(period: Duration) -> time::Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Probe period announced in the peer's handshake, once it arrives.
async fn peer_period(hint: &mut Option<watch::Receiver<Option<Handshake>>>) -> Option<Duration> {
    let rx = hint.as_mut()?;
    if rx.wait_for(Option::is_some).await.is_err() {
        return None;
    }
    let announced = rx.borrow().as_ref().map_or(0, |h| h.ping_interval);
    (announced > 0).then(|| Duration::from_millis(announced))
}

pub(crate) async fn run(
    writer: SharedWriter,
    mut period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut peer_hint: Option<watch::Receiver<Option<Handshake>>>,
    errors: mpsc::UnboundedSender<StreamError>,
) {
    let mut ticker = schedule(period);

    loop {
        tokio::select! {
            _ = wait_raised(&mut shutdown) => break,
            hinted = peer_period(&mut peer_hint), if peer_hint.is_some() => {
                peer_hint = None;
                if let Some(hinted) = hinted.filter(|p| *p < period) {
                    debug!(period_ms = hinted.as_millis() as u64, "adopting peer ping interval");
                    period = hinted;
                    ticker = schedule(period);
                }
            }
            _ = ticker.tick() => {
                trace!("sending keepalive probe");
                let probe = async { writer.lock().await.write_frame(PROBE).await };
                let result = match time::timeout(period, probe).await {
                    Ok(r) => r.map_err(|e| StreamError::Keepalive(e.to_string())),
                    Err(_) => Err(StreamError::Keepalive(format!(
                        "probe not written within {}ms",
                        period.as_millis()
                    ))),
                };
                if let Err(e) = result {
                    warn!(error = %e, "keepalive probe failed");
                    let _ = errors.send(e);
                }
            }
        }
    }

    let teardown = async {
        let mut w = writer.lock().await;
        if let Err(e) = w.write_frame(DISCONNECT).await {
            debug!(error = %e, "disconnect frame not sent");
        }
        if let Err(e) = w.close().await {
            debug!(error = %e, "socket close failed");
        }
    };
    if time::timeout(TEARDOWN_WRITE_TIMEOUT, teardown).await.is_err() {
        debug!("socket teardown timed out");
    }
    debug!("keepalive loop ended");
}
