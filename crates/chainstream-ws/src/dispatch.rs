//! Read loop and per-frame decode tasks.
//!
//! Frames are read and classified in arrival order. Each event frame is
//! decoded on its own task so a slow decode never stalls ingestion; as a
//! consequence records may reach the caller out of arrival order.
//!
//! A decode task holds a permit until its record is handed over. With every
//! permit taken the loop stops reading, so a caller that stops draining the
//! response channel pushes back on the socket instead of piling up tasks.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, trace, warn};

use chainstream_core::envelope::{self, Envelope};
use chainstream_core::{Classified, Classifier, Response, StreamError};

use crate::client::{wait_raised, Shared};
use crate::transport::{Frame, FrameReader};

pub(crate) struct Dispatcher<R> {
    pub reader: R,
    pub shared: Arc<Shared>,
    pub classifier: Arc<Classifier>,
    pub responses: mpsc::Sender<Response>,
    pub errors: mpsc::UnboundedSender<StreamError>,
    pub idle: Duration,
    /// Bounds in-flight decode tasks.
    pub in_flight: Arc<Semaphore>,
}

impl<R: FrameReader> Dispatcher<R> {
    pub async fn run(mut self) {
        let mut shutdown = self.shared.shutdown_signal();
        let mut armed = self.shared.subscription.armed();

        tokio::select! {
            _ = wait_raised(&mut shutdown) => {
                debug!("read loop cancelled before subscribing");
                return;
            }
            subscribed = wait_raised(&mut armed) => {
                if !subscribed {
                    return;
                }
            }
        }
        debug!("read loop started");

        let mut decoders = JoinSet::new();
        let mut permit: Option<OwnedSemaphorePermit> = None;
        loop {
            tokio::select! {
                biased;
                _ = wait_raised(&mut shutdown) => break,
                Some(joined) = decoders.join_next(), if !decoders.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!(error = %e, "decode task panicked");
                        }
                    }
                }
                acquired = self.in_flight.clone().acquire_owned(), if permit.is_none() => match acquired {
                    Ok(p) => permit = Some(p),
                    Err(_) => break,
                },
                read = time::timeout(self.idle, self.reader.read_frame()), if permit.is_some() => {
                    let flow = match read {
                        Err(_) => self.fail(StreamError::Timeout {
                            ms: self.idle.as_millis() as u64,
                        }),
                        Ok(Err(e)) => self.fail(e),
                        Ok(Ok(None)) => self.fail(StreamError::WebSocket("connection reset without close".into())),
                        Ok(Ok(Some(frame))) => self.on_frame(frame, &mut permit, &mut decoders),
                    };
                    if flow.is_break() {
                        break;
                    }
                }
            }
        }

        // nothing may be delivered once cancelled
        decoders.shutdown().await;
        debug!("read loop ended");
    }

    /// Report a connection-ending error once and cancel.
    fn fail(&self, err: StreamError) -> ControlFlow<()> {
        if err.is_peer_exit() {
            info!("peer closed the stream");
        } else {
            warn!(error = %err, "stream read failed");
        }
        // cancel first so receivers of the error already observe the teardown
        self.shared.cancel();
        let _ = self.errors.send(err);
        ControlFlow::Break(())
    }

    fn on_frame(
        &self,
        frame: Frame,
        permit: &mut Option<OwnedSemaphorePermit>,
        decoders: &mut JoinSet<()>,
    ) -> ControlFlow<()> {
        match frame {
            Frame::Text(text) => self.on_text(text, permit, decoders),
            Frame::Close => self.fail(StreamError::PeerExit),
            Frame::Binary(data) => {
                trace!(len = data.len(), "dropping binary frame");
                ControlFlow::Continue(())
            }
            Frame::Ping(_) | Frame::Pong(_) => ControlFlow::Continue(()),
        }
    }

    fn on_text(
        &self,
        text: String,
        permit: &mut Option<OwnedSemaphorePermit>,
        decoders: &mut JoinSet<()>,
    ) -> ControlFlow<()> {
        let body_start = match envelope::classify(&text) {
            Envelope::Event(body) => text.len() - body.len(),
            other => return self.on_control(other, &text),
        };
        let Some(permit) = permit.take() else {
            return ControlFlow::Continue(());
        };

        let classifier = self.classifier.clone();
        let shared = self.shared.clone();
        let responses = self.responses.clone();
        let errors = self.errors.clone();
        decoders.spawn(decode(text, body_start, permit, classifier, shared, responses, errors));
        ControlFlow::Continue(())
    }

    fn on_control(&self, envelope: Envelope<'_>, text: &str) -> ControlFlow<()> {
        match envelope {
            Envelope::Close | Envelope::Disconnect => return self.fail(StreamError::PeerExit),
            Envelope::Open(Some(handshake)) => {
                debug!(
                    sid = %handshake.sid,
                    ping_interval = handshake.ping_interval,
                    ping_timeout = handshake.ping_timeout,
                    "session opened"
                );
                self.shared.set_handshake(handshake);
            }
            Envelope::Open(None) => debug!("session opened without handshake body"),
            Envelope::Pong => trace!("probe acknowledged"),
            Envelope::Ping | Envelope::Noop | Envelope::Connect => trace!(frame = text, "control frame"),
            Envelope::Other => trace!(frame = %preview(text), "dropping frame"),
            Envelope::Event(_) => {}
        }
        ControlFlow::Continue(())
    }
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(120) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Decode one event frame (its JSON starts at `body_start`) and route the
/// outcome. The permit is released when the task ends.
async fn decode(
    text: String,
    body_start: usize,
    _permit: OwnedSemaphorePermit,
    classifier: Arc<Classifier>,
    shared: Arc<Shared>,
    responses: mpsc::Sender<Response>,
    errors: mpsc::UnboundedSender<StreamError>,
) {
    let outcome = match envelope::decode_event(&text[body_start..]) {
        Ok(Some((event, payload))) => classifier.classify(&event, payload),
        Ok(None) => {
            trace!(frame = %preview(&text), "event frame with unexpected shape");
            return;
        }
        Err(e) => Err(e),
    };

    match outcome {
        Err(e) => {
            debug!(error = %e, "dropping undecodable event");
            let _ = errors.send(e);
        }
        Ok(Classified::Head(head)) => {
            trace!(block_num = head.block_num, "lib update");
            shared.head.apply(head);
        }
        Ok(Classified::Ignored(reason)) => trace!(%reason, "event ignored"),
        Ok(Classified::Record(response)) => {
            let mut shutdown = shared.shutdown_signal();
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                biased;
                _ = wait_raised(&mut shutdown) => {}
                sent = responses.send(response) => {
                    if sent.is_err() {
                        debug!("response receiver dropped");
                    }
                }
            }
        }
    }
}
