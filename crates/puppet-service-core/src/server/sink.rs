//! Event stream sink.
//!
//! Bridges the puppet's event bus to at most one remote subscriber. While a
//! subscriber is attached the sink holds exactly one listener per transmitted
//! event kind; every event those listeners see is encoded, stamped with the
//! next sequence number and queued for the connection writer.
//!
//! ```text
//!            attach (ok)
//!   Idle  ------------------>  Attached(stream id)
//!    ^                              |
//!    |   teardown(id, signal)       |
//!    +------------------------------+
//!        detach()
//! ```
//!
//! The sequence counter belongs to the sink, not to an attachment, so it keeps
//! counting across reattachments. A subscriber that resumes from a sequence
//! number ahead of the counter (the server restarted) pushes the counter up to
//! it.

use crate::codec::encode_envelope;
use crate::config::StreamConfig;
use crate::emitter::ListenerId;
use crate::error::{PuppetServiceError, Result};
use crate::event::{EventEnvelope, EventKind, PuppetEvent};
use crate::puppet::Puppet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How an attached stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Teardown {
    /// The subscriber asked to stop.
    Cancelled,
    /// Reading from or writing to the subscriber failed.
    Error(String),
    /// The server detached the subscriber itself.
    Finish,
    /// The subscriber closed its side.
    End,
    /// The server is shutting down.
    Close,
}

impl fmt::Display for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Teardown::Cancelled => write!(f, "cancelled"),
            Teardown::Error(e) => write!(f, "error: {}", e),
            Teardown::Finish => write!(f, "finish"),
            Teardown::End => write!(f, "end"),
            Teardown::Close => write!(f, "close"),
        }
    }
}

/// Receiving half of an attachment, drained by the connection writer.
///
/// `recv` returns `None` once the attachment has been torn down and every
/// queued envelope has been taken.
#[derive(Debug)]
pub struct StreamReceiver {
    id: u64,
    rx: mpsc::UnboundedReceiver<EventEnvelope>,
}

impl StreamReceiver {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }
}

struct Attachment {
    id: u64,
    tx: mpsc::UnboundedSender<EventEnvelope>,
    listeners: Vec<ListenerId>,
    ready_timer: Option<JoinHandle<()>>,
}

enum SinkState {
    Idle,
    Attached(Attachment),
}

struct SinkInner {
    state: SinkState,
    last_seq: u64,
}

impl SinkInner {
    fn next_seq(&mut self, kind: EventKind) -> Option<u64> {
        if kind.is_sequenced() {
            self.last_seq += 1;
            Some(self.last_seq)
        } else {
            None
        }
    }
}

/// Forwards puppet events to the single attached subscriber.
pub struct EventStreamSink<P: Puppet> {
    puppet: Arc<P>,
    inner: Mutex<SinkInner>,
    next_stream_id: AtomicU64,
    ready_grace: Duration,
    this: Weak<Self>,
}

impl<P: Puppet> EventStreamSink<P> {
    pub fn new(puppet: Arc<P>) -> Arc<Self> {
        Self::with_ready_grace(puppet, StreamConfig::READY_GRACE)
    }

    /// Create a sink with a custom delay before `ready` is re-announced.
    pub fn with_ready_grace(puppet: Arc<P>, ready_grace: Duration) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            puppet,
            inner: Mutex::new(SinkInner {
                state: SinkState::Idle,
                last_seq: 0,
            }),
            next_stream_id: AtomicU64::new(1),
            ready_grace,
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SinkInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn puppet(&self) -> &Arc<P> {
        &self.puppet
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.lock().state, SinkState::Attached(_))
    }

    /// Id of the current attachment, if any.
    pub fn attached_stream(&self) -> Option<u64> {
        match &self.lock().state {
            SinkState::Attached(att) => Some(att.id),
            SinkState::Idle => None,
        }
    }

    /// Last sequence number handed out.
    pub fn last_seq(&self) -> u64 {
        self.lock().last_seq
    }

    /// Attach a new subscriber.
    ///
    /// The first envelope queued is always a `heartbeat`. If the puppet is
    /// logged in it is followed by a synthesized `login`; if it is ready a
    /// `ready` follows after the grace delay, provided this attachment is still
    /// the current one by then.
    pub fn attach(&self, resume_seq: Option<u64>) -> Result<StreamReceiver> {
        let mut inner = self.lock();
        if let SinkState::Attached(current) = &inner.state {
            warn!(
                "Rejecting event subscriber: stream {} is already attached",
                current.id
            );
            return Err(PuppetServiceError::AlreadyBusy);
        }

        if let Some(resume) = resume_seq {
            if resume > inner.last_seq {
                info!(
                    "Subscriber resumes from seq {} ahead of local counter {}, bumping",
                    resume, inner.last_seq
                );
                inner.last_seq = resume;
            }
        }

        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        // Nothing else can be queued before this: forwarding needs the lock.
        let heartbeat = encode_envelope(
            &PuppetEvent::heartbeat(StreamConfig::STREAM_READY_HEARTBEAT),
            None,
        )?;
        let _ = tx.send(heartbeat);

        let listeners: Vec<ListenerId> = EventKind::transmitted()
            .map(|kind| {
                let sink = self.this.clone();
                self.puppet.events().on(kind, move |event| {
                    if let Some(sink) = sink.upgrade() {
                        sink.forward(event);
                    }
                })
            })
            .collect();

        if let Some(user_id) = self
            .puppet
            .current_user_id()
            .filter(|_| self.puppet.is_logged_in())
        {
            let login = PuppetEvent::login(user_id);
            let seq = inner.next_seq(EventKind::Login);
            let _ = tx.send(encode_envelope(&login, seq)?);
        }

        let ready_timer = self.puppet.is_ready().then(|| {
            let sink = self.this.clone();
            let grace = self.ready_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if let Some(sink) = sink.upgrade() {
                    sink.announce_ready(id);
                }
            })
        });

        inner.state = SinkState::Attached(Attachment {
            id,
            tx,
            listeners,
            ready_timer,
        });

        info!(
            "Event stream {} attached (resume {:?}, last seq {})",
            id, resume_seq, inner.last_seq
        );
        Ok(StreamReceiver { id, rx })
    }

    fn announce_ready(&self, stream_id: u64) {
        let mut inner = self.lock();
        let SinkInner { state, last_seq } = &mut *inner;
        let SinkState::Attached(att) = state else {
            debug!("Stream {} gone before ready grace elapsed", stream_id);
            return;
        };
        if att.id != stream_id {
            debug!("Stream {} replaced before ready grace elapsed", stream_id);
            return;
        }

        match encode_envelope(&PuppetEvent::ready("ready"), None) {
            Ok(mut envelope) => {
                *last_seq += 1;
                envelope.seq = Some(*last_seq);
                let _ = att.tx.send(envelope);
                debug!("Re-announced ready on stream {}", stream_id);
            }
            Err(e) => warn!("Failed to encode ready event: {}", e),
        }
    }

    fn forward(&self, event: &PuppetEvent) {
        if let Err(e) = self.emit(event) {
            warn!("Dropping {} event: {}", event.kind(), e);
        }
    }

    /// Encode and queue one event for the attached subscriber.
    ///
    /// Returns `Ok(false)` when nothing is attached; the event is dropped.
    pub fn emit(&self, event: &PuppetEvent) -> Result<bool> {
        let kind = event.kind();
        if !kind.is_transmitted() {
            return Err(PuppetServiceError::ResetNotTransmittable);
        }
        let mut envelope = encode_envelope(event, None)?;

        let mut inner = self.lock();
        let stream_id = match &inner.state {
            SinkState::Attached(att) => att.id,
            SinkState::Idle => {
                warn!("No event stream attached, dropping {} event", kind);
                return Ok(false);
            }
        };
        envelope.seq = inner.next_seq(kind);

        let sent = match &inner.state {
            SinkState::Attached(att) => att.tx.send(envelope).is_ok(),
            SinkState::Idle => false,
        };
        if sent {
            return Ok(true);
        }

        // The writer is gone without reporting it; clean up here.
        let state = std::mem::replace(&mut inner.state, SinkState::Idle);
        drop(inner);
        if let SinkState::Attached(att) = state {
            self.release(att, &Teardown::Close);
        }
        warn!("Event stream {} writer vanished, dropped {} event", stream_id, kind);
        Ok(false)
    }

    /// Report how stream `stream_id` ended.
    ///
    /// Only the first report for the current attachment has any effect; the
    /// rest (and reports for attachments already replaced) return `false`.
    pub fn teardown(&self, stream_id: u64, signal: Teardown) -> bool {
        let mut inner = self.lock();
        match &inner.state {
            SinkState::Attached(att) if att.id == stream_id => {}
            _ => {
                debug!(
                    "Ignoring teardown ({}) for stream {}: not attached",
                    signal, stream_id
                );
                return false;
            }
        }
        let state = std::mem::replace(&mut inner.state, SinkState::Idle);
        drop(inner);
        if let SinkState::Attached(att) = state {
            self.release(att, &signal);
        }
        true
    }

    /// Detach the current subscriber.
    pub fn detach(&self) -> Result<()> {
        let state = std::mem::replace(&mut self.lock().state, SinkState::Idle);
        match state {
            SinkState::Attached(att) => {
                self.release(att, &Teardown::Finish);
                Ok(())
            }
            SinkState::Idle => Err(PuppetServiceError::NotAttached),
        }
    }

    fn release(&self, att: Attachment, signal: &Teardown) {
        let removed = self.puppet.events().off_all(&att.listeners);
        if let Some(timer) = att.ready_timer {
            timer.abort();
        }
        info!(
            "Event stream {} detached ({}), removed {} listeners",
            att.id, signal, removed
        );
    }
}

impl<P: Puppet> fmt::Debug for EventStreamSink<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStreamSink")
            .field("attached", &self.attached_stream())
            .field("last_seq", &self.last_seq())
            .finish()
    }
}
