//! Client puppet session.
//!
//! A [`PuppetSession`] stands in for a remote puppet: it re-raises the remote
//! event stream on its own emitter and proxies the façade operations. Its main
//! job is keeping the stream alive without disturbing the automation layer
//! above it.
//!
//! # Reset
//!
//! When the stream breaks, [`PuppetSession::reset`] first tries the fast path:
//! resubscribe over the existing transport, resuming from the watermark, and
//! accept the stream only if the server logs back in as the same account.
//! No login or logout is raised to the automation layer on that path. Any
//! failure falls back to a full reset: a synthetic `logout`, transport teardown,
//! watermark and cache cleared, and a fresh start.
//!
//! ```text
//!  reset() --(no transport / not logged in)--------------------> full reset
//!     |
//!     +--(reconnect already running)--> return
//!     |
//!  stop stream -> arm login/ready waiters -> resubscribe (retry, budget)
//!     |                                           |
//!     |                                  (budget exhausted) ----> full reset
//!  wait login (same account) --(mismatch / timeout)-------------> full reset
//!     |
//!  release gate -> wait ready (non-fatal) -> done
//! ```

use super::cache::PayloadCache;
use super::transport::{
    EventTransport, StreamEvent, StreamEventKind, TcpConnector, TransportConnector,
};
use super::watermark::{watermark_key, Watermark, WatermarkStore};
use crate::codec::event::dirty_type_to_wire;
use crate::codec::payload::{
    contact_from_wire, message_from_wire, room_from_wire, ContactRecord, MessageRecord, RoomRecord,
};
use crate::codec::decode_envelope;
use crate::config::{ClientOptions, FileBoxConfig, ReconnectConfig, SessionConfig};
use crate::emitter::{Emitter, ListenerId};
use crate::error::{PuppetServiceError, Result};
use crate::event::{DirtyType, EventEnvelope, EventKind, PuppetEvent};
use crate::filebox::{new_content_id, FileBox, FileBoxAssembler, FileBoxMeta, FileChunk};
use crate::ipc::protocol::method;
use crate::puppet::{ContactPayload, MessagePayload, RoomPayload};
use crate::retry::{retry_async, RetryConfig};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Timing of the fast-path reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectTiming {
    pub attempt_timeout: Duration,
    pub retry_delay: Duration,
    pub login_timeout: Duration,
    pub ready_timeout: Duration,
}

impl Default for ReconnectTiming {
    fn default() -> Self {
        Self {
            attempt_timeout: ReconnectConfig::ATTEMPT_TIMEOUT,
            retry_delay: ReconnectConfig::RETRY_DELAY,
            login_timeout: ReconnectConfig::LOGIN_TIMEOUT,
            ready_timeout: ReconnectConfig::READY_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client: ClientOptions,
    pub timing: ReconnectTiming,
    pub watermark_stale_after: Duration,
}

impl SessionOptions {
    pub fn new(client: ClientOptions) -> Self {
        Self {
            client,
            timing: ReconnectTiming::default(),
            watermark_stale_after: SessionConfig::WATERMARK_STALE_AFTER,
        }
    }

    pub fn with_timing(mut self, timing: ReconnectTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_watermark_stale_after(mut self, max_age: Duration) -> Self {
        self.watermark_stale_after = max_age;
        self
    }
}

/// Sets a flag for as long as it is alive.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    /// Take the flag only if nobody holds it.
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }

    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A stream listener removed again when dropped.
struct TransientListener {
    transport: Arc<dyn EventTransport>,
    id: ListenerId,
}

impl Drop for TransientListener {
    fn drop(&mut self) {
        self.transport.events().off(self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn field<T: DeserializeOwned>(mut value: Value, name: &str) -> Result<T> {
    let inner = value.get_mut(name).map(Value::take).unwrap_or(Value::Null);
    serde_json::from_value(inner).map_err(|e| {
        PuppetServiceError::payload("response", format!("field {}: {}", name, e))
    })
}

/// Client side stand-in for a remote puppet.
pub struct PuppetSession {
    options: SessionOptions,
    connector: Arc<dyn TransportConnector>,
    transport: RwLock<Option<Arc<dyn EventTransport>>>,
    stream_listeners: Mutex<Vec<ListenerId>>,
    events: Emitter<PuppetEvent>,
    cache: PayloadCache,
    watermarks: Arc<dyn WatermarkStore>,
    watermark_key: String,
    watermark: Mutex<Option<Watermark>>,
    current_user: Mutex<Option<String>>,
    held: Mutex<Vec<PuppetEvent>>,
    logged_in: AtomicBool,
    ready: AtomicBool,
    reconnecting: AtomicBool,
    resetting: AtomicBool,
    waiting_for_login: AtomicBool,
    waiting_for_ready: AtomicBool,
    stopping: AtomicBool,
    this: Weak<Self>,
}

impl PuppetSession {
    /// Session over TCP to `options.client.endpoint`.
    pub fn new(options: SessionOptions, watermarks: Arc<dyn WatermarkStore>) -> Arc<Self> {
        let connector = Arc::new(TcpConnector::new(options.client.clone()));
        Self::with_connector(options, connector, watermarks)
    }

    pub fn with_connector(
        options: SessionOptions,
        connector: Arc<dyn TransportConnector>,
        watermarks: Arc<dyn WatermarkStore>,
    ) -> Arc<Self> {
        let key = watermark_key(&options.client.endpoint, &options.client.token);
        Arc::new_cyclic(|this| Self {
            options,
            connector,
            transport: RwLock::new(None),
            stream_listeners: Mutex::new(Vec::new()),
            events: Emitter::new(),
            cache: PayloadCache::default(),
            watermarks,
            watermark_key: key,
            watermark: Mutex::new(None),
            current_user: Mutex::new(None),
            held: Mutex::new(Vec::new()),
            logged_in: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            resetting: AtomicBool::new(false),
            waiting_for_login: AtomicBool::new(false),
            waiting_for_ready: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Events for the automation layer.
    pub fn events(&self) -> &Emitter<PuppetEvent> {
        &self.events
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Whether a fast-path reconnect currently holds the gate.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    pub fn current_user_id(&self) -> Option<String> {
        lock(&self.current_user).clone()
    }

    pub fn watermark(&self) -> Option<Watermark> {
        lock(&self.watermark).clone()
    }

    /// Fixed-delay retry bounded by the client's retry budget.
    fn retry_config(&self) -> RetryConfig {
        RetryConfig::fixed(self.options.timing.retry_delay)
            .with_attempt_timeout(self.options.timing.attempt_timeout)
            .with_budget(self.options.client.retry_budget())
    }

    fn transport(&self) -> Result<Arc<dyn EventTransport>> {
        self.transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(PuppetServiceError::NoTransport)
    }

    fn take_transport(&self) -> Option<Arc<dyn EventTransport>> {
        self.transport
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    // --- lifecycle -------------------------------------------------------

    /// Connect, subscribe (resuming from a fresh enough watermark) and start
    /// the remote puppet.
    pub async fn start(&self) -> Result<()> {
        if self.transport().is_ok() {
            warn!("Session already started");
            return Ok(());
        }
        self.stopping.store(false, Ordering::SeqCst);
        self.options.client.validate()?;

        let resume = self.load_watermark();
        let resume_seq = resume.as_ref().map(|w| w.last_event_seq);
        let account_id = resume.and_then(|w| w.account_id);

        let transport = self.connector.create();
        self.attach_listeners(&transport);
        *self.transport.write().unwrap_or_else(|e| e.into_inner()) = Some(transport.clone());

        let started = async {
            if let Err(e) = transport.start(resume_seq, account_id.clone()).await {
                if !matches!(e, PuppetServiceError::AlreadyBusy) {
                    return Err(e);
                }
                // A previous subscriber of ours may still be draining server side.
                debug!("Event stream busy, retrying subscription");
                let (result, _) = retry_async(
                    &self.retry_config(),
                    || transport.start_stream(resume_seq, account_id.clone()),
                    |e| matches!(e, PuppetServiceError::AlreadyBusy),
                )
                .await;
                result?;
            }
            transport.call(method::START, json!({})).await?;
            Ok::<_, PuppetServiceError>(())
        }
        .await;

        if let Err(e) = started {
            if e.is_transport_establishment() {
                error!("Session rejected by {}: {}", self.options.client.endpoint, e);
            } else {
                warn!("Session start failed: {}", e);
            }
            self.take_transport();
            self.release_transport(&transport).await;
            return Err(e);
        }

        info!(
            "Session started against {} (resume {:?})",
            self.options.client.endpoint, resume_seq
        );
        Ok(())
    }

    /// Stop the remote puppet and tear the transport down.
    ///
    /// The server answers a remote stop with a `logout` whose reason is
    /// `puppet stop()`; that one is expected. If it does not arrive in time a
    /// synthetic one is raised instead, so the automation layer always sees
    /// exactly one logout.
    pub async fn stop(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);

        let Some(transport) = self.take_transport() else {
            debug!("Session not started, nothing to stop");
            return Ok(());
        };

        if let Err(e) = transport.call(method::STOP, json!({})).await {
            warn!("Remote stop failed: {}", e);
        }
        self.release_transport(&transport).await;
        self.raise_local_logout(SessionConfig::STOP_LOGOUT_REASON);

        info!("Session stopped");
        Ok(())
    }

    fn attach_listeners(&self, transport: &Arc<dyn EventTransport>) {
        let mut ids = Vec::with_capacity(3);

        let this = self.this.clone();
        ids.push(
            transport
                .events()
                .on(StreamEventKind::Data, move |event| {
                    if let (Some(session), StreamEvent::Data(envelope)) = (this.upgrade(), event) {
                        session.on_stream_data(envelope);
                    }
                }),
        );

        for kind in [StreamEventKind::End, StreamEventKind::Error] {
            let this = self.this.clone();
            ids.push(transport.events().on(kind, move |event| {
                if let Some(session) = this.upgrade() {
                    session.on_stream_broken(event);
                }
            }));
        }

        *lock(&self.stream_listeners) = ids;
    }

    fn detach_listeners(&self, transport: &Arc<dyn EventTransport>) {
        let ids = std::mem::take(&mut *lock(&self.stream_listeners));
        transport.events().off_all(&ids);
    }

    async fn release_transport(&self, transport: &Arc<dyn EventTransport>) {
        self.detach_listeners(transport);
        if let Err(e) = transport.stop().await {
            warn!("Transport stop failed: {}", e);
        }
    }

    /// Raise a logout nobody on the wire sent, if still logged in.
    fn raise_local_logout(&self, reason: &str) {
        self.ready.store(false, Ordering::SeqCst);
        if !self.logged_in.swap(false, Ordering::SeqCst) {
            return;
        }
        let contact_id = lock(&self.current_user).take().unwrap_or_default();
        info!("Raising local logout for {} ({})", contact_id, reason);
        self.events.emit(&PuppetEvent::logout(contact_id, reason));
    }

    // --- watermark -------------------------------------------------------

    fn load_watermark(&self) -> Option<Watermark> {
        let stored = match self.watermarks.get(&self.watermark_key) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to read watermark: {}", e);
                None
            }
        };

        let fresh = match stored {
            Some(mark) if mark.is_stale(Utc::now(), self.options.watermark_stale_after) => {
                info!(
                    "Discarding stale watermark (seq {}, last event {})",
                    mark.last_event_seq, mark.last_event_at
                );
                if let Err(e) = self.watermarks.delete(&self.watermark_key) {
                    warn!("Failed to delete stale watermark: {}", e);
                }
                None
            }
            other => other,
        };

        *lock(&self.watermark) = fresh.clone();
        fresh
    }

    fn store_watermark(&self, mark: &Watermark) {
        if let Err(e) = self.watermarks.set(&self.watermark_key, mark) {
            warn!("Failed to persist watermark: {}", e);
        }
    }

    /// Record `seq` as processed. Returns `false` if it was already seen.
    fn advance_watermark(&self, seq: u64) -> bool {
        let mut current = lock(&self.watermark);
        if current.as_ref().is_some_and(|w| seq <= w.last_event_seq) {
            return false;
        }
        let account_id = current
            .as_ref()
            .and_then(|w| w.account_id.clone())
            .or_else(|| self.current_user_id());
        let mark = Watermark::new(seq, account_id);
        self.store_watermark(&mark);
        *current = Some(mark);
        true
    }

    /// Bind the watermark to `account_id`, restarting it from the current
    /// seq. Returns the account it belonged to before, if that was another one.
    fn bind_watermark_account(&self, account_id: &str) -> Option<String> {
        let mut current = lock(&self.watermark);
        let mark = current.as_ref()?;
        if mark.account_id.as_deref() == Some(account_id) {
            return None;
        }
        let previous = mark.account_id.clone();
        let rebound = Watermark::new(mark.last_event_seq, Some(account_id.to_string()));
        self.store_watermark(&rebound);
        *current = Some(rebound);
        previous
    }

    fn clear_watermark(&self) {
        lock(&self.watermark).take();
        if let Err(e) = self.watermarks.delete(&self.watermark_key) {
            warn!("Failed to delete watermark: {}", e);
        }
    }

    // --- stream handling -------------------------------------------------

    fn on_stream_data(&self, envelope: &EventEnvelope) {
        let event = match decode_envelope(envelope) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping undecodable {} event: {}", envelope.kind, e);
                return;
            }
        };

        if let Some(seq) = envelope.seq {
            if !self.advance_watermark(seq) {
                debug!("Ignoring already processed {} event (seq {})", envelope.kind, seq);
                return;
            }
        }

        self.handle_event(event);
    }

    fn handle_event(&self, event: PuppetEvent) {
        if self.waiting_for_login.load(Ordering::SeqCst)
            && !matches!(event, PuppetEvent::Heartbeat { .. })
        {
            match event {
                PuppetEvent::Login { contact_id } => {
                    debug!("Login for {} held for reconnect validation", contact_id);
                }
                other => {
                    debug!("Holding {} event until the login is validated", other.kind());
                    lock(&self.held).push(other);
                }
            }
            return;
        }

        match &event {
            PuppetEvent::Login { contact_id } => {
                let previous_user = lock(&self.current_user).replace(contact_id.clone());
                let previous_owner = self.bind_watermark_account(contact_id);
                let switched_from = previous_user
                    .filter(|id| id != contact_id)
                    .or(previous_owner);
                if let Some(old) = switched_from {
                    warn!("Account switched from {} to {}, dropping its state", old, contact_id);
                    self.cache.clear();
                    if self.logged_in.swap(false, Ordering::SeqCst) {
                        self.ready.store(false, Ordering::SeqCst);
                        self.events.emit(&PuppetEvent::logout(
                            old,
                            SessionConfig::SWITCH_LOGOUT_REASON,
                        ));
                    }
                }
                if self.logged_in.swap(true, Ordering::SeqCst) {
                    debug!("Suppressing duplicate login for {}", contact_id);
                    return;
                }
                info!("Logged in as {}", contact_id);
            }
            PuppetEvent::Logout { contact_id, data } => {
                let expected =
                    self.stopping.load(Ordering::SeqCst) && data == SessionConfig::STOP_LOGOUT_REASON;
                let was_logged_in = self.logged_in.swap(false, Ordering::SeqCst);
                self.ready.store(false, Ordering::SeqCst);
                lock(&self.current_user).take();
                self.clear_watermark();
                self.cache.clear();

                if !was_logged_in {
                    if expected {
                        debug!("Logout for {} during stop after local logout", contact_id);
                    } else {
                        warn!("Logout for {} while not logged in ({})", contact_id, data);
                    }
                    return;
                }
                if expected {
                    debug!("Logout for {} during stop is expected", contact_id);
                } else {
                    info!("Logged out {}: {}", contact_id, data);
                }
            }
            PuppetEvent::Ready { .. } => {
                if self.waiting_for_ready.load(Ordering::SeqCst) {
                    debug!("Ready held for reconnect");
                    return;
                }
                if self.ready.swap(true, Ordering::SeqCst) {
                    debug!("Suppressing duplicate ready");
                    return;
                }
            }
            PuppetEvent::Dirty {
                payload_type,
                payload_id,
            } => {
                self.cache.invalidate(*payload_type, payload_id);
            }
            _ => {}
        }

        self.events.emit(&event);
    }

    fn on_stream_broken(&self, event: &StreamEvent) {
        if self.stopping.load(Ordering::SeqCst) {
            debug!("Stream {:?} while stopping", event);
            return;
        }
        if self.reconnecting.load(Ordering::SeqCst) || self.resetting.load(Ordering::SeqCst) {
            debug!("Stream {:?} during reset, ignoring", event);
            return;
        }
        let Some(session) = self.this.upgrade() else {
            return;
        };

        warn!("Event stream broke ({:?}), resetting", event);
        tokio::spawn(async move {
            if let Err(e) = session.reset().await {
                error!("Session reset failed: {}", e);
            }
        });
    }

    // --- reset -----------------------------------------------------------

    /// Recover the event stream, preferring a silent resubscription.
    pub async fn reset(&self) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            debug!("Session stopping, not resetting");
            return Ok(());
        }
        let transport = match self.transport() {
            Ok(transport) => transport,
            Err(_) => return self.full_reset("no transport").await,
        };
        if !self.is_logged_in() {
            return self.full_reset("not logged in").await;
        }

        let Some(gate) = FlagGuard::acquire(&self.reconnecting) else {
            debug!("Reconnect already in progress");
            return Ok(());
        };

        match self.reconnect(transport, gate).await {
            Ok(()) => Ok(()),
            Err(e) if self.stopping.load(Ordering::SeqCst) => {
                debug!("Reconnect abandoned by stop: {}", e);
                Ok(())
            }
            Err(e) => {
                warn!("Fast-path reconnect failed: {}", e);
                self.full_reset(&e.to_string()).await
            }
        }
    }

    async fn reconnect(
        &self,
        transport: Arc<dyn EventTransport>,
        gate: FlagGuard<'_>,
    ) -> Result<()> {
        let timing = self.options.timing;
        info!("Reconnecting event stream");

        transport.stop_stream().await?;

        let (resume_seq, account_id) = {
            let mark = lock(&self.watermark);
            (
                mark.as_ref().map(|w| w.last_event_seq),
                mark.as_ref().and_then(|w| w.account_id.clone()),
            )
        };
        let expected = account_id
            .or_else(|| self.current_user_id())
            .ok_or(PuppetServiceError::NotLoggedIn)?;

        let waiting_login = FlagGuard::raise(&self.waiting_for_login);
        let waiting_ready = FlagGuard::raise(&self.waiting_for_ready);
        let (login_tx, login_rx) = oneshot::channel();
        let login_listener = Self::await_login(&transport, expected.clone(), login_tx);
        let (ready_tx, ready_rx) = oneshot::channel();
        let ready_listener = Self::await_ready(&transport, ready_tx);

        if let Err(e) = self
            .resubscribe(&transport, resume_seq, &expected, login_rx)
            .await
        {
            // Still holding: nothing from the unvalidated stream gets through.
            self.detach_listeners(&transport);
            let discarded = std::mem::take(&mut *lock(&self.held));
            if !discarded.is_empty() {
                debug!("Discarding {} held events", discarded.len());
            }
            return Err(e);
        }

        drop(waiting_login);
        drop(gate);
        drop(login_listener);
        info!("Event stream resumed as {}", expected);
        self.release_held();

        match tokio::time::timeout(timing.ready_timeout, ready_rx).await {
            Ok(Ok(())) => debug!("Ready confirmed after reconnect"),
            _ => warn!(
                "No ready within {:?} after reconnect, continuing",
                timing.ready_timeout
            ),
        }
        drop(waiting_ready);
        drop(ready_listener);

        Ok(())
    }

    /// Resubscribe within the retry budget and wait for the login to be
    /// validated against `expected`.
    async fn resubscribe(
        &self,
        transport: &Arc<dyn EventTransport>,
        resume_seq: Option<u64>,
        expected: &str,
        login_rx: oneshot::Receiver<Result<()>>,
    ) -> Result<()> {
        let login_timeout = self.options.timing.login_timeout;

        let (result, stats) = retry_async(
            &self.retry_config(),
            || transport.start_stream(resume_seq, Some(expected.to_string())),
            |e| !self.stopping.load(Ordering::SeqCst) && e.is_retryable(),
        )
        .await;

        if let Err(e) = result {
            return Err(if stats.budget_exhausted {
                PuppetServiceError::ReconnectBudgetExhausted {
                    attempts: stats.attempts,
                }
            } else {
                e
            });
        }
        debug!("Stream resubscribed after {} attempts", stats.attempts);

        match tokio::time::timeout(login_timeout, login_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(PuppetServiceError::StreamClosed {
                reason: "login waiter dropped".to_string(),
            }),
            Err(_) => Err(PuppetServiceError::Timeout(login_timeout)),
        }
    }

    /// Replay what arrived while the login was being validated.
    fn release_held(&self) {
        let held = std::mem::take(&mut *lock(&self.held));
        if !held.is_empty() {
            debug!("Releasing {} held events", held.len());
        }
        for event in held {
            self.handle_event(event);
        }
    }

    fn await_login(
        transport: &Arc<dyn EventTransport>,
        expected: String,
        tx: oneshot::Sender<Result<()>>,
    ) -> TransientListener {
        let tx = Mutex::new(Some(tx));
        let id = transport.events().on(StreamEventKind::Data, move |event| {
            let StreamEvent::Data(envelope) = event else {
                return;
            };
            if envelope.kind != EventKind::Login {
                return;
            }
            let outcome = match decode_envelope(envelope) {
                Ok(PuppetEvent::Login { contact_id }) if contact_id == expected => Ok(()),
                Ok(PuppetEvent::Login { contact_id }) => Err(PuppetServiceError::AccountMismatch {
                    expected: expected.clone(),
                    actual: contact_id,
                }),
                Ok(other) => Err(PuppetServiceError::payload(
                    "login",
                    format!("decoded as {}", other.kind()),
                )),
                Err(e) => Err(e),
            };
            if let Some(tx) = lock(&tx).take() {
                let _ = tx.send(outcome);
            }
        });
        TransientListener {
            transport: transport.clone(),
            id,
        }
    }

    fn await_ready(
        transport: &Arc<dyn EventTransport>,
        tx: oneshot::Sender<()>,
    ) -> TransientListener {
        let tx = Mutex::new(Some(tx));
        let id = transport.events().on(StreamEventKind::Data, move |event| {
            if let StreamEvent::Data(envelope) = event {
                if envelope.kind == EventKind::Ready {
                    if let Some(tx) = lock(&tx).take() {
                        let _ = tx.send(());
                    }
                }
            }
        });
        TransientListener {
            transport: transport.clone(),
            id,
        }
    }

    /// Drop all session state and start over without resuming.
    async fn full_reset(&self, reason: &str) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            debug!("Session stopping, skipping full reset ({})", reason);
            return Ok(());
        }
        let Some(_resetting) = FlagGuard::acquire(&self.resetting) else {
            debug!("Full reset already in progress");
            return Ok(());
        };
        warn!("Full reset: {}", reason);
        self.events.emit(&PuppetEvent::Reset {
            data: reason.to_string(),
        });

        if let Some(transport) = self.take_transport() {
            self.release_transport(&transport).await;
        }
        self.raise_local_logout(SessionConfig::RESET_LOGOUT_REASON);
        lock(&self.held).clear();
        self.clear_watermark();
        self.cache.clear();

        if self.stopping.load(Ordering::SeqCst) {
            debug!("Session stopped during full reset, not restarting");
            return Ok(());
        }
        self.start().await
    }

    // --- façade ----------------------------------------------------------

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.transport()?.call(method, params).await
    }

    pub async fn ding(&self, data: &str) -> Result<()> {
        self.call(method::DING, json!({ "data": data })).await?;
        Ok(())
    }

    pub async fn version(&self) -> Result<String> {
        field(self.call(method::VERSION, json!({})).await?, "version")
    }

    pub async fn logout(&self) -> Result<()> {
        self.call(method::LOGOUT, json!({})).await?;
        Ok(())
    }

    pub async fn dirty_payload(&self, kind: DirtyType, id: &str) -> Result<()> {
        self.call(
            method::DIRTY_PAYLOAD,
            json!({ "type": dirty_type_to_wire(kind), "id": id }),
        )
        .await?;
        Ok(())
    }

    pub async fn contact_list(&self) -> Result<Vec<String>> {
        field(self.call(method::CONTACT_LIST, json!({})).await?, "ids")
    }

    pub async fn contact_payload(&self, id: &str) -> Result<ContactPayload> {
        if let Some(hit) = self.cache.contact(id) {
            return Ok(hit);
        }
        let value = self.call(method::CONTACT_PAYLOAD, json!({ "id": id })).await?;
        let record: ContactRecord = serde_json::from_value(value)?;
        let payload = contact_from_wire(record);
        self.cache.put_contact(payload.clone());
        Ok(payload)
    }

    pub async fn contact_alias(&self, id: &str) -> Result<Option<String>> {
        field(
            self.call(method::CONTACT_ALIAS, json!({ "id": id })).await?,
            "alias",
        )
    }

    pub async fn set_contact_alias(&self, id: &str, alias: Option<&str>) -> Result<()> {
        self.call(
            method::CONTACT_ALIAS_SET,
            json!({ "id": id, "alias": alias }),
        )
        .await?;
        Ok(())
    }

    pub async fn room_list(&self) -> Result<Vec<String>> {
        field(self.call(method::ROOM_LIST, json!({})).await?, "ids")
    }

    pub async fn room_payload(&self, id: &str) -> Result<RoomPayload> {
        if let Some(hit) = self.cache.room(id) {
            return Ok(hit);
        }
        let value = self.call(method::ROOM_PAYLOAD, json!({ "id": id })).await?;
        let record: RoomRecord = serde_json::from_value(value)?;
        let payload = room_from_wire(record);
        self.cache.put_room(payload.clone());
        Ok(payload)
    }

    pub async fn message_payload(&self, id: &str) -> Result<MessagePayload> {
        if let Some(hit) = self.cache.message(id) {
            return Ok(hit);
        }
        let value = self.call(method::MESSAGE_PAYLOAD, json!({ "id": id })).await?;
        let record: MessageRecord = serde_json::from_value(value)?;
        let payload = message_from_wire(record)?;
        self.cache.put_message(payload.clone());
        Ok(payload)
    }

    pub async fn message_send_text(
        &self,
        conversation_id: &str,
        text: &str,
        mention_ids: &[String],
    ) -> Result<Option<String>> {
        let value = self
            .call(
                method::MESSAGE_SEND_TEXT,
                json!({
                    "conversationId": conversation_id,
                    "text": text,
                    "mentionIdList": mention_ids,
                }),
            )
            .await?;
        field(value, "messageId")
    }

    /// Upload `file` in chunks, then send it by content id.
    pub async fn message_send_file(
        &self,
        conversation_id: &str,
        file: &FileBox,
    ) -> Result<Option<String>> {
        let content_id = new_content_id();
        let meta = file.meta(&content_id, FileBoxConfig::CHUNK_SIZE);
        self.call(method::FILE_UPLOAD_BEGIN, serde_json::to_value(&meta)?)
            .await?;
        for chunk in file.chunks(&content_id, FileBoxConfig::CHUNK_SIZE) {
            self.call(method::FILE_UPLOAD_CHUNK, serde_json::to_value(chunk)?)
                .await?;
        }

        let value = self
            .call(
                method::MESSAGE_SEND_FILE,
                json!({ "conversationId": conversation_id, "contentId": content_id }),
            )
            .await?;
        field(value, "messageId")
    }

    /// Download the attachment of a message.
    pub async fn message_file(&self, message_id: &str) -> Result<FileBox> {
        let value = self
            .call(method::MESSAGE_FILE, json!({ "id": message_id }))
            .await?;
        let meta: FileBoxMeta = serde_json::from_value(value)?;
        let content_id = meta.content_id.clone();
        let chunk_count = meta.chunk_count;

        let mut assembler = FileBoxAssembler::new(meta)?;
        for index in 0..chunk_count {
            let value = self
                .call(
                    method::FILE_DOWNLOAD_CHUNK,
                    json!({ "contentId": content_id, "index": index }),
                )
                .await?;
            let chunk: FileChunk = serde_json::from_value(value)?;
            assembler.push(chunk)?;
        }
        assembler.finish()
    }
}

impl std::fmt::Debug for PuppetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PuppetSession")
            .field("endpoint", &self.options.client.endpoint)
            .field("logged_in", &self.is_logged_in())
            .field("ready", &self.is_ready())
            .field("reconnecting", &self.is_reconnecting())
            .finish()
    }
}
