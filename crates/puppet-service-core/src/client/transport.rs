//! Session transport manager.
//!
//! Owns the client's unary connection and its event stream subscription.
//! Envelopes read from the stream are re-raised on a local emitter as
//! [`StreamEvent::Data`]; how the stream ended is raised as `End`, `Error` or
//! `Cancel`.
//!
//! The stream can be stopped and restarted without touching the unary
//! connection, which is how the session resumes after a broken stream.

use crate::cancel::CancellationToken;
use crate::config::{ClientOptions, StreamConfig};
use crate::emitter::{Dispatchable, Emitter};
use crate::error::{PuppetServiceError, Result};
use crate::event::{EventEnvelope, EventKind};
use crate::ipc::protocol::EventStreamRequest;
use crate::ipc::{EventStreamConnection, IpcClient};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the transport reports about its event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Data(EventEnvelope),
    /// The server closed the stream.
    End,
    Error(String),
    /// The stream was stopped locally.
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEventKind {
    Data,
    End,
    Error,
    Cancel,
}

impl Dispatchable for StreamEvent {
    type Kind = StreamEventKind;

    fn kind(&self) -> StreamEventKind {
        match self {
            StreamEvent::Data(_) => StreamEventKind::Data,
            StreamEvent::End => StreamEventKind::End,
            StreamEvent::Error(_) => StreamEventKind::Error,
            StreamEvent::Cancel => StreamEventKind::Cancel,
        }
    }
}

/// The transport seam the session drives.
#[async_trait::async_trait]
pub trait EventTransport: Send + Sync + 'static {
    /// Local emitter for [`StreamEvent`]s.
    fn events(&self) -> &Emitter<StreamEvent>;

    /// Open the unary connection and the event stream.
    async fn start(&self, resume_seq: Option<u64>, account_id: Option<String>) -> Result<()>;

    /// (Re)subscribe to the event stream over the existing transport.
    async fn start_stream(&self, resume_seq: Option<u64>, account_id: Option<String>)
        -> Result<()>;

    /// Close only the event stream. Idempotent.
    async fn stop_stream(&self) -> Result<()>;

    /// Close everything. The transport cannot be used afterwards.
    async fn stop(&self) -> Result<()>;

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value>;
}

/// Creates a fresh transport for every session start.
pub trait TransportConnector: Send + Sync + 'static {
    fn create(&self) -> Arc<dyn EventTransport>;
}

/// Connector for the TCP [`TransportManager`].
#[derive(Debug, Clone)]
pub struct TcpConnector {
    options: ClientOptions,
    first_heartbeat_timeout: Duration,
}

impl TcpConnector {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            first_heartbeat_timeout: StreamConfig::FIRST_HEARTBEAT_TIMEOUT,
        }
    }

    pub fn with_first_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.first_heartbeat_timeout = timeout;
        self
    }
}

impl TransportConnector for TcpConnector {
    fn create(&self) -> Arc<dyn EventTransport> {
        Arc::new(
            TransportManager::new(self.options.clone())
                .with_first_heartbeat_timeout(self.first_heartbeat_timeout),
        )
    }
}

struct StreamTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// TCP implementation of [`EventTransport`].
pub struct TransportManager {
    options: ClientOptions,
    events: Arc<Emitter<StreamEvent>>,
    client: RwLock<Option<Arc<IpcClient>>>,
    stream: Mutex<Option<StreamTask>>,
    stopped: AtomicBool,
    first_heartbeat_timeout: Duration,
}

impl TransportManager {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            events: Arc::new(Emitter::new()),
            client: RwLock::new(None),
            stream: Mutex::new(None),
            stopped: AtomicBool::new(false),
            first_heartbeat_timeout: StreamConfig::FIRST_HEARTBEAT_TIMEOUT,
        }
    }

    pub fn with_first_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.first_heartbeat_timeout = timeout;
        self
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(PuppetServiceError::TransportStopped)
        } else {
            Ok(())
        }
    }

    async fn client(&self) -> Result<Arc<IpcClient>> {
        self.ensure_running()?;
        self.client
            .read()
            .await
            .clone()
            .ok_or(PuppetServiceError::NoTransport)
    }

    pub async fn is_streaming(&self) -> bool {
        self.stream
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    async fn read_stream(
        mut conn: EventStreamConnection,
        events: Arc<Emitter<StreamEvent>>,
        cancel: CancellationToken,
        first_tx: oneshot::Sender<EventKind>,
    ) {
        let mut first_tx = Some(first_tx);
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => None,
                frame = conn.next() => Some(frame),
            };

            match frame {
                None => {
                    if let Err(e) = conn.cancel().await {
                        debug!("Cancel request not delivered: {}", e);
                    }
                    events.emit(&StreamEvent::Cancel);
                    break;
                }
                Some(Ok(Some(envelope))) => {
                    if let Some(tx) = first_tx.take() {
                        let _ = tx.send(envelope.kind);
                    }
                    events.emit(&StreamEvent::Data(envelope));
                }
                Some(Ok(None)) => {
                    info!("Event stream ended by server");
                    events.emit(&StreamEvent::End);
                    break;
                }
                Some(Err(e)) => {
                    warn!("Event stream failed: {}", e);
                    events.emit(&StreamEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl EventTransport for TransportManager {
    fn events(&self) -> &Emitter<StreamEvent> {
        &self.events
    }

    async fn start(&self, resume_seq: Option<u64>, account_id: Option<String>) -> Result<()> {
        self.ensure_running()?;

        let client = IpcClient::connect(&self.options).await?;
        *self.client.write().await = Some(Arc::new(client));
        info!("Transport to {} established", self.options.endpoint);

        self.start_stream(resume_seq, account_id).await
    }

    async fn start_stream(
        &self,
        resume_seq: Option<u64>,
        account_id: Option<String>,
    ) -> Result<()> {
        // Stream resubscription needs an established transport.
        self.client().await?;
        self.stop_stream().await?;

        let request = EventStreamRequest {
            resume_seq,
            account_id,
        };
        let conn = EventStreamConnection::open(&self.options, &request).await?;
        debug!(
            "Event stream subscribed (resume {:?}, server seq {})",
            resume_seq,
            conn.ack().last_seq
        );

        let cancel = CancellationToken::new();
        let (first_tx, first_rx) = oneshot::channel();
        let handle = tokio::spawn(Self::read_stream(
            conn,
            self.events.clone(),
            cancel.clone(),
            first_tx,
        ));
        *self.stream.lock().await = Some(StreamTask { cancel, handle });

        match tokio::time::timeout(self.first_heartbeat_timeout, first_rx).await {
            Ok(Ok(EventKind::Heartbeat)) => debug!("Event stream ready"),
            Ok(Ok(kind)) => warn!("Event stream opened with {} instead of heartbeat", kind),
            Ok(Err(_)) => warn!("Event stream closed before its first envelope"),
            Err(_) => warn!(
                "No heartbeat within {:?}, treating stream as started",
                self.first_heartbeat_timeout
            ),
        }
        Ok(())
    }

    async fn stop_stream(&self) -> Result<()> {
        let task = self.stream.lock().await.take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!("Event stream task failed: {}", e);
            }
            debug!("Event stream stopped");
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_stream().await?;
        self.client.write().await.take();
        info!("Transport to {} stopped", self.options.endpoint);
        Ok(())
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        self.client().await?.call(method, params).await
    }
}
