//! TCP server side of the puppet service.
//!
//! Accepts connections, authenticates each one with the [`Handshake`] frame
//! and then either serves unary JSON-RPC calls or, after an `event` request,
//! pumps one subscriber's event stream until it ends.
//!
//! # Thread Safety
//!
//! Each connection is handled in its own spawned task. The dispatcher is
//! shared via `Arc` and synchronizes internally.

use super::protocol::{
    read_frame, read_json, write_json, EventStreamAck, EventStreamRequest, Handshake,
    HandshakeAck, IpcRequest, IpcResponse, CANCEL_METHOD, EVENT_METHOD,
};
use crate::config::{ServerOptions, TransportConfig};
use crate::server::sink::{StreamReceiver, Teardown};
use crate::{PuppetServiceError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running server. Dropping shuts down the server.
pub struct IpcServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl IpcServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shut down the server gracefully.
    ///
    /// Stops accepting new connections and signals all active connection
    /// handlers, event streams included, to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// What the server needs from the service behind it.
#[async_trait::async_trait]
pub trait IpcDispatch: Send + Sync + 'static {
    /// Dispatch a unary JSON-RPC method call and return the result.
    async fn dispatch(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value>;

    /// Attach a new event subscriber.
    fn subscribe(&self, request: &EventStreamRequest) -> Result<(StreamReceiver, EventStreamAck)>;

    /// Report how a subscriber's stream ended.
    fn unsubscribe(&self, stream_id: u64, signal: Teardown);
}

/// Puppet service server.
pub struct IpcServer;

impl IpcServer {
    /// Bind `options.bind` and start serving.
    ///
    /// The server runs in background tokio tasks until the returned handle
    /// is shut down or dropped.
    pub async fn start<D: IpcDispatch>(
        options: ServerOptions,
        dispatch: Arc<D>,
    ) -> Result<IpcServerHandle> {
        options.validate()?;

        let listener = TcpListener::bind(&options.bind).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("Puppet service listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            Arc::new(options),
            dispatch,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(IpcServerHandle {
            addr,
            port,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<D: IpcDispatch>(
        listener: TcpListener,
        options: Arc<ServerOptions>,
        dispatch: Arc<D>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Puppet service shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= TransportConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    TransportConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let dispatch = dispatch.clone();
                            let options = options.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, &options, dispatch, &mut conn_shutdown).await {
                                    debug!("Connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    fn authenticate(options: &ServerOptions, handshake: &Handshake) -> Result<HandshakeAck> {
        if handshake.token != options.token {
            return Err(PuppetServiceError::Unauthenticated {
                message: "Invalid token".to_string(),
            });
        }

        if let Some(expected) = &handshake.server_name {
            let actual = options.server_name.as_deref().unwrap_or("<none>");
            if expected != actual {
                return Err(PuppetServiceError::TlsMismatch {
                    expected: expected.clone(),
                    actual: actual.to_string(),
                });
            }
        }

        Ok(HandshakeAck {
            server_name: options.server_name.clone(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    async fn handle_connection<D: IpcDispatch>(
        stream: TcpStream,
        options: &ServerOptions,
        dispatch: Arc<D>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        let handshake: Handshake = match tokio::time::timeout(
            TransportConfig::HANDSHAKE_TIMEOUT,
            read_json(&mut reader),
        )
        .await
        {
            Ok(result) => match result? {
                Some(handshake) => handshake,
                None => return Ok(()),
            },
            Err(_) => return Err(PuppetServiceError::Timeout(TransportConfig::HANDSHAKE_TIMEOUT)),
        };

        match Self::authenticate(options, &handshake) {
            Ok(ack) => {
                write_json(&mut writer, &IpcResponse::success(None, serde_json::to_value(ack)?))
                    .await?;
            }
            Err(e) => {
                warn!("Handshake rejected: {}", e);
                write_json(&mut writer, &IpcResponse::from_error(None, &e)).await?;
                return Err(e);
            }
        }

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()), // Clean disconnect
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            };

            let request = match Self::parse_request(&frame) {
                Ok(request) => request,
                Err(response) => {
                    write_json(&mut writer, &response).await?;
                    continue;
                }
            };

            if request.method == EVENT_METHOD {
                let id = request.id.clone();
                let params = request.params.unwrap_or_else(|| serde_json::json!({}));
                let subscription = serde_json::from_value::<EventStreamRequest>(params)
                    .map_err(|e| PuppetServiceError::InvalidParams {
                        message: e.to_string(),
                    })
                    .and_then(|req| dispatch.subscribe(&req));

                match subscription {
                    Ok((receiver, ack)) => {
                        let ack = IpcResponse::success(id, serde_json::to_value(ack)?);
                        if let Err(e) = write_json(&mut writer, &ack).await {
                            dispatch.unsubscribe(receiver.id(), Teardown::Error(e.to_string()));
                            return Err(e);
                        }
                        return Self::serve_event_stream(
                            reader,
                            writer,
                            receiver,
                            dispatch,
                            shutdown_rx,
                        )
                        .await;
                    }
                    Err(e) => {
                        write_json(&mut writer, &IpcResponse::from_error(id, &e)).await?;
                        continue;
                    }
                }
            }

            let response = Self::process_request(request, &*dispatch).await;
            write_json(&mut writer, &response).await?;
        }
    }

    fn parse_request(frame: &[u8]) -> std::result::Result<IpcRequest, IpcResponse> {
        let request: IpcRequest = serde_json::from_slice(frame)
            .map_err(|e| IpcResponse::error(None, -32700, format!("Parse error: {}", e)))?;

        if request.jsonrpc != "2.0" {
            return Err(IpcResponse::error(
                request.id,
                -32600,
                "Invalid Request: expected jsonrpc 2.0".to_string(),
            ));
        }
        Ok(request)
    }

    async fn process_request<D: IpcDispatch>(request: IpcRequest, dispatch: &D) -> IpcResponse {
        let params = request
            .params
            .unwrap_or(serde_json::Value::Object(Default::default()));

        match dispatch.dispatch(&request.method, params).await {
            Ok(result) => IpcResponse::success(request.id, result),
            Err(e) => {
                debug!("{} failed: {}", request.method, e);
                IpcResponse::from_error(request.id, &e)
            }
        }
    }

    async fn serve_event_stream<D: IpcDispatch>(
        mut reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
        mut receiver: StreamReceiver,
        dispatch: Arc<D>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let stream_id = receiver.id();

        let (closed_tx, mut closed_rx) = oneshot::channel::<Teardown>();
        let watcher = tokio::spawn(async move {
            let signal = match read_json::<_, IpcRequest>(&mut reader).await {
                Ok(Some(req)) if req.method == CANCEL_METHOD => Teardown::Cancelled,
                Ok(Some(req)) => Teardown::Error(format!(
                    "unexpected {} request on event stream",
                    req.method
                )),
                Ok(None) => Teardown::End,
                Err(e) => Teardown::Error(e.to_string()),
            };
            let _ = closed_tx.send(signal);
        });

        let signal = loop {
            tokio::select! {
                envelope = receiver.recv() => match envelope {
                    Some(envelope) => {
                        if let Err(e) = write_json(&mut writer, &envelope).await {
                            break Teardown::Error(e.to_string());
                        }
                    }
                    None => break Teardown::Finish,
                },
                signal = &mut closed_rx => break signal.unwrap_or(Teardown::End),
                _ = shutdown_rx.changed() => break Teardown::Close,
            }
        };

        watcher.abort();
        debug!("Event stream {} connection closing ({})", stream_id, signal);
        dispatch.unsubscribe(stream_id, signal);
        let _ = writer.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::write_frame;

    struct EchoDispatch;

    #[async_trait::async_trait]
    impl IpcDispatch for EchoDispatch {
        async fn dispatch(
            &self,
            method: &str,
            params: serde_json::Value,
        ) -> Result<serde_json::Value> {
            match method {
                "echo" => Ok(params),
                "fail" => Err(PuppetServiceError::Other("test failure".to_string())),
                _ => Err(PuppetServiceError::MethodNotFound {
                    method: method.to_string(),
                }),
            }
        }

        fn subscribe(
            &self,
            _request: &EventStreamRequest,
        ) -> Result<(StreamReceiver, EventStreamAck)> {
            Err(PuppetServiceError::AlreadyBusy)
        }

        fn unsubscribe(&self, _stream_id: u64, _signal: Teardown) {}
    }

    fn options() -> ServerOptions {
        ServerOptions::new("127.0.0.1:0", "insecure_test").with_server_name("puppet.local")
    }

    async fn connect(handle: &IpcServerHandle, token: &str) -> (TcpStream, IpcResponse) {
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let handshake = Handshake {
            token: token.to_string(),
            server_name: None,
            client_version: "test".to_string(),
        };
        write_json(&mut stream, &handshake).await.unwrap();
        let response: IpcResponse = read_json(&mut stream).await.unwrap().unwrap();
        (stream, response)
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let mut handle = IpcServer::start(options(), Arc::new(EchoDispatch))
            .await
            .unwrap();

        assert!(handle.port > 0);
        assert_eq!(handle.addr.ip(), std::net::Ipv4Addr::LOCALHOST);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_rejects_empty_token_option() {
        let result = IpcServer::start(
            ServerOptions::new("127.0.0.1:0", ""),
            Arc::new(EchoDispatch),
        )
        .await;
        assert!(matches!(
            result,
            Err(PuppetServiceError::Unauthenticated { .. })
        ));
    }

    #[tokio::test]
    async fn test_handshake_ack_carries_server_name() {
        let mut handle = IpcServer::start(options(), Arc::new(EchoDispatch))
            .await
            .unwrap();

        let (_stream, response) = connect(&handle, "insecure_test").await;
        let ack: HandshakeAck = serde_json::from_value(response.into_result().unwrap()).unwrap();
        assert_eq!(ack.server_name.as_deref(), Some("puppet.local"));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_bad_token_is_rejected() {
        let mut handle = IpcServer::start(options(), Arc::new(EchoDispatch))
            .await
            .unwrap();

        let (mut stream, response) = connect(&handle, "insecure_wrong").await;
        assert!(matches!(
            response.into_result(),
            Err(PuppetServiceError::Unauthenticated { .. })
        ));
        // The server hangs up after rejecting.
        assert!(read_frame(&mut stream).await.unwrap().is_none());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_name_mismatch_is_rejected() {
        let mut handle = IpcServer::start(options(), Arc::new(EchoDispatch))
            .await
            .unwrap();

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let handshake = Handshake {
            token: "insecure_test".to_string(),
            server_name: Some("other.host".to_string()),
            client_version: "test".to_string(),
        };
        write_json(&mut stream, &handshake).await.unwrap();
        let response: IpcResponse = read_json(&mut stream).await.unwrap().unwrap();

        let err = response.error.unwrap();
        assert_eq!(err.code, PuppetServiceError::CODE_TLS_MISMATCH);
        assert!(err.message.contains("other.host"));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_echo_roundtrip() {
        let mut handle = IpcServer::start(options(), Arc::new(EchoDispatch))
            .await
            .unwrap();

        let (mut stream, _) = connect(&handle, "insecure_test").await;

        let request = IpcRequest::new("echo", serde_json::json!({"hello": "world"}), 1);
        write_json(&mut stream, &request).await.unwrap();

        let response: IpcResponse = read_json(&mut stream).await.unwrap().unwrap();
        assert!(response.error.is_none());
        assert_eq!(
            response.result,
            Some(serde_json::json!({"hello": "world"}))
        );

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_busy_subscription_keeps_connection_usable() {
        let mut handle = IpcServer::start(options(), Arc::new(EchoDispatch))
            .await
            .unwrap();

        let (mut stream, _) = connect(&handle, "insecure_test").await;

        let request = IpcRequest::new(EVENT_METHOD, serde_json::json!({}), 1);
        write_json(&mut stream, &request).await.unwrap();
        let response: IpcResponse = read_json(&mut stream).await.unwrap().unwrap();
        assert_eq!(
            response.error.unwrap().code,
            PuppetServiceError::CODE_ALREADY_BUSY
        );

        let request = IpcRequest::new("echo", serde_json::json!(1), 2);
        write_json(&mut stream, &request).await.unwrap();
        let response: IpcResponse = read_json(&mut stream).await.unwrap().unwrap();
        assert_eq!(response.result, Some(serde_json::json!(1)));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_invalid_json_returns_parse_error() {
        let mut handle = IpcServer::start(options(), Arc::new(EchoDispatch))
            .await
            .unwrap();

        let (mut stream, _) = connect(&handle, "insecure_test").await;
        write_frame(&mut stream, b"not valid json").await.unwrap();

        let response: IpcResponse = read_json(&mut stream).await.unwrap().unwrap();
        assert_eq!(response.error.unwrap().code, -32700);

        handle.shutdown();
    }
}
