//! TCP client side of the puppet service.
//!
//! [`IpcClient`] is the long-lived unary connection used for JSON-RPC calls.
//! [`EventStreamConnection`] is a separate connection that is turned into an
//! event stream right after its handshake; closing it never affects the
//! unary connection.
//!
//! # Thread Safety
//!
//! The client uses a tokio `Mutex` to serialize access to the TCP stream,
//! allowing safe concurrent use from multiple async tasks.

use super::protocol::{
    read_json, write_json, EventStreamAck, EventStreamRequest, Handshake, HandshakeAck,
    IpcRequest, IpcResponse, CANCEL_METHOD, EVENT_METHOD,
};
use crate::config::{ClientOptions, TransportConfig};
use crate::event::EventEnvelope;
use crate::{PuppetServiceError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Open a connection to `options.endpoint` and complete the handshake.
async fn open(options: &ClientOptions) -> Result<(TcpStream, HandshakeAck)> {
    let endpoint = options.endpoint.as_str();
    let mut stream = tokio::time::timeout(
        TransportConfig::CONNECT_TIMEOUT,
        TcpStream::connect(endpoint),
    )
    .await
    .map_err(|_| PuppetServiceError::Timeout(TransportConfig::CONNECT_TIMEOUT))?
    .map_err(|e| PuppetServiceError::Transport {
        message: format!("Failed to connect to {}", endpoint),
        cause: Some(e.to_string()),
    })?;
    stream.set_nodelay(true)?;

    let expected_name = options.tls.as_ref().map(|tls| tls.server_name.clone());
    let handshake = Handshake {
        token: options.token.clone(),
        server_name: expected_name.clone(),
        client_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    write_json(&mut stream, &handshake).await?;

    let response: IpcResponse = tokio::time::timeout(
        TransportConfig::HANDSHAKE_TIMEOUT,
        read_json(&mut stream),
    )
    .await
    .map_err(|_| PuppetServiceError::Timeout(TransportConfig::HANDSHAKE_TIMEOUT))??
    .ok_or_else(|| PuppetServiceError::ConnectionLost {
        endpoint: endpoint.to_string(),
    })?;

    let ack: HandshakeAck = match response.into_result() {
        Ok(value) => serde_json::from_value(value)?,
        Err(PuppetServiceError::Remote { code, message })
            if code == PuppetServiceError::CODE_TLS_MISMATCH =>
        {
            return Err(PuppetServiceError::TlsMismatch {
                expected: expected_name.unwrap_or_default(),
                actual: message,
            });
        }
        Err(e) => return Err(e),
    };

    if let Some(expected) = expected_name {
        if ack.server_name.as_deref() != Some(expected.as_str()) {
            return Err(PuppetServiceError::TlsMismatch {
                expected,
                actual: ack.server_name.unwrap_or_else(|| "<none>".to_string()),
            });
        }
    }

    Ok((stream, ack))
}

/// Unary connection to a puppet service.
#[derive(Debug)]
pub struct IpcClient {
    stream: Mutex<TcpStream>,
    endpoint: String,
    next_id: AtomicU64,
    server: HandshakeAck,
}

impl IpcClient {
    /// Connect and authenticate.
    ///
    /// Options are validated first, so bad credentials or TLS material fail
    /// before any socket is opened.
    pub async fn connect(options: &ClientOptions) -> Result<Self> {
        options.validate()?;
        let (stream, server) = open(options).await?;

        debug!(
            "Connected to {} (server {:?}, version {})",
            options.endpoint, server.server_name, server.server_version
        );

        Ok(Self {
            stream: Mutex::new(stream),
            endpoint: options.endpoint.clone(),
            next_id: AtomicU64::new(1),
            server,
        })
    }

    fn lost(&self) -> PuppetServiceError {
        PuppetServiceError::ConnectionLost {
            endpoint: self.endpoint.clone(),
        }
    }

    /// Call a JSON-RPC method on the server.
    ///
    /// If the connection is broken, returns `ConnectionLost`.
    pub async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = IpcRequest::new(method, params, id);

        let mut stream = self.stream.lock().await;

        write_json(&mut *stream, &request)
            .await
            .map_err(|_| self.lost())?;

        let response: IpcResponse = read_json(&mut *stream)
            .await
            .map_err(|e| match e {
                PuppetServiceError::Json { message, source } => PuppetServiceError::Json {
                    message: format!("Failed to parse response: {}", message),
                    source,
                },
                _ => self.lost(),
            })?
            .ok_or_else(|| self.lost())?;

        response.into_result()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Identity the server announced in its handshake ack.
    pub fn server_name(&self) -> Option<&str> {
        self.server.server_name.as_deref()
    }

    pub fn server_version(&self) -> &str {
        &self.server.server_version
    }
}

/// A connection turned into an event stream.
#[derive(Debug)]
pub struct EventStreamConnection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    ack: EventStreamAck,
}

impl EventStreamConnection {
    /// Connect, authenticate and subscribe.
    ///
    /// Fails with `AlreadyBusy` when another subscriber holds the stream.
    pub async fn open(options: &ClientOptions, request: &EventStreamRequest) -> Result<Self> {
        Self::open_within(options, request, TransportConfig::HANDSHAKE_TIMEOUT).await
    }

    /// [`open`](Self::open), waiting at most `ack_timeout` for the
    /// subscription to be acknowledged.
    pub(crate) async fn open_within(
        options: &ClientOptions,
        request: &EventStreamRequest,
        ack_timeout: Duration,
    ) -> Result<Self> {
        let (stream, _) = open(options).await?;
        let (mut reader, mut writer) = stream.into_split();

        let subscribe = IpcRequest::new(EVENT_METHOD, serde_json::to_value(request)?, 1);
        write_json(&mut writer, &subscribe).await?;

        let response: IpcResponse = tokio::time::timeout(ack_timeout, read_json(&mut reader))
            .await
            .map_err(|_| PuppetServiceError::Timeout(ack_timeout))??
            .ok_or_else(|| PuppetServiceError::ConnectionLost {
                endpoint: options.endpoint.clone(),
            })?;
        let ack: EventStreamAck = serde_json::from_value(response.into_result()?)?;

        debug!(
            "Subscribed to {} (server last seq {})",
            options.endpoint, ack.last_seq
        );
        Ok(Self {
            reader,
            writer,
            ack,
        })
    }

    pub fn ack(&self) -> &EventStreamAck {
        &self.ack
    }

    /// Next envelope, or `None` once the server closed the stream.
    pub async fn next(&mut self) -> Result<Option<EventEnvelope>> {
        read_json(&mut self.reader).await
    }

    /// Ask the server to detach this subscriber and close the connection.
    pub async fn cancel(mut self) -> Result<()> {
        let request = IpcRequest::new(CANCEL_METHOD, serde_json::json!({}), 2);
        write_json(&mut self.writer, &request).await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerOptions, TlsOptions};
    use crate::ipc::server::{IpcDispatch, IpcServer, IpcServerHandle};
    use crate::server::sink::{StreamReceiver, Teardown};
    use std::sync::Arc;

    struct TestDispatch;

    #[async_trait::async_trait]
    impl IpcDispatch for TestDispatch {
        async fn dispatch(
            &self,
            method: &str,
            params: serde_json::Value,
        ) -> Result<serde_json::Value> {
            match method {
                "ping" => Ok(serde_json::json!("pong")),
                "add" => {
                    let a = params["a"].as_i64().unwrap_or(0);
                    let b = params["b"].as_i64().unwrap_or(0);
                    Ok(serde_json::json!(a + b))
                }
                "lookup" => Err(PuppetServiceError::not_found("Contact", "c9")),
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

    const CA: &str = "-----BEGIN CERTIFICATE-----\nMIIBszCCAVmgAwIBAgIUQ0==\n-----END CERTIFICATE-----";

    async fn server(name: Option<&str>) -> IpcServerHandle {
        let mut options = ServerOptions::new("127.0.0.1:0", "insecure_test");
        if let Some(name) = name {
            options = options.with_server_name(name);
        }
        IpcServer::start(options, Arc::new(TestDispatch))
            .await
            .unwrap()
    }

    fn client_options(handle: &IpcServerHandle) -> ClientOptions {
        ClientOptions::new(handle.addr().to_string(), "insecure_test")
    }

    #[tokio::test]
    async fn test_client_call_success() {
        let mut handle = server(None).await;
        let client = IpcClient::connect(&client_options(&handle)).await.unwrap();

        let result = client.call("ping", serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::json!("pong"));

        let result = client
            .call("add", serde_json::json!({"a": 3, "b": 4}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!(7));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_client_call_error_keeps_code() {
        let mut handle = server(None).await;
        let client = IpcClient::connect(&client_options(&handle)).await.unwrap();

        match client.call("lookup", serde_json::json!({})).await {
            Err(PuppetServiceError::Remote { code, message }) => {
                assert_eq!(code, PuppetServiceError::CODE_NOT_FOUND);
                assert!(message.contains("c9"));
            }
            other => panic!("Expected Remote, got: {:?}", other),
        }
        assert!(matches!(
            client.call("nonexistent", serde_json::json!({})).await,
            Err(PuppetServiceError::MethodNotFound { .. })
        ));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_token_is_unauthenticated() {
        let mut handle = server(None).await;
        let options = ClientOptions::new(handle.addr().to_string(), "insecure_other");

        assert!(matches!(
            IpcClient::connect(&options).await,
            Err(PuppetServiceError::Unauthenticated { .. })
        ));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_identity_is_checked() {
        let mut handle = server(Some("puppet.local")).await;

        let good = client_options(&handle).with_tls(TlsOptions::new(CA, "puppet.local"));
        let client = IpcClient::connect(&good).await.unwrap();
        assert_eq!(client.server_name(), Some("puppet.local"));

        let bad = client_options(&handle).with_tls(TlsOptions::new(CA, "other.host"));
        match IpcClient::connect(&bad).await {
            Err(PuppetServiceError::TlsMismatch { expected, .. }) => {
                assert_eq!(expected, "other.host");
            }
            other => panic!("Expected TlsMismatch, got: {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_tls_material_fails_before_connecting() {
        // Nothing listens here; validation must fail first.
        let options = ClientOptions::new("127.0.0.1:1", "secure_token")
            .with_tls(TlsOptions::new("garbage", "puppet.local"));
        assert!(matches!(
            IpcClient::connect(&options).await,
            Err(PuppetServiceError::InvalidTlsMaterial { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_to_dead_server_is_transport_error() {
        let options = ClientOptions::new("127.0.0.1:1", "insecure_test");
        assert!(matches!(
            IpcClient::connect(&options).await,
            Err(PuppetServiceError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn test_busy_stream_surfaces_as_already_busy() {
        let mut handle = server(None).await;
        let result =
            EventStreamConnection::open(&client_options(&handle), &EventStreamRequest::default())
                .await;
        assert!(matches!(result, Err(PuppetServiceError::AlreadyBusy)));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_unacknowledged_subscription_times_out() {
        // Completes the handshake, then swallows the subscription.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _: Option<Handshake> = read_json(&mut socket).await.unwrap();
            let ack = HandshakeAck {
                server_name: None,
                server_version: "silent".to_string(),
            };
            let response = IpcResponse::success(None, serde_json::to_value(ack).unwrap());
            write_json(&mut socket, &response).await.unwrap();
            let _: Option<IpcRequest> = read_json(&mut socket).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        });

        let options = ClientOptions::new(addr.to_string(), "insecure_test");
        let limit = std::time::Duration::from_millis(200);
        let result =
            EventStreamConnection::open_within(&options, &EventStreamRequest::default(), limit)
                .await;

        assert!(matches!(result, Err(PuppetServiceError::Timeout(d)) if d == limit));
        server.abort();
    }

    #[tokio::test]
    async fn test_client_detects_server_shutdown() {
        let mut handle = server(None).await;
        let client = IpcClient::connect(&client_options(&handle)).await.unwrap();

        assert!(client.call("ping", serde_json::json!({})).await.is_ok());

        handle.shutdown();

        // Retry until the server is fully closed (up to 1s)
        let mut detected_shutdown = false;
        for _ in 0..20 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if client.call("ping", serde_json::json!({})).await.is_err() {
                detected_shutdown = true;
                break;
            }
        }
        assert!(detected_shutdown, "Client should detect server shutdown");
    }
}
