//! Shared wire protocol types and framing.
//!
//! Every frame is a 4-byte big-endian length prefix followed by UTF-8 JSON.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! A connection starts with a [`Handshake`] answered by an [`IpcResponse`]
//! carrying a [`HandshakeAck`]. After that it either carries JSON-RPC 2.0
//! request/response pairs, or, once it sends the `event` method, becomes the
//! event stream: one subscription ack followed only by [`EventEnvelope`]
//! frames.
//!
//! [`EventEnvelope`]: crate::event::EventEnvelope

use crate::config::TransportConfig;
use crate::error::{PuppetServiceError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Method name that turns a connection into the event stream.
pub const EVENT_METHOD: &str = "event";

/// Only request a subscriber may send on an event stream connection.
pub const CANCEL_METHOD: &str = "cancel";

/// Unary method names served by the puppet service.
pub mod method {
    pub const DING: &str = "ding";
    pub const VERSION: &str = "version";
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const LOGOUT: &str = "logout";
    pub const DIRTY_PAYLOAD: &str = "dirty_payload";
    pub const CONTACT_LIST: &str = "contact_list";
    pub const CONTACT_PAYLOAD: &str = "contact_payload";
    pub const CONTACT_ALIAS: &str = "contact_alias";
    pub const CONTACT_ALIAS_SET: &str = "contact_alias_set";
    pub const ROOM_LIST: &str = "room_list";
    pub const ROOM_PAYLOAD: &str = "room_payload";
    pub const MESSAGE_PAYLOAD: &str = "message_payload";
    pub const MESSAGE_SEND_TEXT: &str = "message_send_text";
    pub const MESSAGE_SEND_FILE: &str = "message_send_file";
    pub const MESSAGE_FILE: &str = "message_file";
    pub const FILE_UPLOAD_BEGIN: &str = "file_upload_begin";
    pub const FILE_UPLOAD_CHUNK: &str = "file_upload_chunk";
    pub const FILE_DOWNLOAD_CHUNK: &str = "file_download_chunk";
}

/// First frame on every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub token: String,
    /// Identity the client expects the server to present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    pub server_version: String,
}

/// Params of the `event` method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStreamRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

/// Result of the `event` method, sent once before any envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStreamAck {
    pub subscribed: bool,
    /// Last sequence number the server has assigned.
    pub last_seq: u64,
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

impl IpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(serde_json::Value::Number(id.into())),
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
    pub id: Option<serde_json::Value>,
}

impl IpcResponse {
    /// Create a success response.
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<serde_json::Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(IpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    /// Create an error response from a service error.
    pub fn from_error(id: Option<serde_json::Value>, err: &PuppetServiceError) -> Self {
        Self::error(id, err.to_rpc_error_code(), err.to_string())
    }

    /// Turn the response into the result value or the rebuilt error.
    pub fn into_result(self) -> Result<serde_json::Value> {
        if let Some(err) = self.error {
            return Err(PuppetServiceError::from_rpc_error(err.code, err.message));
        }
        self.result
            .ok_or_else(|| PuppetServiceError::Other("Response missing result".to_string()))
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(PuppetServiceError::Validation {
            field: "frame".to_string(),
            message: format!(
                "Frame size {} exceeds maximum {}",
                len,
                TransportConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it as JSON.
pub async fn read_json<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode a value as JSON and write it as one frame.
pub async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value)?;
    write_frame(writer, &bytes).await
}
