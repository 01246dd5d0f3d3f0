//! Service façade: exposes a puppet over the wire.
//!
//! Unary methods are forwarded to the [`Puppet`] with their arguments and
//! results converted by the payload codec. The `event` subscription goes to
//! the [`EventStreamSink`].

use super::filebox_store::FileBoxStore;
use super::sink::{EventStreamSink, StreamReceiver, Teardown};
use crate::codec::event::dirty_type_from_wire;
use crate::codec::payload::{contact_to_wire, message_to_wire, room_to_wire};
use crate::config::{ServerOptions, StreamConfig};
use crate::error::{PuppetServiceError, Result};
use crate::filebox::{FileBoxMeta, FileChunk};
use crate::ipc::protocol::{method, EventStreamAck, EventStreamRequest};
use crate::ipc::server::{IpcDispatch, IpcServer, IpcServerHandle};
use crate::puppet::Puppet;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Deserialize)]
struct DingParams {
    #[serde(default)]
    data: String,
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Deserialize)]
struct DirtyParams {
    #[serde(rename = "type")]
    payload_type: i32,
    id: String,
}

#[derive(Deserialize)]
struct AliasParams {
    id: String,
    #[serde(default)]
    alias: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendTextParams {
    conversation_id: String,
    text: String,
    #[serde(default)]
    mention_id_list: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendFileParams {
    conversation_id: String,
    content_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadChunkParams {
    content_id: String,
    index: u32,
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| PuppetServiceError::InvalidParams {
        message: e.to_string(),
    })
}

fn empty() -> Value {
    json!({})
}

/// A puppet exposed as a service.
pub struct PuppetService<P: Puppet> {
    puppet: Arc<P>,
    sink: Arc<EventStreamSink<P>>,
    files: FileBoxStore,
}

impl<P: Puppet> PuppetService<P> {
    pub fn new(puppet: Arc<P>) -> Arc<Self> {
        Self::with_ready_grace(puppet, StreamConfig::READY_GRACE)
    }

    pub fn with_ready_grace(puppet: Arc<P>, ready_grace: Duration) -> Arc<Self> {
        let sink = EventStreamSink::with_ready_grace(puppet.clone(), ready_grace);
        Arc::new(Self {
            puppet,
            sink,
            files: FileBoxStore::new(),
        })
    }

    pub fn puppet(&self) -> &Arc<P> {
        &self.puppet
    }

    pub fn sink(&self) -> &Arc<EventStreamSink<P>> {
        &self.sink
    }

    /// Start listening for clients.
    pub async fn serve(self: &Arc<Self>, options: ServerOptions) -> Result<IpcServerHandle> {
        IpcServer::start(options, self.clone()).await
    }
}

#[async_trait::async_trait]
impl<P: Puppet> IpcDispatch for PuppetService<P> {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        debug!("Dispatching {}", method);
        let puppet = &self.puppet;

        match method {
            method::DING => {
                let p: DingParams = parse(params)?;
                puppet.ding(&p.data).await?;
                Ok(empty())
            }
            method::VERSION => Ok(json!({ "version": puppet.version() })),
            method::START => {
                puppet.start().await?;
                Ok(empty())
            }
            method::STOP => {
                puppet.stop().await?;
                Ok(empty())
            }
            method::LOGOUT => {
                puppet.logout().await?;
                Ok(empty())
            }
            method::DIRTY_PAYLOAD => {
                let p: DirtyParams = parse(params)?;
                let kind = dirty_type_from_wire(p.payload_type)?;
                puppet.dirty_payload(kind, &p.id).await?;
                Ok(empty())
            }
            method::CONTACT_LIST => Ok(json!({ "ids": puppet.contact_list().await? })),
            method::CONTACT_PAYLOAD => {
                let p: IdParams = parse(params)?;
                let contact = puppet.contact_payload(&p.id).await?;
                Ok(serde_json::to_value(contact_to_wire(&contact))?)
            }
            method::CONTACT_ALIAS => {
                let p: IdParams = parse(params)?;
                Ok(json!({ "alias": puppet.contact_alias(&p.id).await? }))
            }
            method::CONTACT_ALIAS_SET => {
                let p: AliasParams = parse(params)?;
                puppet.set_contact_alias(&p.id, p.alias.as_deref()).await?;
                Ok(empty())
            }
            method::ROOM_LIST => Ok(json!({ "ids": puppet.room_list().await? })),
            method::ROOM_PAYLOAD => {
                let p: IdParams = parse(params)?;
                let room = puppet.room_payload(&p.id).await?;
                Ok(serde_json::to_value(room_to_wire(&room))?)
            }
            method::MESSAGE_PAYLOAD => {
                let p: IdParams = parse(params)?;
                let message = puppet.message_payload(&p.id).await?;
                Ok(serde_json::to_value(message_to_wire(&message))?)
            }
            method::MESSAGE_SEND_TEXT => {
                let p: SendTextParams = parse(params)?;
                let id = puppet
                    .message_send_text(&p.conversation_id, &p.text, &p.mention_id_list)
                    .await?;
                Ok(json!({ "messageId": id }))
            }
            method::FILE_UPLOAD_BEGIN => {
                let meta: FileBoxMeta = parse(params)?;
                self.files.begin_upload(meta)?;
                Ok(empty())
            }
            method::FILE_UPLOAD_CHUNK => {
                let chunk: FileChunk = parse(params)?;
                let complete = self.files.push_chunk(chunk)?;
                Ok(json!({ "complete": complete }))
            }
            method::MESSAGE_SEND_FILE => {
                let p: SendFileParams = parse(params)?;
                let file = self.files.take_upload(&p.content_id)?;
                let id = puppet.message_send_file(&p.conversation_id, file).await?;
                Ok(json!({ "messageId": id }))
            }
            method::MESSAGE_FILE => {
                let p: IdParams = parse(params)?;
                let file = puppet.message_file(&p.id).await?;
                Ok(serde_json::to_value(self.files.offer_download(file))?)
            }
            method::FILE_DOWNLOAD_CHUNK => {
                let p: DownloadChunkParams = parse(params)?;
                let chunk = self.files.download_chunk(&p.content_id, p.index)?;
                Ok(serde_json::to_value(chunk)?)
            }
            _ => Err(PuppetServiceError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }

    fn subscribe(&self, request: &EventStreamRequest) -> Result<(StreamReceiver, EventStreamAck)> {
        if let (Some(expected), Some(current)) =
            (&request.account_id, self.puppet.current_user_id())
        {
            if *expected != current {
                info!(
                    "Subscriber resumes account {} but puppet is logged in as {}",
                    expected, current
                );
            }
        }

        let receiver = self.sink.attach(request.resume_seq)?;
        let ack = EventStreamAck {
            subscribed: true,
            last_seq: self.sink.last_seq(),
        };
        Ok((receiver, ack))
    }

    fn unsubscribe(&self, stream_id: u64, signal: Teardown) {
        self.sink.teardown(stream_id, signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::payload::{ContactRecord, MessageRecord};
    use crate::event::{EventKind, PuppetEvent};
    use crate::filebox::FileBox;
    use crate::puppet::{ContactPayload, MockPuppet};
    use std::sync::Mutex;

    fn service() -> Arc<PuppetService<MockPuppet>> {
        PuppetService::new(Arc::new(MockPuppet::new()))
    }

    #[tokio::test]
    async fn test_ding_raises_dong() {
        let service = service();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        service.puppet().events().on(EventKind::Dong, move |e| {
            sink.lock().unwrap().push(e.clone());
        });

        service
            .dispatch(method::DING, json!({"data": "hello"}))
            .await
            .unwrap();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[PuppetEvent::Dong {
                data: "hello".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_contact_payload_uses_wire_record() {
        let service = service();
        service.puppet().add_contact(ContactPayload {
            id: "c1".into(),
            name: "Alice".into(),
            ..Default::default()
        });

        let value = service
            .dispatch(method::CONTACT_PAYLOAD, json!({"id": "c1"}))
            .await
            .unwrap();
        let record: ContactRecord = serde_json::from_value(value).unwrap();
        assert_eq!(record.name, "Alice");

        let missing = service
            .dispatch(method::CONTACT_PAYLOAD, json!({"id": "nope"}))
            .await;
        assert!(matches!(missing, Err(PuppetServiceError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_unknown_method_and_bad_params() {
        let service = service();
        assert!(matches!(
            service.dispatch("teleport", json!({})).await,
            Err(PuppetServiceError::MethodNotFound { .. })
        ));
        assert!(matches!(
            service.dispatch(method::ROOM_PAYLOAD, json!({})).await,
            Err(PuppetServiceError::InvalidParams { .. })
        ));
    }

    #[tokio::test]
    async fn test_dirty_payload_rejects_unspecified_type() {
        let service = service();
        let result = service
            .dispatch(method::DIRTY_PAYLOAD, json!({"type": 0, "id": "c1"}))
            .await;
        assert!(matches!(result, Err(PuppetServiceError::Payload { .. })));
    }

    #[tokio::test]
    async fn test_send_text_roundtrip() {
        let service = service();
        service.puppet().login("wxid_a1");

        let value = service
            .dispatch(
                method::MESSAGE_SEND_TEXT,
                json!({"conversationId": "c1", "text": "hi"}),
            )
            .await
            .unwrap();
        let id = value["messageId"].as_str().unwrap().to_string();

        let value = service
            .dispatch(method::MESSAGE_PAYLOAD, json!({"id": id}))
            .await
            .unwrap();
        let record: MessageRecord = serde_json::from_value(value).unwrap();
        assert_eq!(record.text.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_file_upload_then_send() {
        let service = service();
        service.puppet().login("wxid_a1");
        let file = FileBox::new("note.txt", &b"hello file"[..]);
        let meta = file.meta("up-1", 4);

        service
            .dispatch(method::FILE_UPLOAD_BEGIN, serde_json::to_value(&meta).unwrap())
            .await
            .unwrap();
        for chunk in file.chunks("up-1", 4) {
            service
                .dispatch(method::FILE_UPLOAD_CHUNK, serde_json::to_value(chunk).unwrap())
                .await
                .unwrap();
        }
        let value = service
            .dispatch(
                method::MESSAGE_SEND_FILE,
                json!({"conversationId": "c1", "contentId": "up-1"}),
            )
            .await
            .unwrap();
        let message_id = value["messageId"].as_str().unwrap().to_string();

        let stored = service.puppet().message_file(&message_id).await.unwrap();
        assert_eq!(stored, file);
    }

    #[tokio::test]
    async fn test_message_file_download() {
        let service = service();
        let file = FileBox::new("pic.png", vec![3u8; 10]).with_mime("image/png");
        service.puppet().attach_file("m1", file.clone());

        let value = service
            .dispatch(method::MESSAGE_FILE, json!({"id": "m1"}))
            .await
            .unwrap();
        let meta: FileBoxMeta = serde_json::from_value(value).unwrap();
        assert_eq!(meta.chunk_count, 1);
        assert_eq!(meta.mime.as_deref(), Some("image/png"));

        let value = service
            .dispatch(
                method::FILE_DOWNLOAD_CHUNK,
                json!({"contentId": meta.content_id, "index": 0}),
            )
            .await
            .unwrap();
        let chunk: FileChunk = serde_json::from_value(value).unwrap();
        assert_eq!(chunk.data, vec![3u8; 10]);
    }

    #[tokio::test]
    async fn test_subscribe_then_busy_then_unsubscribe() {
        let service = service();
        let request = EventStreamRequest::default();

        let (receiver, ack) = service.subscribe(&request).unwrap();
        assert!(ack.subscribed);
        assert!(matches!(
            service.subscribe(&request),
            Err(PuppetServiceError::AlreadyBusy)
        ));

        service.unsubscribe(receiver.id(), Teardown::End);
        assert!(service.subscribe(&request).is_ok());
    }
}
