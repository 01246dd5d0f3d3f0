//! The puppet engine capability interface.
//!
//! A puppet is the stateful adapter to an IM backend. The server side of the
//! bridge only ever reaches it through [`Puppet`]: an event bus, a handful of
//! state queries, and the operation catalogue the service façade forwards.

pub mod mock;
pub mod types;

pub use mock::MockPuppet;
pub use types::{
    ContactGender, ContactPayload, ContactType, MessagePayload, MessageType, RoomPayload,
};

use crate::emitter::Emitter;
use crate::error::Result;
use crate::event::{DirtyType, PuppetEvent};
use crate::filebox::FileBox;

/// Capability interface of a puppet engine.
#[async_trait::async_trait]
pub trait Puppet: Send + Sync + 'static {
    /// Event bus the engine raises its events on.
    fn events(&self) -> &Emitter<PuppetEvent>;

    fn is_logged_in(&self) -> bool;

    fn current_user_id(&self) -> Option<String>;

    fn is_ready(&self) -> bool;

    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn logout(&self) -> Result<()>;

    /// Liveness probe; the engine answers with a `dong` event.
    async fn ding(&self, data: &str) -> Result<()>;

    async fn dirty_payload(&self, kind: DirtyType, id: &str) -> Result<()>;

    async fn contact_list(&self) -> Result<Vec<String>>;

    async fn contact_payload(&self, id: &str) -> Result<ContactPayload>;

    async fn contact_alias(&self, id: &str) -> Result<Option<String>>;

    async fn set_contact_alias(&self, id: &str, alias: Option<&str>) -> Result<()>;

    async fn room_list(&self) -> Result<Vec<String>>;

    async fn room_payload(&self, id: &str) -> Result<RoomPayload>;

    async fn message_payload(&self, id: &str) -> Result<MessagePayload>;

    /// Returns the id of the sent message when the backend reports one.
    async fn message_send_text(
        &self,
        conversation_id: &str,
        text: &str,
        mention_ids: &[String],
    ) -> Result<Option<String>>;

    async fn message_send_file(&self, conversation_id: &str, file: FileBox)
        -> Result<Option<String>>;

    /// Attachment of a received message.
    async fn message_file(&self, message_id: &str) -> Result<FileBox>;
}
