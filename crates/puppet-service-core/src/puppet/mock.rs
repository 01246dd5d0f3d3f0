//! In-memory puppet engine.
//!
//! Holds contacts, rooms and messages in maps and lets callers drive its
//! lifecycle (`login`, `mark_ready`, `receive_text`) by hand. Used by the
//! test suites and by the `serve` command of the CLI.

use super::types::{ContactPayload, MessagePayload, MessageType, RoomPayload};
use super::Puppet;
use crate::config::SessionConfig;
use crate::emitter::Emitter;
use crate::error::{PuppetServiceError, Result};
use crate::event::{DirtyType, PuppetEvent};
use crate::filebox::FileBox;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct MockState {
    user_id: Option<String>,
    ready: bool,
    started: bool,
    contacts: HashMap<String, ContactPayload>,
    rooms: HashMap<String, RoomPayload>,
    messages: HashMap<String, MessagePayload>,
    files: HashMap<String, FileBox>,
}

/// A scriptable in-memory puppet.
#[derive(Debug, Default)]
pub struct MockPuppet {
    events: Emitter<PuppetEvent>,
    state: Mutex<MockState>,
}

impl MockPuppet {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Raise an arbitrary event on the bus.
    pub fn emit(&self, event: PuppetEvent) {
        self.events.emit(&event);
    }

    /// Log in as `contact_id` and announce it.
    pub fn login(&self, contact_id: &str) {
        {
            let mut state = self.state();
            state.user_id = Some(contact_id.to_string());
            state
                .contacts
                .entry(contact_id.to_string())
                .or_insert_with(|| ContactPayload {
                    id: contact_id.to_string(),
                    name: contact_id.to_string(),
                    friend: true,
                    ..Default::default()
                });
        }
        debug!("Mock puppet logged in as {}", contact_id);
        self.emit(PuppetEvent::login(contact_id));
    }

    /// Log out with the given reason; no-op if not logged in.
    pub fn logout_with(&self, reason: &str) {
        let previous = {
            let mut state = self.state();
            state.ready = false;
            state.user_id.take()
        };
        if let Some(contact_id) = previous {
            self.emit(PuppetEvent::logout(contact_id, reason));
        }
    }

    pub fn mark_ready(&self) {
        self.state().ready = true;
        self.emit(PuppetEvent::ready("ready"));
    }

    pub fn add_contact(&self, contact: ContactPayload) {
        self.state().contacts.insert(contact.id.clone(), contact);
    }

    pub fn add_room(&self, room: RoomPayload) {
        self.state().rooms.insert(room.id.clone(), room);
    }

    /// Attach a file to a stored message so `message_file` can serve it.
    pub fn attach_file(&self, message_id: &str, file: FileBox) {
        self.state().files.insert(message_id.to_string(), file);
    }

    /// Simulate an incoming text message and return its id.
    pub fn receive_text(&self, talker_id: &str, text: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let listener_id = self.state().user_id.clone();
        self.state().messages.insert(
            id.clone(),
            MessagePayload {
                id: id.clone(),
                kind: MessageType::Text,
                talker_id: Some(talker_id.to_string()),
                listener_id,
                room_id: None,
                text: Some(text.to_string()),
                filename: None,
                mention_ids: Vec::new(),
                timestamp: Utc::now(),
            },
        );
        self.emit(PuppetEvent::Message {
            message_id: id.clone(),
        });
        id
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    fn require_login(&self) -> Result<String> {
        self.state()
            .user_id
            .clone()
            .ok_or(PuppetServiceError::NotLoggedIn)
    }

    fn store_sent(
        &self,
        conversation_id: &str,
        kind: MessageType,
        text: Option<String>,
        filename: Option<String>,
        mention_ids: Vec<String>,
    ) -> Result<String> {
        let talker_id = self.require_login()?;
        let id = uuid::Uuid::new_v4().to_string();
        let is_room = self.state().rooms.contains_key(conversation_id);
        let payload = MessagePayload {
            id: id.clone(),
            kind,
            talker_id: Some(talker_id),
            listener_id: (!is_room).then(|| conversation_id.to_string()),
            room_id: is_room.then(|| conversation_id.to_string()),
            text,
            filename,
            mention_ids,
            timestamp: Utc::now(),
        };
        self.state().messages.insert(id.clone(), payload);
        Ok(id)
    }
}

#[async_trait::async_trait]
impl Puppet for MockPuppet {
    fn events(&self) -> &Emitter<PuppetEvent> {
        &self.events
    }

    fn is_logged_in(&self) -> bool {
        self.state().user_id.is_some()
    }

    fn current_user_id(&self) -> Option<String> {
        self.state().user_id.clone()
    }

    fn is_ready(&self) -> bool {
        self.state().ready
    }

    async fn start(&self) -> Result<()> {
        self.state().started = true;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.logout_with(SessionConfig::STOP_LOGOUT_REASON);
        self.state().started = false;
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.require_login()?;
        self.logout_with("logout()");
        Ok(())
    }

    async fn ding(&self, data: &str) -> Result<()> {
        self.emit(PuppetEvent::Dong {
            data: data.to_string(),
        });
        Ok(())
    }

    async fn dirty_payload(&self, kind: DirtyType, id: &str) -> Result<()> {
        self.emit(PuppetEvent::Dirty {
            payload_type: kind,
            payload_id: id.to_string(),
        });
        Ok(())
    }

    async fn contact_list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.state().contacts.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn contact_payload(&self, id: &str) -> Result<ContactPayload> {
        self.state()
            .contacts
            .get(id)
            .cloned()
            .ok_or_else(|| PuppetServiceError::not_found("Contact", id))
    }

    async fn contact_alias(&self, id: &str) -> Result<Option<String>> {
        Ok(self.contact_payload(id).await?.alias)
    }

    async fn set_contact_alias(&self, id: &str, alias: Option<&str>) -> Result<()> {
        {
            let mut state = self.state();
            let contact = state
                .contacts
                .get_mut(id)
                .ok_or_else(|| PuppetServiceError::not_found("Contact", id))?;
            contact.alias = alias.map(str::to_string);
        }
        self.dirty_payload(DirtyType::Contact, id).await
    }

    async fn room_list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.state().rooms.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn room_payload(&self, id: &str) -> Result<RoomPayload> {
        self.state()
            .rooms
            .get(id)
            .cloned()
            .ok_or_else(|| PuppetServiceError::not_found("Room", id))
    }

    async fn message_payload(&self, id: &str) -> Result<MessagePayload> {
        self.state()
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| PuppetServiceError::not_found("Message", id))
    }

    async fn message_send_text(
        &self,
        conversation_id: &str,
        text: &str,
        mention_ids: &[String],
    ) -> Result<Option<String>> {
        let id = self.store_sent(
            conversation_id,
            MessageType::Text,
            Some(text.to_string()),
            None,
            mention_ids.to_vec(),
        )?;
        Ok(Some(id))
    }

    async fn message_send_file(
        &self,
        conversation_id: &str,
        file: FileBox,
    ) -> Result<Option<String>> {
        let id = self.store_sent(
            conversation_id,
            MessageType::Attachment,
            None,
            Some(file.name.clone()),
            Vec::new(),
        )?;
        self.attach_file(&id, file);
        Ok(Some(id))
    }

    async fn message_file(&self, message_id: &str) -> Result<FileBox> {
        self.state()
            .files
            .get(message_id)
            .cloned()
            .ok_or_else(|| PuppetServiceError::not_found("File", message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_login_emits_and_updates_state() {
        let puppet = MockPuppet::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        puppet.events().on(EventKind::Login, move |e| {
            sink.lock().unwrap().push(e.clone());
        });

        puppet.login("wxid_a1");

        assert!(puppet.is_logged_in());
        assert_eq!(puppet.current_user_id().as_deref(), Some("wxid_a1"));
        assert_eq!(seen.lock().unwrap().as_slice(), &[PuppetEvent::login("wxid_a1")]);
    }

    #[tokio::test]
    async fn test_stop_logs_out_with_stop_reason() {
        let puppet = MockPuppet::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        puppet.events().on(EventKind::Logout, move |e| {
            sink.lock().unwrap().push(e.clone());
        });

        puppet.login("wxid_a1");
        puppet.stop().await.unwrap();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[PuppetEvent::logout("wxid_a1", "puppet stop()")]
        );
    }

    #[tokio::test]
    async fn test_send_text_requires_login() {
        let puppet = MockPuppet::new();
        assert!(matches!(
            puppet.message_send_text("c1", "hi", &[]).await,
            Err(PuppetServiceError::NotLoggedIn)
        ));

        puppet.login("wxid_a1");
        let id = puppet.message_send_text("c1", "hi", &[]).await.unwrap().unwrap();
        let payload = puppet.message_payload(&id).await.unwrap();
        assert_eq!(payload.text.as_deref(), Some("hi"));
        assert_eq!(payload.listener_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_alias_change_marks_contact_dirty() {
        let puppet = MockPuppet::new();
        puppet.add_contact(ContactPayload {
            id: "c1".into(),
            ..Default::default()
        });
        let dirty = Arc::new(Mutex::new(0));
        let count = dirty.clone();
        puppet.events().on(EventKind::Dirty, move |_| {
            *count.lock().unwrap() += 1;
        });

        puppet.set_contact_alias("c1", Some("Bob")).await.unwrap();

        assert_eq!(puppet.contact_alias("c1").await.unwrap().as_deref(), Some("Bob"));
        assert_eq!(*dirty.lock().unwrap(), 1);
    }
}
