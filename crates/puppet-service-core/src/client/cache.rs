//! Client-side payload cache.
//!
//! Contact, room and message payloads fetched through the session are kept
//! for a while; a `dirty` event for an id drops it, a full reset drops
//! everything.

use crate::config::SessionConfig;
use crate::event::DirtyType;
use crate::puppet::{ContactPayload, MessagePayload, RoomPayload};
use mini_moka::sync::Cache;
use std::time::Duration;
use tracing::debug;

pub struct PayloadCache {
    contacts: Cache<String, ContactPayload>,
    rooms: Cache<String, RoomPayload>,
    messages: Cache<String, MessagePayload>,
}

fn build<V: Clone + Send + Sync + 'static>(ttl: Duration, capacity: u64) -> Cache<String, V> {
    Cache::builder()
        .time_to_live(ttl)
        .max_capacity(capacity)
        .build()
}

impl Default for PayloadCache {
    fn default() -> Self {
        Self::new(
            SessionConfig::PAYLOAD_CACHE_TTL,
            SessionConfig::PAYLOAD_CACHE_CAPACITY,
        )
    }
}

impl PayloadCache {
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        Self {
            contacts: build(ttl, capacity),
            rooms: build(ttl, capacity),
            messages: build(ttl, capacity),
        }
    }

    pub fn contact(&self, id: &str) -> Option<ContactPayload> {
        self.contacts.get(&id.to_string())
    }

    pub fn put_contact(&self, payload: ContactPayload) {
        self.contacts.insert(payload.id.clone(), payload);
    }

    pub fn room(&self, id: &str) -> Option<RoomPayload> {
        self.rooms.get(&id.to_string())
    }

    pub fn put_room(&self, payload: RoomPayload) {
        self.rooms.insert(payload.id.clone(), payload);
    }

    pub fn message(&self, id: &str) -> Option<MessagePayload> {
        self.messages.get(&id.to_string())
    }

    pub fn put_message(&self, payload: MessagePayload) {
        self.messages.insert(payload.id.clone(), payload);
    }

    /// Drop whatever a `dirty` event for `kind`/`id` makes stale.
    pub fn invalidate(&self, kind: DirtyType, id: &str) {
        let key = id.to_string();
        match kind {
            DirtyType::Contact => self.contacts.invalidate(&key),
            DirtyType::Room | DirtyType::RoomMember => self.rooms.invalidate(&key),
            DirtyType::Message => self.messages.invalidate(&key),
            // Not cached on this side.
            DirtyType::Friendship | DirtyType::Post => return,
        }
        debug!("Invalidated cached {:?} {}", kind, id);
    }

    pub fn clear(&self) {
        self.contacts.invalidate_all();
        self.rooms.invalidate_all();
        self.messages.invalidate_all();
    }
}

impl std::fmt::Debug for PayloadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCache")
            .field("contacts", &self.contacts.entry_count())
            .field("rooms", &self.rooms.entry_count())
            .field("messages", &self.messages.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(id: &str) -> ContactPayload {
        ContactPayload {
            id: id.into(),
            name: id.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_dirty_contact_is_dropped() {
        let cache = PayloadCache::default();
        cache.put_contact(contact("c1"));
        cache.put_contact(contact("c2"));

        cache.invalidate(DirtyType::Contact, "c1");

        assert!(cache.contact("c1").is_none());
        assert_eq!(cache.contact("c2").unwrap().name, "c2");
    }

    #[test]
    fn test_room_member_change_drops_room() {
        let cache = PayloadCache::default();
        cache.put_room(RoomPayload {
            id: "r1".into(),
            topic: "t".into(),
            avatar: None,
            member_ids: vec![],
            owner_id: None,
            admin_ids: vec![],
        });

        cache.invalidate(DirtyType::RoomMember, "r1");
        assert!(cache.room("r1").is_none());
    }

    #[test]
    fn test_clear_drops_everything() {
        let cache = PayloadCache::default();
        cache.put_contact(contact("c1"));
        cache.clear();
        assert!(cache.contact("c1").is_none());
    }
}
