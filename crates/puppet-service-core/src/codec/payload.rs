//! Contact, room and message wire records.
//!
//! Entity enums are lenient: an integer this side does not know maps to the
//! `Unknown` variant so newer servers stay readable.

use super::{datetime_to_millis, millis_to_datetime};
use crate::error::Result;
use crate::puppet::types::{
    ContactGender, ContactPayload, ContactType, MessagePayload, MessageType, RoomPayload,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRecord {
    pub id: String,
    pub gender: i32,
    #[serde(rename = "type")]
    pub contact_type: i32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub friend: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weixin: Option<String>,
    #[serde(default)]
    pub phone_list: Vec<String>,
    #[serde(default)]
    pub star: bool,
    #[serde(default)]
    pub tag_id_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub id: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub member_id_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub admin_id_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub mention_id_list: Vec<String>,
    pub timestamp: i64,
}

fn gender_to_wire(gender: ContactGender) -> i32 {
    match gender {
        ContactGender::Unknown => 0,
        ContactGender::Male => 1,
        ContactGender::Female => 2,
    }
}

fn gender_from_wire(value: i32) -> ContactGender {
    match value {
        1 => ContactGender::Male,
        2 => ContactGender::Female,
        _ => ContactGender::Unknown,
    }
}

fn contact_type_to_wire(kind: ContactType) -> i32 {
    match kind {
        ContactType::Unknown => 0,
        ContactType::Individual => 1,
        ContactType::Official => 2,
        ContactType::Corporation => 3,
    }
}

fn contact_type_from_wire(value: i32) -> ContactType {
    match value {
        1 => ContactType::Individual,
        2 => ContactType::Official,
        3 => ContactType::Corporation,
        _ => ContactType::Unknown,
    }
}

fn message_type_to_wire(kind: MessageType) -> i32 {
    match kind {
        MessageType::Unknown => 0,
        MessageType::Attachment => 1,
        MessageType::Audio => 2,
        MessageType::Contact => 3,
        MessageType::Image => 6,
        MessageType::Text => 7,
        MessageType::MiniProgram => 9,
        MessageType::Recalled => 13,
        MessageType::Url => 14,
        MessageType::Video => 15,
    }
}

fn message_type_from_wire(value: i32) -> MessageType {
    match value {
        1 => MessageType::Attachment,
        2 => MessageType::Audio,
        3 => MessageType::Contact,
        6 => MessageType::Image,
        7 => MessageType::Text,
        9 => MessageType::MiniProgram,
        13 => MessageType::Recalled,
        14 => MessageType::Url,
        15 => MessageType::Video,
        _ => MessageType::Unknown,
    }
}

pub fn contact_to_wire(contact: &ContactPayload) -> ContactRecord {
    ContactRecord {
        id: contact.id.clone(),
        gender: gender_to_wire(contact.gender),
        contact_type: contact_type_to_wire(contact.kind),
        name: contact.name.clone(),
        alias: contact.alias.clone(),
        avatar: contact.avatar.clone(),
        friend: contact.friend,
        city: contact.city.clone(),
        province: contact.province.clone(),
        signature: contact.signature.clone(),
        weixin: contact.handle.clone(),
        phone_list: contact.phones.clone(),
        star: contact.star,
        tag_id_list: contact.tag_ids.clone(),
    }
}

pub fn contact_from_wire(record: ContactRecord) -> ContactPayload {
    ContactPayload {
        id: record.id,
        gender: gender_from_wire(record.gender),
        kind: contact_type_from_wire(record.contact_type),
        name: record.name,
        alias: record.alias,
        avatar: record.avatar,
        friend: record.friend,
        city: record.city,
        province: record.province,
        signature: record.signature,
        handle: record.weixin,
        phones: record.phone_list,
        star: record.star,
        tag_ids: record.tag_id_list,
    }
}

pub fn room_to_wire(room: &RoomPayload) -> RoomRecord {
    RoomRecord {
        id: room.id.clone(),
        topic: room.topic.clone(),
        avatar: room.avatar.clone(),
        member_id_list: room.member_ids.clone(),
        owner_id: room.owner_id.clone(),
        admin_id_list: room.admin_ids.clone(),
    }
}

pub fn room_from_wire(record: RoomRecord) -> RoomPayload {
    RoomPayload {
        id: record.id,
        topic: record.topic,
        avatar: record.avatar,
        member_ids: record.member_id_list,
        owner_id: record.owner_id,
        admin_ids: record.admin_id_list,
    }
}

pub fn message_to_wire(message: &MessagePayload) -> MessageRecord {
    MessageRecord {
        id: message.id.clone(),
        message_type: message_type_to_wire(message.kind),
        talker_id: message.talker_id.clone(),
        listener_id: message.listener_id.clone(),
        room_id: message.room_id.clone(),
        text: message.text.clone(),
        filename: message.filename.clone(),
        mention_id_list: message.mention_ids.clone(),
        timestamp: datetime_to_millis(&message.timestamp),
    }
}

pub fn message_from_wire(record: MessageRecord) -> Result<MessagePayload> {
    Ok(MessagePayload {
        id: record.id,
        kind: message_type_from_wire(record.message_type),
        talker_id: record.talker_id,
        listener_id: record.listener_id,
        room_id: record.room_id,
        text: record.text,
        filename: record.filename,
        mention_ids: record.mention_id_list,
        timestamp: millis_to_datetime(record.timestamp)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_contact_record_uses_wire_names() {
        let contact = ContactPayload {
            id: "c1".into(),
            gender: ContactGender::Female,
            kind: ContactType::Individual,
            name: "Alice".into(),
            handle: Some("alice_wx".into()),
            phones: vec!["+100".into()],
            ..Default::default()
        };
        let json = serde_json::to_value(contact_to_wire(&contact)).unwrap();
        assert_eq!(json["type"], 1);
        assert_eq!(json["gender"], 2);
        assert_eq!(json["weixin"], "alice_wx");
        assert_eq!(json["phoneList"][0], "+100");

        let back: ContactRecord = serde_json::from_value(json).unwrap();
        assert_eq!(contact_from_wire(back), contact);
    }

    #[test]
    fn test_unknown_contact_enums_fall_back() {
        let record = ContactRecord {
            id: "c1".into(),
            gender: 42,
            contact_type: 99,
            name: "x".into(),
            alias: None,
            avatar: String::new(),
            friend: false,
            city: None,
            province: None,
            signature: None,
            weixin: None,
            phone_list: vec![],
            star: false,
            tag_id_list: vec![],
        };
        let contact = contact_from_wire(record);
        assert_eq!(contact.gender, ContactGender::Unknown);
        assert_eq!(contact.kind, ContactType::Unknown);
    }

    #[test]
    fn test_message_timestamp_travels_as_millis() {
        let message = MessagePayload {
            id: "m1".into(),
            kind: MessageType::Text,
            talker_id: Some("c1".into()),
            listener_id: None,
            room_id: Some("r1".into()),
            text: Some("hi".into()),
            filename: None,
            mention_ids: vec!["c2".into()],
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_500).unwrap(),
        };
        let record = message_to_wire(&message);
        assert_eq!(record.timestamp, 1_700_000_000_500);
        assert_eq!(record.message_type, 7);
        assert_eq!(message_from_wire(record).unwrap(), message);
    }

    #[test]
    fn test_room_record_defaults_missing_lists() {
        let record: RoomRecord = serde_json::from_str(r#"{"id":"r1","topic":"t"}"#).unwrap();
        let room = room_from_wire(record);
        assert!(room.member_ids.is_empty());
        assert_eq!(room.owner_id, None);
    }
}
