//! Event payload wire records.
//!
//! Each transmitted event kind has one camelCase record. Enumerations travel
//! as integers and timestamps as epoch milliseconds, as the wire schema
//! defines them; unknown integers are rejected rather than defaulted.

use super::{millis_to_datetime, datetime_to_millis};
use crate::error::{PuppetServiceError, Result};
use crate::event::{
    DirtyType, EventEnvelope, EventKind, PuppetEvent, ScanStatus, TagChange, VerifyCodeScene,
    VerifyCodeStatus,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataRecord {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRecord {
    message_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FriendshipRecord {
    friendship_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomInviteRecord {
    room_invitation_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomJoinRecord {
    room_id: String,
    invitee_id_list: Vec<String>,
    inviter_id: String,
    timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomLeaveRecord {
    room_id: String,
    removee_id_list: Vec<String>,
    remover_id: String,
    timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomTopicRecord {
    room_id: String,
    new_topic: String,
    old_topic: String,
    changer_id: String,
    timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanRecord {
    status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    qrcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRecord {
    contact_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogoutRecord {
    contact_id: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirtyRecord {
    payload_type: i32,
    payload_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TagRecord {
    change: i32,
    tag_id_list: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyCodeRecord {
    id: String,
    message: String,
    scene: i32,
    status: i32,
}

fn scan_status_to_wire(status: ScanStatus) -> i32 {
    match status {
        ScanStatus::Unknown => 0,
        ScanStatus::Cancel => 1,
        ScanStatus::Waiting => 2,
        ScanStatus::Scanned => 3,
        ScanStatus::Confirmed => 4,
        ScanStatus::Timeout => 5,
    }
}

fn scan_status_from_wire(value: i32) -> Result<ScanStatus> {
    Ok(match value {
        0 => ScanStatus::Unknown,
        1 => ScanStatus::Cancel,
        2 => ScanStatus::Waiting,
        3 => ScanStatus::Scanned,
        4 => ScanStatus::Confirmed,
        5 => ScanStatus::Timeout,
        other => return Err(unknown("scan status", other)),
    })
}

/// Wire value 0 is `unspecified` and is never valid on an event.
pub fn dirty_type_to_wire(kind: DirtyType) -> i32 {
    match kind {
        DirtyType::Message => 1,
        DirtyType::Contact => 2,
        DirtyType::Room => 3,
        DirtyType::RoomMember => 4,
        DirtyType::Friendship => 5,
        DirtyType::Post => 6,
    }
}

pub fn dirty_type_from_wire(value: i32) -> Result<DirtyType> {
    Ok(match value {
        1 => DirtyType::Message,
        2 => DirtyType::Contact,
        3 => DirtyType::Room,
        4 => DirtyType::RoomMember,
        5 => DirtyType::Friendship,
        6 => DirtyType::Post,
        other => return Err(unknown("dirty payload type", other)),
    })
}

fn tag_change_to_wire(change: TagChange) -> i32 {
    match change {
        TagChange::Create => 1,
        TagChange::Delete => 2,
        TagChange::Rename => 3,
    }
}

fn tag_change_from_wire(value: i32) -> Result<TagChange> {
    Ok(match value {
        1 => TagChange::Create,
        2 => TagChange::Delete,
        3 => TagChange::Rename,
        other => return Err(unknown("tag change", other)),
    })
}

fn scene_to_wire(scene: VerifyCodeScene) -> i32 {
    match scene {
        VerifyCodeScene::Unknown => 0,
        VerifyCodeScene::Login => 1,
    }
}

fn scene_from_wire(value: i32) -> Result<VerifyCodeScene> {
    Ok(match value {
        0 => VerifyCodeScene::Unknown,
        1 => VerifyCodeScene::Login,
        other => return Err(unknown("verify code scene", other)),
    })
}

fn verify_status_to_wire(status: VerifyCodeStatus) -> i32 {
    match status {
        VerifyCodeStatus::Unknown => 0,
        VerifyCodeStatus::Waiting => 1,
        VerifyCodeStatus::Verified => 2,
        VerifyCodeStatus::Expired => 3,
    }
}

fn verify_status_from_wire(value: i32) -> Result<VerifyCodeStatus> {
    Ok(match value {
        0 => VerifyCodeStatus::Unknown,
        1 => VerifyCodeStatus::Waiting,
        2 => VerifyCodeStatus::Verified,
        3 => VerifyCodeStatus::Expired,
        other => return Err(unknown("verify code status", other)),
    })
}

fn unknown(what: &str, value: i32) -> PuppetServiceError {
    PuppetServiceError::payload(what, format!("unknown value {}", value))
}

fn to_json<T: Serialize>(record: &T) -> Result<String> {
    Ok(serde_json::to_string(record)?)
}

fn from_json<T: DeserializeOwned>(kind: EventKind, payload: &str) -> Result<T> {
    serde_json::from_str(payload)
        .map_err(|e| PuppetServiceError::payload(kind.as_str(), e.to_string()))
}

/// Serialize the payload of an event. `reset` is refused.
pub fn encode_payload(event: &PuppetEvent) -> Result<String> {
    match event {
        PuppetEvent::Heartbeat { data }
        | PuppetEvent::Dong { data }
        | PuppetEvent::Error { data }
        | PuppetEvent::Ready { data } => to_json(&DataRecord { data: data.clone() }),
        PuppetEvent::Message { message_id } => to_json(&MessageRecord {
            message_id: message_id.clone(),
        }),
        PuppetEvent::Friendship { friendship_id } => to_json(&FriendshipRecord {
            friendship_id: friendship_id.clone(),
        }),
        PuppetEvent::RoomInvite { room_invitation_id } => to_json(&RoomInviteRecord {
            room_invitation_id: room_invitation_id.clone(),
        }),
        PuppetEvent::RoomJoin {
            room_id,
            invitee_ids,
            inviter_id,
            timestamp,
        } => to_json(&RoomJoinRecord {
            room_id: room_id.clone(),
            invitee_id_list: invitee_ids.clone(),
            inviter_id: inviter_id.clone(),
            timestamp: datetime_to_millis(timestamp),
        }),
        PuppetEvent::RoomLeave {
            room_id,
            removee_ids,
            remover_id,
            timestamp,
        } => to_json(&RoomLeaveRecord {
            room_id: room_id.clone(),
            removee_id_list: removee_ids.clone(),
            remover_id: remover_id.clone(),
            timestamp: datetime_to_millis(timestamp),
        }),
        PuppetEvent::RoomTopic {
            room_id,
            new_topic,
            old_topic,
            changer_id,
            timestamp,
        } => to_json(&RoomTopicRecord {
            room_id: room_id.clone(),
            new_topic: new_topic.clone(),
            old_topic: old_topic.clone(),
            changer_id: changer_id.clone(),
            timestamp: datetime_to_millis(timestamp),
        }),
        PuppetEvent::Scan {
            status,
            qrcode,
            data,
        } => to_json(&ScanRecord {
            status: scan_status_to_wire(*status),
            qrcode: qrcode.clone(),
            data: data.clone(),
        }),
        PuppetEvent::Reset { .. } => Err(PuppetServiceError::ResetNotTransmittable),
        PuppetEvent::Login { contact_id } => to_json(&LoginRecord {
            contact_id: contact_id.clone(),
        }),
        PuppetEvent::Logout { contact_id, data } => to_json(&LogoutRecord {
            contact_id: contact_id.clone(),
            data: data.clone(),
        }),
        PuppetEvent::Dirty {
            payload_type,
            payload_id,
        } => to_json(&DirtyRecord {
            payload_type: dirty_type_to_wire(*payload_type),
            payload_id: payload_id.clone(),
        }),
        PuppetEvent::Tag { change, tag_ids } => to_json(&TagRecord {
            change: tag_change_to_wire(*change),
            tag_id_list: tag_ids.clone(),
        }),
        PuppetEvent::VerifyCode {
            id,
            message,
            scene,
            status,
        } => to_json(&VerifyCodeRecord {
            id: id.clone(),
            message: message.clone(),
            scene: scene_to_wire(*scene),
            status: verify_status_to_wire(*status),
        }),
    }
}

/// Rebuild an event from its kind and serialized payload.
pub fn decode_payload(kind: EventKind, payload: &str) -> Result<PuppetEvent> {
    Ok(match kind {
        EventKind::Heartbeat => PuppetEvent::Heartbeat {
            data: from_json::<DataRecord>(kind, payload)?.data,
        },
        EventKind::Dong => PuppetEvent::Dong {
            data: from_json::<DataRecord>(kind, payload)?.data,
        },
        EventKind::Error => PuppetEvent::Error {
            data: from_json::<DataRecord>(kind, payload)?.data,
        },
        EventKind::Ready => PuppetEvent::Ready {
            data: from_json::<DataRecord>(kind, payload)?.data,
        },
        EventKind::Message => PuppetEvent::Message {
            message_id: from_json::<MessageRecord>(kind, payload)?.message_id,
        },
        EventKind::Friendship => PuppetEvent::Friendship {
            friendship_id: from_json::<FriendshipRecord>(kind, payload)?.friendship_id,
        },
        EventKind::RoomInvite => PuppetEvent::RoomInvite {
            room_invitation_id: from_json::<RoomInviteRecord>(kind, payload)?.room_invitation_id,
        },
        EventKind::RoomJoin => {
            let r: RoomJoinRecord = from_json(kind, payload)?;
            PuppetEvent::RoomJoin {
                room_id: r.room_id,
                invitee_ids: r.invitee_id_list,
                inviter_id: r.inviter_id,
                timestamp: millis_to_datetime(r.timestamp)?,
            }
        }
        EventKind::RoomLeave => {
            let r: RoomLeaveRecord = from_json(kind, payload)?;
            PuppetEvent::RoomLeave {
                room_id: r.room_id,
                removee_ids: r.removee_id_list,
                remover_id: r.remover_id,
                timestamp: millis_to_datetime(r.timestamp)?,
            }
        }
        EventKind::RoomTopic => {
            let r: RoomTopicRecord = from_json(kind, payload)?;
            PuppetEvent::RoomTopic {
                room_id: r.room_id,
                new_topic: r.new_topic,
                old_topic: r.old_topic,
                changer_id: r.changer_id,
                timestamp: millis_to_datetime(r.timestamp)?,
            }
        }
        EventKind::Scan => {
            let r: ScanRecord = from_json(kind, payload)?;
            PuppetEvent::Scan {
                status: scan_status_from_wire(r.status)?,
                qrcode: r.qrcode,
                data: r.data,
            }
        }
        EventKind::Reset => return Err(PuppetServiceError::ResetNotTransmittable),
        EventKind::Login => PuppetEvent::Login {
            contact_id: from_json::<LoginRecord>(kind, payload)?.contact_id,
        },
        EventKind::Logout => {
            let r: LogoutRecord = from_json(kind, payload)?;
            PuppetEvent::Logout {
                contact_id: r.contact_id,
                data: r.data,
            }
        }
        EventKind::Dirty => {
            let r: DirtyRecord = from_json(kind, payload)?;
            PuppetEvent::Dirty {
                payload_type: dirty_type_from_wire(r.payload_type)?,
                payload_id: r.payload_id,
            }
        }
        EventKind::Tag => {
            let r: TagRecord = from_json(kind, payload)?;
            PuppetEvent::Tag {
                change: tag_change_from_wire(r.change)?,
                tag_ids: r.tag_id_list,
            }
        }
        EventKind::VerifyCode => {
            let r: VerifyCodeRecord = from_json(kind, payload)?;
            PuppetEvent::VerifyCode {
                id: r.id,
                message: r.message,
                scene: scene_from_wire(r.scene)?,
                status: verify_status_from_wire(r.status)?,
            }
        }
    })
}

/// Build an envelope for `event` with the given sequence number.
pub fn encode_envelope(event: &PuppetEvent, seq: Option<u64>) -> Result<EventEnvelope> {
    Ok(EventEnvelope {
        kind: event.kind(),
        payload: encode_payload(event)?,
        seq,
    })
}

pub fn decode_envelope(envelope: &EventEnvelope) -> Result<PuppetEvent> {
    decode_payload(envelope.kind, &envelope.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn one_of_each() -> Vec<PuppetEvent> {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        vec![
            PuppetEvent::heartbeat("stream ready"),
            PuppetEvent::Message {
                message_id: "m1".into(),
            },
            PuppetEvent::Dong { data: "d".into() },
            PuppetEvent::Error {
                data: "{\"message\":\"boom\"}".into(),
            },
            PuppetEvent::Friendship {
                friendship_id: "f1".into(),
            },
            PuppetEvent::RoomInvite {
                room_invitation_id: "ri1".into(),
            },
            PuppetEvent::RoomJoin {
                room_id: "r1".into(),
                invitee_ids: vec!["c1".into(), "c2".into()],
                inviter_id: "c3".into(),
                timestamp: ts,
            },
            PuppetEvent::RoomLeave {
                room_id: "r1".into(),
                removee_ids: vec!["c1".into()],
                remover_id: "c3".into(),
                timestamp: ts,
            },
            PuppetEvent::RoomTopic {
                room_id: "r1".into(),
                new_topic: "new".into(),
                old_topic: "old".into(),
                changer_id: "c3".into(),
                timestamp: ts,
            },
            PuppetEvent::Scan {
                status: ScanStatus::Waiting,
                qrcode: Some("https://qr".into()),
                data: None,
            },
            PuppetEvent::ready("ready"),
            PuppetEvent::login("wxid_a1"),
            PuppetEvent::logout("wxid_a1", "bye"),
            PuppetEvent::Dirty {
                payload_type: DirtyType::RoomMember,
                payload_id: "r1".into(),
            },
            PuppetEvent::Tag {
                change: TagChange::Rename,
                tag_ids: vec!["t1".into()],
            },
            PuppetEvent::VerifyCode {
                id: "v1".into(),
                message: "enter code".into(),
                scene: VerifyCodeScene::Login,
                status: VerifyCodeStatus::Waiting,
            },
        ]
    }

    #[test]
    fn test_every_transmitted_kind_survives_the_wire() {
        let events = one_of_each();
        let kinds: std::collections::HashSet<EventKind> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.len(), EventKind::transmitted().count());

        for (seq, event) in events.into_iter().enumerate() {
            let envelope = encode_envelope(&event, Some(seq as u64)).unwrap();
            let bytes = serde_json::to_vec(&envelope).unwrap();
            let received: EventEnvelope = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(decode_envelope(&received).unwrap(), event);
        }
    }

    #[test]
    fn test_reset_is_refused_both_ways() {
        let reset = PuppetEvent::Reset { data: "x".into() };
        assert!(matches!(
            encode_payload(&reset),
            Err(PuppetServiceError::ResetNotTransmittable)
        ));
        assert!(decode_payload(EventKind::Reset, "{}").is_err());
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let json = encode_payload(&PuppetEvent::login("wxid_a1")).unwrap();
        assert_eq!(json, r#"{"contactId":"wxid_a1"}"#);
    }

    #[test]
    fn test_unspecified_dirty_type_is_rejected() {
        let payload = r#"{"payloadType":0,"payloadId":"x"}"#;
        assert!(matches!(
            decode_payload(EventKind::Dirty, payload),
            Err(PuppetServiceError::Payload { .. })
        ));
    }

    #[test]
    fn test_malformed_payload_is_a_payload_error() {
        assert!(matches!(
            decode_payload(EventKind::Login, "not json"),
            Err(PuppetServiceError::Payload { .. })
        ));
    }
}
