//! Puppet events and the envelope that carries them over the stream.

use crate::emitter::Dispatchable;
use crate::error::{PuppetServiceError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every event kind a puppet can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Heartbeat,
    Message,
    Dong,
    Error,
    Friendship,
    RoomInvite,
    RoomJoin,
    RoomLeave,
    RoomTopic,
    Scan,
    Ready,
    Reset,
    Login,
    Logout,
    Dirty,
    Tag,
    VerifyCode,
}

impl EventKind {
    pub const ALL: [EventKind; 17] = [
        EventKind::Heartbeat,
        EventKind::Message,
        EventKind::Dong,
        EventKind::Error,
        EventKind::Friendship,
        EventKind::RoomInvite,
        EventKind::RoomJoin,
        EventKind::RoomLeave,
        EventKind::RoomTopic,
        EventKind::Scan,
        EventKind::Ready,
        EventKind::Reset,
        EventKind::Login,
        EventKind::Logout,
        EventKind::Dirty,
        EventKind::Tag,
        EventKind::VerifyCode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Heartbeat => "heartbeat",
            EventKind::Message => "message",
            EventKind::Dong => "dong",
            EventKind::Error => "error",
            EventKind::Friendship => "friendship",
            EventKind::RoomInvite => "room-invite",
            EventKind::RoomJoin => "room-join",
            EventKind::RoomLeave => "room-leave",
            EventKind::RoomTopic => "room-topic",
            EventKind::Scan => "scan",
            EventKind::Ready => "ready",
            EventKind::Reset => "reset",
            EventKind::Login => "login",
            EventKind::Logout => "logout",
            EventKind::Dirty => "dirty",
            EventKind::Tag => "tag",
            EventKind::VerifyCode => "verify-code",
        }
    }

    /// Kinds that may travel over the wire. `reset` is local only.
    pub fn is_transmitted(&self) -> bool {
        !matches!(self, EventKind::Reset)
    }

    /// Kinds that carry a sequence number. Heartbeats are fire-and-forget.
    pub fn is_sequenced(&self) -> bool {
        !matches!(self, EventKind::Heartbeat)
    }

    pub fn transmitted() -> impl Iterator<Item = EventKind> {
        Self::ALL.into_iter().filter(EventKind::is_transmitted)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = PuppetServiceError;

    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| PuppetServiceError::UnknownEventKind(s.to_string()))
    }
}

/// Progress of a login QR code scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Unknown,
    Cancel,
    Waiting,
    Scanned,
    Confirmed,
    Timeout,
}

/// Entity kinds whose cached payload can be invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirtyType {
    Message,
    Contact,
    Room,
    RoomMember,
    Friendship,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagChange {
    Create,
    Delete,
    Rename,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyCodeScene {
    Unknown,
    Login,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyCodeStatus {
    Unknown,
    Waiting,
    Verified,
    Expired,
}

/// A typed puppet event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PuppetEvent {
    Heartbeat {
        data: String,
    },
    Message {
        message_id: String,
    },
    Dong {
        data: String,
    },
    Error {
        data: String,
    },
    Friendship {
        friendship_id: String,
    },
    RoomInvite {
        room_invitation_id: String,
    },
    RoomJoin {
        room_id: String,
        invitee_ids: Vec<String>,
        inviter_id: String,
        timestamp: DateTime<Utc>,
    },
    RoomLeave {
        room_id: String,
        removee_ids: Vec<String>,
        remover_id: String,
        timestamp: DateTime<Utc>,
    },
    RoomTopic {
        room_id: String,
        new_topic: String,
        old_topic: String,
        changer_id: String,
        timestamp: DateTime<Utc>,
    },
    Scan {
        status: ScanStatus,
        qrcode: Option<String>,
        data: Option<String>,
    },
    Ready {
        data: String,
    },
    Reset {
        data: String,
    },
    Login {
        contact_id: String,
    },
    Logout {
        contact_id: String,
        data: String,
    },
    Dirty {
        payload_type: DirtyType,
        payload_id: String,
    },
    Tag {
        change: TagChange,
        tag_ids: Vec<String>,
    },
    VerifyCode {
        id: String,
        message: String,
        scene: VerifyCodeScene,
        status: VerifyCodeStatus,
    },
}

impl PuppetEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PuppetEvent::Heartbeat { .. } => EventKind::Heartbeat,
            PuppetEvent::Message { .. } => EventKind::Message,
            PuppetEvent::Dong { .. } => EventKind::Dong,
            PuppetEvent::Error { .. } => EventKind::Error,
            PuppetEvent::Friendship { .. } => EventKind::Friendship,
            PuppetEvent::RoomInvite { .. } => EventKind::RoomInvite,
            PuppetEvent::RoomJoin { .. } => EventKind::RoomJoin,
            PuppetEvent::RoomLeave { .. } => EventKind::RoomLeave,
            PuppetEvent::RoomTopic { .. } => EventKind::RoomTopic,
            PuppetEvent::Scan { .. } => EventKind::Scan,
            PuppetEvent::Ready { .. } => EventKind::Ready,
            PuppetEvent::Reset { .. } => EventKind::Reset,
            PuppetEvent::Login { .. } => EventKind::Login,
            PuppetEvent::Logout { .. } => EventKind::Logout,
            PuppetEvent::Dirty { .. } => EventKind::Dirty,
            PuppetEvent::Tag { .. } => EventKind::Tag,
            PuppetEvent::VerifyCode { .. } => EventKind::VerifyCode,
        }
    }

    pub fn login(contact_id: impl Into<String>) -> Self {
        PuppetEvent::Login {
            contact_id: contact_id.into(),
        }
    }

    pub fn logout(contact_id: impl Into<String>, data: impl Into<String>) -> Self {
        PuppetEvent::Logout {
            contact_id: contact_id.into(),
            data: data.into(),
        }
    }

    pub fn ready(data: impl Into<String>) -> Self {
        PuppetEvent::Ready { data: data.into() }
    }

    pub fn heartbeat(data: impl Into<String>) -> Self {
        PuppetEvent::Heartbeat { data: data.into() }
    }
}

impl Dispatchable for PuppetEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        PuppetEvent::kind(self)
    }
}

/// The unit written to the event stream.
///
/// `payload` is the serialized wire record for `kind`; see
/// [`crate::codec::event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}
