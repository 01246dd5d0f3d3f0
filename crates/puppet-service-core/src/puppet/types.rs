//! Native value objects exposed by a puppet engine.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContactGender {
    #[default]
    Unknown,
    Male,
    Female,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContactType {
    #[default]
    Unknown,
    Individual,
    Official,
    Corporation,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContactPayload {
    pub id: String,
    pub gender: ContactGender,
    pub kind: ContactType,
    pub name: String,
    pub alias: Option<String>,
    pub avatar: String,
    pub friend: bool,
    pub city: Option<String>,
    pub province: Option<String>,
    pub signature: Option<String>,
    pub handle: Option<String>,
    pub phones: Vec<String>,
    pub star: bool,
    pub tag_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoomPayload {
    pub id: String,
    pub topic: String,
    pub avatar: Option<String>,
    pub member_ids: Vec<String>,
    pub owner_id: Option<String>,
    pub admin_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    Unknown,
    Text,
    Image,
    Audio,
    Video,
    Attachment,
    Contact,
    Url,
    MiniProgram,
    Recalled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePayload {
    pub id: String,
    pub kind: MessageType,
    pub talker_id: Option<String>,
    pub listener_id: Option<String>,
    pub room_id: Option<String>,
    pub text: Option<String>,
    pub filename: Option<String>,
    pub mention_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

