use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{Announcement, Message, PresenceRecord, Room};

/// Remote tables the engine watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Messages,
    Users,
    Announcements,
}

impl Entity {
    pub const ALL: [Entity; 3] = [Entity::Messages, Entity::Users, Entity::Announcements];

    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Messages => "messages",
            Entity::Users => "users",
            Entity::Announcements => "announcements",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// Validated body of a change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Message(Message),
    User(PresenceRecord),
    Announcement(Announcement),
}

/// One candidate change, emitted by the push feed, the poller or a local write.
///
/// The shape is the same for every source so the reconciler treats them alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub payload: Payload,
}

impl ChangeEvent {
    pub fn message(op: ChangeOp, message: Message) -> Self {
        Self {
            op,
            payload: Payload::Message(message),
        }
    }

    pub fn user(op: ChangeOp, record: PresenceRecord) -> Self {
        Self {
            op,
            payload: Payload::User(record),
        }
    }

    pub fn announcement(op: ChangeOp, announcement: Announcement) -> Self {
        Self {
            op,
            payload: Payload::Announcement(announcement),
        }
    }

    pub fn entity(&self) -> Entity {
        match self.payload {
            Payload::Message(_) => Entity::Messages,
            Payload::User(_) => Entity::Users,
            Payload::Announcement(_) => Entity::Announcements,
        }
    }

    /// Returns the room if this event is scoped to one.
    pub fn room(&self) -> Option<Room> {
        match &self.payload {
            Payload::Message(m) => Some(m.room),
            _ => None,
        }
    }
}
