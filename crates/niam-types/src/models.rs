use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

pub type MessageId = Uuid;
pub type UserId = Uuid;

/// A named message channel with its own message sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Room {
    Public,
    Admin,
}

impl Room {
    pub fn as_str(&self) -> &'static str {
        match self {
            Room::Public => "public",
            Room::Admin => "admin",
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Room {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Room::Public),
            "admin" => Ok(Room::Admin),
            other => Err(ValidationError::UnknownRoom(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }

    /// Admins and owners share access to the admin room.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Admin | Role::Owner)
    }

    pub fn can_access(&self, room: Room) -> bool {
        match room {
            Room::Public => true,
            Room::Admin => self.is_privileged(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            "owner" => Ok(Role::Owner),
            other => Err(ValidationError::UnknownRole(other.to_string())),
        }
    }
}

/// A chat message as held locally.
///
/// `likes` and `dislikes` never share a user id; see [`Message::toggle_like`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub room: Room,
    pub sender_id: UserId,
    pub sender_display_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub likes: BTreeSet<UserId>,
    pub dislikes: BTreeSet<UserId>,
    pub reply_to_id: Option<MessageId>,
    pub image_ref: Option<String>,
    pub deleted: bool,
}

impl Message {
    /// Toggle `user`'s like, clearing any dislike they had.
    pub fn toggle_like(&mut self, user: UserId) {
        self.dislikes.remove(&user);
        if !self.likes.remove(&user) {
            self.likes.insert(user);
        }
    }

    /// Toggle `user`'s dislike, clearing any like they had.
    pub fn toggle_dislike(&mut self, user: UserId) {
        self.likes.remove(&user);
        if !self.dislikes.remove(&user) {
            self.dislikes.insert(user);
        }
    }

    /// True when the fields a poll or an update can change are equal.
    pub fn same_content(&self, other: &Message) -> bool {
        self.text == other.text
            && self.likes == other.likes
            && self.dislikes == other.dislikes
            && self.image_ref == other.image_ref
            && self.reply_to_id == other.reply_to_id
            && self.deleted == other.deleted
            && self.room == other.room
            && self.timestamp == other.timestamp
    }
}

/// Presence of a single user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    pub online: bool,
    pub typing: bool,
    pub last_seen: DateTime<Utc>,
}

impl PresenceRecord {
    /// Name shown in typing text and user lists.
    pub fn shown_name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.username
        } else {
            &self.display_name
        }
    }

    pub fn same_presence(&self, other: &PresenceRecord) -> bool {
        self.online == other.online
            && self.typing == other.typing
            && self.role == other.role
            && self.username == other.username
            && self.display_name == other.display_name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub id: Uuid,
    pub author_id: Option<UserId>,
    pub author_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Identity of the local user, fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub role: Role,
}
