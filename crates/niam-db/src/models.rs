//! Database row types. These map directly to SQLite rows.
//! Converted to the wire records of niam-types at the remote boundary.
use niam_types::records::{AnnouncementRecord, MessageRecord, UserRecord};

pub struct MessageRow {
    pub id: String,
    pub room: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: String,
    /// JSON array of user ids
    pub likes: String,
    pub dislikes: String,
    pub reply_to: Option<String>,
    pub image_url: Option<String>,
    pub deleted: bool,
}

impl MessageRow {
    pub fn into_record(self) -> MessageRecord {
        MessageRecord {
            id: self.id,
            room: self.room,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            text: self.text,
            timestamp: self.timestamp,
            likes: serde_json::from_str(&self.likes).unwrap_or_default(),
            dislikes: serde_json::from_str(&self.dislikes).unwrap_or_default(),
            reply_to: self.reply_to,
            image_url: self.image_url,
            deleted: self.deleted,
        }
    }
}

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub role: String,
    pub online: bool,
    pub typing: bool,
    pub last_seen: String,
}

impl UserRow {
    pub fn into_record(self) -> UserRecord {
        UserRecord {
            id: self.id,
            username: self.username,
            display_name: self.display_name,
            role: self.role,
            online: self.online,
            typing: self.typing,
            last_seen: Some(self.last_seen),
        }
    }
}

pub struct AnnouncementRow {
    pub id: String,
    pub author_id: Option<String>,
    pub author_name: String,
    pub text: String,
    pub created_at: String,
}

impl AnnouncementRow {
    pub fn into_record(self) -> AnnouncementRecord {
        AnnouncementRecord {
            id: self.id,
            author_id: self.author_id,
            author_name: self.author_name,
            text: self.text,
            created_at: self.created_at,
        }
    }
}
