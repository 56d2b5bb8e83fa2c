use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::models::{Announcement, Message, PresenceRecord, Room, UserId};

pub const MAX_MESSAGE_CHARS: usize = 1000;

/// Code point ranges refused in message text (emoji blocks and regional indicators).
const DISALLOWED_RANGES: [(u32, u32); 4] = [
    (0x1F600, 0x1F64F),
    (0x1F300, 0x1F5FF),
    (0x1F680, 0x1F6FF),
    (0x1F1E0, 0x1F1FF),
];

/// Trim and validate outgoing message text. Returns the text to store.
pub fn validate_message_text(text: &str, has_image: bool) -> Result<String, ValidationError> {
    let text = text.trim();
    if text.is_empty() && !has_image {
        return Err(ValidationError::EmptyMessage);
    }

    let len = text.chars().count();
    if len > MAX_MESSAGE_CHARS {
        return Err(ValidationError::TooLong {
            len,
            max: MAX_MESSAGE_CHARS,
        });
    }

    for c in text.chars() {
        let cp = c as u32;
        if DISALLOWED_RANGES.iter().any(|&(lo, hi)| (lo..=hi).contains(&cp)) {
            return Err(ValidationError::DisallowedCodePoint(cp));
        }
        if c.is_control() && c != '\n' && c != '\t' {
            return Err(ValidationError::DisallowedCodePoint(cp));
        }
    }

    Ok(text.to_string())
}

// -- Messages --

/// A `messages` row as it travels to and from the remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub room: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub text: String,
    pub timestamp: String,
    #[serde(default)]
    pub likes: Vec<String>,
    #[serde(default)]
    pub dislikes: Vec<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl From<&Message> for MessageRecord {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id.to_string(),
            room: msg.room.as_str().to_string(),
            sender_id: msg.sender_id.to_string(),
            sender_name: msg.sender_display_name.clone(),
            text: msg.text.clone(),
            timestamp: msg.timestamp.to_rfc3339(),
            likes: msg.likes.iter().map(Uuid::to_string).collect(),
            dislikes: msg.dislikes.iter().map(Uuid::to_string).collect(),
            reply_to: msg.reply_to_id.map(|id| id.to_string()),
            image_url: msg.image_ref.clone(),
            deleted: msg.deleted,
        }
    }
}

impl TryFrom<MessageRecord> for Message {
    type Error = ValidationError;

    fn try_from(rec: MessageRecord) -> Result<Self, Self::Error> {
        const ENTITY: &str = "message";

        let id = parse_uuid(ENTITY, "id", &rec.id)?;
        let room: Room = rec.room.parse()?;
        let sender_id = parse_uuid(ENTITY, "sender_id", &rec.sender_id)?;
        let timestamp = parse_timestamp(ENTITY, "timestamp", &rec.timestamp)?;

        let len = rec.text.chars().count();
        if len > MAX_MESSAGE_CHARS {
            return Err(ValidationError::TooLong {
                len,
                max: MAX_MESSAGE_CHARS,
            });
        }

        let likes = rec
            .likes
            .iter()
            .map(|s| parse_uuid(ENTITY, "likes", s))
            .collect::<Result<std::collections::BTreeSet<_>, _>>()?;
        // A user in both sets is a remote race; the like wins.
        let dislikes = rec
            .dislikes
            .iter()
            .map(|s| parse_uuid(ENTITY, "dislikes", s))
            .filter(|r| r.as_ref().map_or(true, |id| !likes.contains(id)))
            .collect::<Result<std::collections::BTreeSet<_>, _>>()?;

        let reply_to_id = match rec.reply_to.as_deref() {
            None | Some("") => None,
            Some(s) => Some(parse_uuid(ENTITY, "reply_to", s)?),
        };

        Ok(Message {
            id,
            room,
            sender_id,
            sender_display_name: rec.sender_name,
            text: rec.text,
            timestamp,
            likes,
            dislikes,
            reply_to_id,
            image_ref: rec.image_url.filter(|s| !s.is_empty()),
            deleted: rec.deleted,
        })
    }
}

/// Partial update of a `messages` row. Delete is `deleted: Some(true)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub likes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dislikes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

impl MessagePatch {
    pub fn reactions(msg: &Message) -> Self {
        Self {
            likes: Some(msg.likes.iter().map(Uuid::to_string).collect()),
            dislikes: Some(msg.dislikes.iter().map(Uuid::to_string).collect()),
            deleted: None,
        }
    }

    pub fn tombstone() -> Self {
        Self {
            deleted: Some(true),
            ..Default::default()
        }
    }
}

// -- Users --

/// A `users` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub typing: bool,
    #[serde(default)]
    pub last_seen: Option<String>,
}

fn default_role() -> String {
    "user".to_string()
}

impl From<&PresenceRecord> for UserRecord {
    fn from(p: &PresenceRecord) -> Self {
        Self {
            id: p.user_id.to_string(),
            username: p.username.clone(),
            display_name: Some(p.display_name.clone()),
            role: p.role.as_str().to_string(),
            online: p.online,
            typing: p.typing,
            last_seen: Some(p.last_seen.to_rfc3339()),
        }
    }
}

impl TryFrom<UserRecord> for PresenceRecord {
    type Error = ValidationError;

    fn try_from(rec: UserRecord) -> Result<Self, Self::Error> {
        const ENTITY: &str = "user";

        let user_id = parse_uuid(ENTITY, "id", &rec.id)?;
        if rec.username.trim().is_empty() {
            return Err(ValidationError::malformed(ENTITY, "empty username"));
        }
        let last_seen = match rec.last_seen.as_deref() {
            Some(s) => parse_timestamp(ENTITY, "last_seen", s)?,
            None => DateTime::<Utc>::default(),
        };

        Ok(PresenceRecord {
            user_id,
            display_name: rec.display_name.unwrap_or_default(),
            username: rec.username,
            role: rec.role.parse()?,
            online: rec.online,
            typing: rec.online && rec.typing,
            last_seen,
        })
    }
}

/// Partial update of a `users` row, used by heartbeats and typing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}

impl UserPatch {
    pub fn heartbeat(now: DateTime<Utc>) -> Self {
        Self {
            online: Some(true),
            typing: None,
            last_seen: Some(now.to_rfc3339()),
        }
    }

    pub fn presence(online: bool, now: DateTime<Utc>) -> Self {
        Self {
            online: Some(online),
            typing: Some(false),
            last_seen: Some(now.to_rfc3339()),
        }
    }

    pub fn typing(typing: bool) -> Self {
        Self {
            typing: Some(typing),
            ..Default::default()
        }
    }
}

// -- Announcements --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnouncementRecord {
    pub id: String,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub author_name: String,
    pub text: String,
    pub created_at: String,
}

impl TryFrom<AnnouncementRecord> for Announcement {
    type Error = ValidationError;

    fn try_from(rec: AnnouncementRecord) -> Result<Self, Self::Error> {
        const ENTITY: &str = "announcement";
        Ok(Announcement {
            id: parse_uuid(ENTITY, "id", &rec.id)?,
            author_id: match rec.author_id.as_deref() {
                None | Some("") => None,
                Some(s) => Some(parse_uuid(ENTITY, "author_id", s)?),
            },
            author_name: rec.author_name,
            text: rec.text,
            created_at: parse_timestamp(ENTITY, "created_at", &rec.created_at)?,
        })
    }
}

impl From<&Announcement> for AnnouncementRecord {
    fn from(a: &Announcement) -> Self {
        Self {
            id: a.id.to_string(),
            author_id: a.author_id.map(|id| id.to_string()),
            author_name: a.author_name.clone(),
            text: a.text.clone(),
            created_at: a.created_at.to_rfc3339(),
        }
    }
}

// -- Decoding raw payloads --

pub fn decode_message(value: Value) -> Result<Message, ValidationError> {
    let rec: MessageRecord = serde_json::from_value(value)
        .map_err(|e| ValidationError::malformed("message", e.to_string()))?;
    Message::try_from(rec)
}

pub fn decode_user(value: Value) -> Result<PresenceRecord, ValidationError> {
    let rec: UserRecord = serde_json::from_value(value)
        .map_err(|e| ValidationError::malformed("user", e.to_string()))?;
    PresenceRecord::try_from(rec)
}

pub fn decode_announcement(value: Value) -> Result<Announcement, ValidationError> {
    let rec: AnnouncementRecord = serde_json::from_value(value)
        .map_err(|e| ValidationError::malformed("announcement", e.to_string()))?;
    Announcement::try_from(rec)
}

pub fn encode_message(msg: &Message) -> Value {
    serde_json::to_value(MessageRecord::from(msg)).unwrap_or(Value::Null)
}

fn parse_uuid(entity: &'static str, field: &str, raw: &str) -> Result<UserId, ValidationError> {
    raw.parse::<Uuid>()
        .map_err(|e| ValidationError::malformed(entity, format!("{field} '{raw}': {e}")))
}

fn parse_timestamp(
    entity: &'static str,
    field: &str,
    raw: &str,
) -> Result<DateTime<Utc>, ValidationError> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') has no zone and a space separator.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .map_err(|e| ValidationError::malformed(entity, format!("{field} '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_rules() {
        assert_eq!(validate_message_text("  hi  ", false).unwrap(), "hi");
        assert_eq!(validate_message_text("   ", false), Err(ValidationError::EmptyMessage));
        assert_eq!(validate_message_text("", true).unwrap(), "");

        let long = "a".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(matches!(
            validate_message_text(&long, false),
            Err(ValidationError::TooLong { len: 1001, .. })
        ));
        assert!(validate_message_text(&"a".repeat(MAX_MESSAGE_CHARS), false).is_ok());

        assert_eq!(
            validate_message_text("hello \u{1F600}", false),
            Err(ValidationError::DisallowedCodePoint(0x1F600))
        );
        assert!(validate_message_text("line one\nline two", false).is_ok());
        assert!(validate_message_text("bell\u{7}", false).is_err());
    }

    #[test]
    fn decode_valid_message() {
        let id = Uuid::from_u128(1);
        let sender = Uuid::from_u128(2);
        let msg = decode_message(json!({
            "id": id.to_string(),
            "room": "public",
            "sender_id": sender.to_string(),
            "sender_name": "alice",
            "text": "hi",
            "timestamp": "2024-05-01T10:00:00Z",
            "likes": [sender.to_string()],
            "dislikes": [sender.to_string()],
            "reply_to": null,
        }))
        .unwrap();

        assert_eq!(msg.id, id);
        assert_eq!(msg.room, Room::Public);
        assert!(msg.likes.contains(&sender));
        assert!(msg.dislikes.is_empty());
        assert!(!msg.deleted);
    }

    #[test]
    fn decode_rejects_malformed() {
        assert!(decode_message(json!({ "id": "nope" })).is_err());
        assert!(matches!(
            decode_message(json!({
                "id": Uuid::from_u128(1).to_string(),
                "room": "lobby",
                "sender_id": Uuid::from_u128(2).to_string(),
                "timestamp": "2024-05-01T10:00:00Z",
            })),
            Err(ValidationError::UnknownRoom(_))
        ));
        assert!(decode_user(json!({
            "id": Uuid::from_u128(3).to_string(),
            "username": "bob",
            "role": "superuser",
        }))
        .is_err());
    }

    #[test]
    fn sqlite_timestamps_parse() {
        let user = decode_user(json!({
            "id": Uuid::from_u128(3).to_string(),
            "username": "bob",
            "online": false,
            "typing": true,
            "last_seen": "2024-05-01 10:00:00",
        }))
        .unwrap();
        assert_eq!(user.last_seen.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        // typing means nothing while offline
        assert!(!user.typing);
    }
}
