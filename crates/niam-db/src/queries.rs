use crate::models::{AnnouncementRow, MessageRow, UserRow};
use crate::Database;
use anyhow::{Result, anyhow};
use niam_types::records::{AnnouncementRecord, MessagePatch, MessageRecord, UserPatch, UserRecord};
use niam_types::remote::{Filter, Order};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};

const MESSAGE_COLUMNS: &str =
    "id, room, sender_id, sender_name, text, timestamp, likes, dislikes, reply_to, image_url, deleted";
const USER_COLUMNS: &str = "id, username, display_name, role, online, typing, last_seen";

impl Database {
    // -- Messages --

    pub fn insert_message(&self, rec: &MessageRecord) -> Result<MessageRow> {
        let timestamp = normalize_timestamp(&rec.timestamp)?;
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages (id, room, sender_id, sender_name, text, timestamp, likes, dislikes, reply_to, image_url, deleted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    rec.id,
                    rec.room,
                    rec.sender_id,
                    rec.sender_name,
                    rec.text,
                    timestamp,
                    serde_json::to_string(&rec.likes)?,
                    serde_json::to_string(&rec.dislikes)?,
                    rec.reply_to,
                    rec.image_url,
                    rec.deleted,
                ],
            )?;
            query_message(conn, &rec.id)?.ok_or_else(|| anyhow!("Message vanished after insert: {}", rec.id))
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Apply a patch. Returns the updated row, or `None` if no such message.
    pub fn update_message(&self, id: &str, patch: &MessagePatch) -> Result<Option<MessageRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if let Some(likes) = &patch.likes {
                tx.execute(
                    "UPDATE messages SET likes = ?1 WHERE id = ?2",
                    (serde_json::to_string(likes)?, id),
                )?;
            }
            if let Some(dislikes) = &patch.dislikes {
                tx.execute(
                    "UPDATE messages SET dislikes = ?1 WHERE id = ?2",
                    (serde_json::to_string(dislikes)?, id),
                )?;
            }
            if let Some(deleted) = patch.deleted {
                tx.execute("UPDATE messages SET deleted = ?1 WHERE id = ?2", (deleted, id))?;
            }
            let row = query_message(&tx, id)?;
            tx.commit()?;
            Ok(row)
        })
    }

    pub fn query_messages(&self, filter: &Filter, order: Order, limit: Option<u32>) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut clauses = Vec::new();
            let mut params = Vec::new();
            if let Some(room) = filter.room {
                params.push(SqlValue::Text(room.as_str().to_string()));
                clauses.push(format!("room = ?{}", params.len()));
            }
            if let Some(deleted) = filter.deleted {
                params.push(SqlValue::Integer(deleted as i64));
                clauses.push(format!("deleted = ?{}", params.len()));
            }

            let order_by = match order {
                Order::Ascending => "timestamp ASC, id ASC",
                Order::Descending | Order::ByUsername => "timestamp DESC, id DESC",
            };
            let sql = format!(
                "SELECT {} FROM messages{} ORDER BY {}{}",
                MESSAGE_COLUMNS,
                where_clause(&clauses),
                order_by,
                limit_clause(limit),
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Users --

    /// Insert a user, or refresh every column of an existing one with the same id.
    pub fn upsert_user(&self, rec: &UserRecord) -> Result<UserRow> {
        let last_seen = match &rec.last_seen {
            Some(ts) => normalize_timestamp(ts)?,
            None => now_timestamp(),
        };
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, display_name, role, online, typing, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    display_name = excluded.display_name,
                    role = excluded.role,
                    online = excluded.online,
                    typing = excluded.typing,
                    last_seen = excluded.last_seen",
                rusqlite::params![
                    rec.id,
                    rec.username,
                    rec.display_name,
                    rec.role,
                    rec.online,
                    rec.typing,
                    last_seen,
                ],
            )?;
            query_user(conn, "id", &rec.id)?.ok_or_else(|| anyhow!("User vanished after upsert: {}", rec.id))
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn update_user(&self, id: &str, patch: &UserPatch) -> Result<Option<UserRow>> {
        let last_seen = patch.last_seen.as_deref().map(normalize_timestamp).transpose()?;
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if let Some(online) = patch.online {
                tx.execute("UPDATE users SET online = ?1 WHERE id = ?2", (online, id))?;
                if !online {
                    tx.execute("UPDATE users SET typing = 0 WHERE id = ?1", [id])?;
                }
            }
            if let Some(typing) = patch.typing {
                tx.execute("UPDATE users SET typing = ?1 WHERE id = ?2", (typing, id))?;
            }
            if let Some(last_seen) = &last_seen {
                tx.execute("UPDATE users SET last_seen = ?1 WHERE id = ?2", (last_seen, id))?;
            }
            let row = query_user(&tx, "id", id)?;
            tx.commit()?;
            Ok(row)
        })
    }

    pub fn query_users(&self, filter: &Filter, limit: Option<u32>) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut clauses = Vec::new();
            let mut params = Vec::new();
            if let Some(online) = filter.online {
                params.push(SqlValue::Integer(online as i64));
                clauses.push(format!("online = ?{}", params.len()));
            }
            let sql = format!(
                "SELECT {} FROM users{} ORDER BY username ASC{}",
                USER_COLUMNS,
                where_clause(&clauses),
                limit_clause(limit),
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Announcements --

    pub fn insert_announcement(&self, rec: &AnnouncementRecord) -> Result<AnnouncementRow> {
        let created_at = normalize_timestamp(&rec.created_at)?;
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO announcements (id, author_id, author_name, text, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![rec.id, rec.author_id, rec.author_name, rec.text, created_at],
            )?;
            Ok(AnnouncementRow {
                id: rec.id.clone(),
                author_id: rec.author_id.clone(),
                author_name: rec.author_name.clone(),
                text: rec.text.clone(),
                created_at,
            })
        })
    }

    pub fn query_announcements(&self, order: Order, limit: Option<u32>) -> Result<Vec<AnnouncementRow>> {
        self.with_conn(|conn| {
            let order_by = match order {
                Order::Ascending => "ASC",
                _ => "DESC",
            };
            let sql = format!(
                "SELECT id, author_id, author_name, text, created_at FROM announcements ORDER BY created_at {}{}",
                order_by,
                limit_clause(limit),
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(AnnouncementRow {
                        id: row.get(0)?,
                        author_id: row.get(1)?,
                        author_name: row.get(2)?,
                        text: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn where_clause(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

fn limit_clause(limit: Option<u32>) -> String {
    limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default()
}

/// Stored timestamps share one RFC 3339 layout so that text ordering is time ordering.
fn normalize_timestamp(raw: &str) -> Result<String> {
    let ts = raw
        .parse::<chrono::DateTime<chrono::Utc>>()
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc()))
        .map_err(|e| anyhow!("Bad timestamp '{}': {}", raw, e))?;
    Ok(ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
}

fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        text: row.get(4)?,
        timestamp: row.get(5)?,
        likes: row.get(6)?,
        dislikes: row.get(7)?,
        reply_to: row.get(8)?,
        image_url: row.get(9)?,
        deleted: row.get(10)?,
    })
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        role: row.get(3)?,
        online: row.get(4)?,
        typing: row.get(5)?,
        last_seen: row.get(6)?,
    })
}

fn query_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
    let row = conn.query_row(&sql, [id], message_from_row).optional()?;
    Ok(row)
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE {} = ?1", USER_COLUMNS, column);
    let row = conn.query_row(&sql, [value], user_from_row).optional()?;
    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
