use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id            TEXT PRIMARY KEY,
            username      TEXT NOT NULL UNIQUE,
            display_name  TEXT,
            role          TEXT NOT NULL DEFAULT 'user',
            online        INTEGER NOT NULL DEFAULT 0,
            typing        INTEGER NOT NULL DEFAULT 0,
            last_seen     TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS messages (
            id            TEXT PRIMARY KEY,
            room          TEXT NOT NULL,
            sender_id     TEXT NOT NULL,
            sender_name   TEXT NOT NULL,
            text          TEXT NOT NULL DEFAULT '',
            timestamp     TEXT NOT NULL,
            likes         TEXT NOT NULL DEFAULT '[]',
            dislikes      TEXT NOT NULL DEFAULT '[]',
            reply_to      TEXT,
            image_url     TEXT,
            deleted       INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room, deleted, timestamp);

        CREATE TABLE IF NOT EXISTS announcements (
            id            TEXT PRIMARY KEY,
            author_id     TEXT,
            author_name   TEXT NOT NULL DEFAULT '',
            text          TEXT NOT NULL,
            created_at    TEXT NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
