use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            email           TEXT NOT NULL UNIQUE,
            password        TEXT NOT NULL,
            first_name      TEXT NOT NULL,
            last_name       TEXT NOT NULL,
            profile_url     TEXT NOT NULL DEFAULT '',
            access_token    TEXT,
            refresh_token   TEXT,
            refresh_id      TEXT,
            revoked         INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- One chat record per user. `revision` orders change notifications.
        CREATE TABLE IF NOT EXISTS chat_records (
            owner_id    TEXT PRIMARY KEY,
            revision    INTEGER NOT NULL DEFAULT 0,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id        TEXT NOT NULL REFERENCES chat_records(owner_id),
            sub_id          TEXT NOT NULL,
            date            TEXT NOT NULL,
            name            TEXT NOT NULL,
            profile         TEXT NOT NULL,
            is_unread       INTEGER NOT NULL,
            last_message    TEXT NOT NULL,
            CONSTRAINT uq_conversation_peer UNIQUE (owner_id, sub_id)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_activity
            ON conversations(owner_id, date);

        -- `seq` is the append order within a conversation.
        CREATE TABLE IF NOT EXISTS messages (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id        TEXT NOT NULL,
            sub_id          TEXT NOT NULL,
            id              TEXT NOT NULL,
            sender_id       TEXT NOT NULL,
            destination     TEXT NOT NULL,
            body            TEXT NOT NULL,
            date            TEXT NOT NULL,
            name            TEXT NOT NULL,
            profile         TEXT NOT NULL,
            email           TEXT NOT NULL,
            FOREIGN KEY (owner_id, sub_id) REFERENCES conversations(owner_id, sub_id),
            CONSTRAINT uq_message_copy UNIQUE (owner_id, sub_id, id)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(owner_id, sub_id, seq);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
