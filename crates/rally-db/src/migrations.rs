use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            display_name    TEXT NOT NULL,
            avatar_url      TEXT,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            created_by  TEXT NOT NULL REFERENCES users(id),
            -- Canonicalized participant pair 'min(a,b):max(a,b)'. The UNIQUE
            -- constraint is what makes concurrent find-or-create safe: the
            -- loser of the race hits the constraint and re-reads the winner.
            pair_key    TEXT NOT NULL UNIQUE,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS participants (
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            user_id         TEXT NOT NULL REFERENCES users(id),
            joined_at       TEXT NOT NULL,
            last_read_at    TEXT,
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON participants(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender_id       TEXT NOT NULL REFERENCES users(id),
            content         TEXT NOT NULL,
            -- Per-conversation monotonic sequence, assigned under the
            -- connection lock. Breaks created_at ties deterministically.
            seq             INTEGER NOT NULL,
            created_at      TEXT NOT NULL,
            delivered_at    TEXT,
            read_at         TEXT,
            UNIQUE(conversation_id, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at, seq);

        CREATE TABLE IF NOT EXISTS typing_indicators (
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            user_id         TEXT NOT NULL REFERENCES users(id),
            updated_at      TEXT NOT NULL,
            PRIMARY KEY (conversation_id, user_id)
        );

        -- No FK to users: heartbeats can arrive before the profile mirror
        -- is synced, and presence for an unknown user is harmless.
        CREATE TABLE IF NOT EXISTS presence (
            user_id     TEXT PRIMARY KEY,
            status      TEXT NOT NULL CHECK (status IN ('online', 'offline')),
            last_seen   TEXT NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
