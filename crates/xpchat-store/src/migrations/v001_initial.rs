//! v001 -- Initial schema creation.
//!
//! Creates `users`, `chats`, `chat_participants`, `messages` and `calls`, and
//! seeds the public `general` chat.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id         TEXT PRIMARY KEY NOT NULL,
    username   TEXT NOT NULL,
    avatar     TEXT,
    status     TEXT NOT NULL DEFAULT 'offline',  -- online | offline
    last_seen  TEXT,                             -- RFC-3339
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);

-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id         TEXT PRIMARY KEY NOT NULL,
    name       TEXT,
    chat_type  TEXT NOT NULL DEFAULT 'personal', -- personal | group
    created_by TEXT,                             -- nullable FK -> users(id)
    created_at TEXT NOT NULL,

    FOREIGN KEY (created_by) REFERENCES users(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS chat_participants (
    chat_id   TEXT NOT NULL,
    user_id   TEXT NOT NULL,
    role      TEXT NOT NULL DEFAULT 'member',    -- member | admin
    joined_at TEXT NOT NULL,

    PRIMARY KEY (chat_id, user_id),
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chat_participants_user ON chat_participants(user_id);

INSERT OR IGNORE INTO chats (id, name, chat_type, created_by, created_at)
VALUES ('general', 'General', 'group', NULL, '1970-01-01T00:00:00+00:00');

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           TEXT PRIMARY KEY NOT NULL,
    chat_id      TEXT NOT NULL,                  -- FK -> chats(id)
    sender_id    TEXT NOT NULL,                  -- FK -> users(id)
    content      TEXT NOT NULL,
    message_type TEXT NOT NULL DEFAULT 'text',
    file_path    TEXT,
    file_name    TEXT,
    file_size    INTEGER,
    reply_to     TEXT,
    created_at   TEXT NOT NULL,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE,
    FOREIGN KEY (sender_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_ts
    ON messages(chat_id, created_at DESC);

-- ----------------------------------------------------------------
-- Calls
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS calls (
    id          TEXT PRIMARY KEY NOT NULL,       -- UUID v4
    caller_id   TEXT NOT NULL,                   -- FK -> users(id)
    receiver_id TEXT NOT NULL,                   -- may name a user never seen
    call_type   TEXT NOT NULL DEFAULT 'audio',
    status      TEXT NOT NULL DEFAULT 'initiated',
    start_time  TEXT NOT NULL,
    end_time    TEXT,
    duration    INTEGER,                         -- seconds

    FOREIGN KEY (caller_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_calls_caller ON calls(caller_id, start_time DESC);
CREATE INDEX IF NOT EXISTS idx_calls_receiver ON calls(receiver_id, start_time DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
