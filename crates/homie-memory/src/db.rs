use rusqlite::Connection;

use crate::error::Result;

/// Open a memory database with the standard pragmas applied.
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=5000;",
    )?;
    init_db(&conn)?;
    Ok(conn)
}

/// In-memory database for tests.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_db(&conn)?;
    Ok(conn)
}

/// Initialise memory tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS people (
            id                   TEXT PRIMARY KEY,
            display_name         TEXT NOT NULL,
            channel              TEXT NOT NULL,
            channel_user_id      TEXT NOT NULL,
            relationship_score   REAL NOT NULL DEFAULT 0,
            trust_tier_override  TEXT,
            capsule              TEXT,
            public_style_capsule TEXT,
            concerns_json        TEXT NOT NULL DEFAULT '[]',
            goals_json           TEXT NOT NULL DEFAULT '[]',
            preferences_json     TEXT NOT NULL DEFAULT '[]',
            mood                 TEXT,
            curiosity_json       TEXT NOT NULL DEFAULT '[]',
            created_at_ms        INTEGER NOT NULL,
            updated_at_ms        INTEGER NOT NULL,
            UNIQUE(channel, channel_user_id)
        );

        CREATE TABLE IF NOT EXISTS facts (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            person_id           TEXT,
            subject             TEXT NOT NULL,
            content             TEXT NOT NULL,
            category            TEXT NOT NULL,
            evidence_quote      TEXT NOT NULL,
            embedding           BLOB,
            last_accessed_at_ms INTEGER NOT NULL,
            created_at_ms       INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_facts_person ON facts(person_id);

        CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts
            USING fts5(subject, content, content='facts', content_rowid='id');

        CREATE TABLE IF NOT EXISTS episodes (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id       TEXT NOT NULL,
            person_id     TEXT,
            is_group      INTEGER NOT NULL DEFAULT 0,
            content       TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_episodes_chat
            ON episodes(chat_id, created_at_ms DESC);

        CREATE TABLE IF NOT EXISTS lessons (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            lesson_type     TEXT NOT NULL,
            category        TEXT NOT NULL,
            content         TEXT NOT NULL,
            rule            TEXT,
            person_id       TEXT,
            chat_id         TEXT,
            episode_refs    TEXT NOT NULL DEFAULT '[]',
            confidence      REAL NOT NULL DEFAULT 0.5,
            times_validated INTEGER NOT NULL DEFAULT 0,
            times_violated  INTEGER NOT NULL DEFAULT 0,
            created_at_ms   INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_lessons_chat ON lessons(chat_id);",
    )?;
    Ok(())
}
