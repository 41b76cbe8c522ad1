use rusqlite::Connection;

use crate::error::Result;

/// Open a feedback database with the standard pragmas applied.
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

/// Initialise feedback tables. Safe to call on every startup.
///
/// The event tables carry a UNIQUE identity key, so replaying the same
/// reaction or reply is a database-level no-op. Events recorded before the
/// outgoing row exists simply wait there until registration folds them in.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS outgoing (
            ref_key                   TEXT PRIMARY KEY,
            chat_id                   TEXT NOT NULL,
            sent_at_ms                INTEGER NOT NULL,
            text                      TEXT NOT NULL,
            reply_count               INTEGER NOT NULL DEFAULT 0,
            reaction_count            INTEGER NOT NULL DEFAULT 0,
            negative_reaction_count   INTEGER NOT NULL DEFAULT 0,
            reaction_net_score        INTEGER NOT NULL DEFAULT 0,
            ends_with_question        INTEGER NOT NULL DEFAULT 0,
            time_to_first_response_ms INTEGER,
            first_reply_text          TEXT,
            sample_reactions_json     TEXT NOT NULL DEFAULT '[]',
            finalized                 INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_outgoing_pending
            ON outgoing(finalized, sent_at_ms);

        CREATE TABLE IF NOT EXISTS reaction_events (
            ref_key      TEXT NOT NULL,
            author_id    TEXT NOT NULL,
            emoji        TEXT NOT NULL,
            is_negative  INTEGER NOT NULL DEFAULT 0,
            timestamp_ms INTEGER NOT NULL,
            UNIQUE(ref_key, author_id, emoji, timestamp_ms)
        );

        CREATE TABLE IF NOT EXISTS reply_events (
            ref_key      TEXT NOT NULL,
            author_id    TEXT NOT NULL,
            text         TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            UNIQUE(ref_key, author_id, text, timestamp_ms)
        );",
    )?;
    Ok(())
}
