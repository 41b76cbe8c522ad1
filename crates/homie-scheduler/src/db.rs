use rusqlite::Connection;

use crate::error::Result;

/// Open an events database with the standard pragmas applied.
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

/// Initialise the events table. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            id            TEXT PRIMARY KEY,
            kind          TEXT NOT NULL,
            subject       TEXT NOT NULL,
            chat_id       TEXT NOT NULL,
            trigger_at_ms INTEGER NOT NULL,
            recurrence    TEXT NOT NULL,
            delivered     INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_due
            ON events(delivered, trigger_at_ms);",
    )?;
    Ok(())
}
