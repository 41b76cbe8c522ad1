use rusqlite::Connection;

use crate::error::Result;

/// Open a sessions database with the standard pragmas applied.
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    apply_pragmas(&conn)?;
    init_db(&conn)?;
    Ok(conn)
}

/// In-memory database for tests.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_db(&conn)?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=5000;",
    )?;
    Ok(())
}

/// Initialise the message and note tables. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id           TEXT NOT NULL,
            role              TEXT NOT NULL,
            content           TEXT NOT NULL,
            author_id         TEXT,
            source_message_id TEXT,
            created_at_ms     INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_id, created_at_ms, id);

        CREATE TABLE IF NOT EXISTS notes (
            chat_id       TEXT NOT NULL,
            key           TEXT NOT NULL,
            content       TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            UNIQUE(chat_id, key)
        );",
    )?;
    Ok(())
}
