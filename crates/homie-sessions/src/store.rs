use std::future::Future;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

use homie_core::budget::estimate_tokens;
use homie_core::types::{ChatId, MessageId, SessionMessage, SessionNote, SessionRole};

use crate::error::{Result, SessionError};

/// Thread-safe transcript store.
///
/// Wraps a single SQLite connection in a `Mutex`; per-chat write ordering is
/// the turn engine's job (it holds the chat lock for the whole turn), the
/// store only guarantees that individual operations are atomic.
pub struct SessionStore {
    db: Mutex<Connection>,
}

/// Inputs for one compaction pass. The summarizer callback is supplied by
/// the engine so the store never talks to an LLM itself.
pub struct CompactionParams<'a> {
    pub chat_id: &'a ChatId,
    pub max_tokens: usize,
    /// Number of most-recent messages that are never summarized away.
    pub recent_keep: usize,
    pub persona_reminder: &'a str,
    pub force: bool,
}

/// What a compaction pass did. `summarized` carries the replaced transcript
/// slice so the engine can feed its post-compaction hook.
pub struct CompactionOutcome {
    pub compacted: bool,
    pub summarized: Vec<SessionMessage>,
}

impl SessionStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Append one message to the chat transcript.
    pub fn append_message(&self, msg: &SessionMessage) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO messages
             (chat_id, role, content, author_id, source_message_id, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                msg.chat_id.as_str(),
                msg.role.to_string(),
                msg.content,
                msg.author_id,
                msg.source_message_id.as_ref().map(|m| m.as_str()),
                msg.created_at_ms,
            ],
        )?;
        Ok(())
    }

    /// The most recent `limit` messages, returned oldest-first.
    pub fn get_messages(&self, chat_id: &ChatId, limit: usize) -> Result<Vec<SessionMessage>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT chat_id, role, content, author_id, source_message_id, created_at_ms
             FROM messages
             WHERE chat_id = ?1
             ORDER BY created_at_ms DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![chat_id.as_str(), limit as i64],
            row_to_message,
        )?;
        let mut msgs: Vec<SessionMessage> = rows.filter_map(|r| r.ok()).collect();
        msgs.reverse();
        Ok(msgs)
    }

    /// Estimate the token footprint of a chat's full transcript.
    pub fn estimate_chat_tokens(&self, chat_id: &ChatId) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare("SELECT content FROM messages WHERE chat_id = ?1")?;
        let rows = stmt.query_map(rusqlite::params![chat_id.as_str()], |row| {
            row.get::<_, String>(0)
        })?;
        Ok(rows
            .filter_map(|r| r.ok())
            .map(|c| estimate_tokens(&c))
            .sum())
    }

    /// Run one compaction pass if the chat exceeds `max_tokens` (or `force`).
    ///
    /// Messages older than the most recent `recent_keep` are summarized via
    /// the callback and replaced by a single `system` message carrying the
    /// persona reminder plus the summary. Compaction of an already-compact
    /// session is a no-op.
    pub async fn compact_if_needed<F, Fut>(
        &self,
        params: CompactionParams<'_>,
        summarize: F,
    ) -> Result<CompactionOutcome>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = std::result::Result<String, String>>,
    {
        let estimated = self.estimate_chat_tokens(params.chat_id)?;
        if estimated <= params.max_tokens && !params.force {
            return Ok(CompactionOutcome {
                compacted: false,
                summarized: Vec::new(),
            });
        }

        // Everything older than the most recent `recent_keep` messages.
        let (old, cutoff): (Vec<(i64, SessionMessage)>, Option<(i64, i64)>) = {
            let db = self.db.lock().unwrap();
            let mut stmt = db.prepare(
                "SELECT id, chat_id, role, content, author_id, source_message_id, created_at_ms
                 FROM messages
                 WHERE chat_id = ?1
                 ORDER BY created_at_ms ASC, id ASC",
            )?;
            let all: Vec<(i64, SessionMessage)> = stmt
                .query_map(rusqlite::params![params.chat_id.as_str()], |row| {
                    Ok((row.get::<_, i64>(0)?, row_to_message_at(row, 1)?))
                })?
                .filter_map(|r| r.ok())
                .collect();

            if all.len() <= params.recent_keep {
                (Vec::new(), None)
            } else {
                let split = all.len() - params.recent_keep;
                let old: Vec<_> = all[..split].to_vec();
                let anchor = old
                    .first()
                    .map(|(id, m)| (*id, m.created_at_ms));
                (old, anchor)
            }
        };

        let Some((_, anchor_ts)) = cutoff else {
            debug!(chat = %params.chat_id, "compaction requested but nothing to fold");
            return Ok(CompactionOutcome {
                compacted: false,
                summarized: Vec::new(),
            });
        };

        let transcript: String = old
            .iter()
            .map(|(_, m)| format!("{}: {}", m.role.to_string().to_uppercase(), m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let summary = summarize(transcript)
            .await
            .map_err(SessionError::Summarize)?;

        let summary_content = format!(
            "{}\n\n[SUMMARY OF EARLIER CONVERSATION]\n{}",
            params.persona_reminder, summary
        );

        // Replace the summarized range atomically. The summary inherits the
        // oldest replaced timestamp so it sorts before every kept message.
        {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction()?;
            for (id, _) in &old {
                tx.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            }
            tx.execute(
                "INSERT INTO messages
                 (chat_id, role, content, author_id, source_message_id, created_at_ms)
                 VALUES (?1, 'system', ?2, NULL, NULL, ?3)",
                rusqlite::params![params.chat_id.as_str(), summary_content, anchor_ts],
            )?;
            tx.commit()?;
        }

        info!(
            chat = %params.chat_id,
            folded = old.len(),
            "session compacted"
        );

        Ok(CompactionOutcome {
            compacted: true,
            summarized: old.into_iter().map(|(_, m)| m).collect(),
        })
    }

    // -- scratchpad notes ---------------------------------------------------

    /// Insert or update a note under `(chat_id, key)`.
    pub fn upsert_note(&self, chat_id: &ChatId, key: &str, content: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO notes (chat_id, key, content, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(chat_id, key)
             DO UPDATE SET content = excluded.content, updated_at_ms = excluded.updated_at_ms",
            rusqlite::params![chat_id.as_str(), key, content, now],
        )?;
        Ok(())
    }

    /// Most-recently-updated notes first.
    pub fn list_notes(&self, chat_id: &ChatId, limit: usize) -> Result<Vec<SessionNote>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT chat_id, key, content, created_at_ms, updated_at_ms
             FROM notes
             WHERE chat_id = ?1
             ORDER BY updated_at_ms DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![chat_id.as_str(), limit as i64], |row| {
            Ok(SessionNote {
                chat_id: ChatId::from(row.get::<_, String>(0)?),
                key: row.get(1)?,
                content: row.get(2)?,
                created_at_ms: row.get(3)?,
                updated_at_ms: row.get(4)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionMessage> {
    row_to_message_at(row, 0)
}

fn row_to_message_at(row: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<SessionMessage> {
    let role_str: String = row.get(base + 1)?;
    Ok(SessionMessage {
        chat_id: ChatId::from(row.get::<_, String>(base)?),
        role: role_str.parse().unwrap_or(SessionRole::User),
        content: row.get(base + 2)?,
        author_id: row.get(base + 3)?,
        source_message_id: row
            .get::<_, Option<String>>(base + 4)?
            .map(MessageId::from),
        created_at_ms: row.get(base + 5)?,
    })
}
