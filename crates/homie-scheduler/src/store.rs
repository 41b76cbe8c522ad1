use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

use homie_core::types::ChatId;

use crate::error::{Result, SchedulerError};
use crate::types::{ProactiveEvent, ProactiveEventKind, Recurrence};

/// Persisted event schedule. The dispatcher polls `due_events` and claims
/// each one with `mark_delivered` before acting on it.
pub struct EventScheduler {
    db: Mutex<Connection>,
}

impl EventScheduler {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    pub fn add_event(
        &self,
        kind: ProactiveEventKind,
        subject: &str,
        chat_id: &ChatId,
        trigger_at_ms: i64,
        recurrence: Recurrence,
    ) -> Result<ProactiveEvent> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let recurrence_json = serde_json::to_string(&recurrence)
            .map_err(|e| SchedulerError::InvalidRecurrence(e.to_string()))?;

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO events
             (id, kind, subject, chat_id, trigger_at_ms, recurrence, delivered, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            rusqlite::params![
                id,
                kind.to_string(),
                subject,
                chat_id.as_str(),
                trigger_at_ms,
                recurrence_json,
                now
            ],
        )?;
        info!(event_id = %id, kind = %kind, "event scheduled");
        Ok(ProactiveEvent {
            id,
            kind,
            subject: subject.to_string(),
            chat_id: chat_id.clone(),
            trigger_at_ms,
            recurrence,
            delivered: false,
            created_at_ms: now,
        })
    }

    pub fn remove_event(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM events WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::EventNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// All undelivered events whose trigger time has passed.
    pub fn due_events(&self, now_ms: i64) -> Result<Vec<ProactiveEvent>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, kind, subject, chat_id, trigger_at_ms, recurrence, delivered, created_at_ms
             FROM events
             WHERE delivered = 0 AND trigger_at_ms <= ?1
             ORDER BY trigger_at_ms",
        )?;
        let rows = stmt.query_map([now_ms], row_to_event)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Claim delivery of one fired event. Returns `true` only for the single
    /// caller that wins the claim: the UPDATE is guarded on the trigger the
    /// caller observed, so a raced or replayed claim changes zero rows.
    ///
    /// Once events flip `delivered`; recurring events advance their trigger
    /// and stay live.
    pub fn mark_delivered(&self, event: &ProactiveEvent, now_ms: i64) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let changed = match event.recurrence.next_after(event.trigger_at_ms, now_ms) {
            None => db.execute(
                "UPDATE events SET delivered = 1
                 WHERE id = ?1 AND delivered = 0 AND trigger_at_ms = ?2",
                rusqlite::params![event.id, event.trigger_at_ms],
            )?,
            Some(next) => db.execute(
                "UPDATE events SET trigger_at_ms = ?3
                 WHERE id = ?1 AND delivered = 0 AND trigger_at_ms = ?2",
                rusqlite::params![event.id, event.trigger_at_ms, next],
            )?,
        };
        Ok(changed == 1)
    }

    pub fn list_events(&self) -> Result<Vec<ProactiveEvent>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, kind, subject, chat_id, trigger_at_ms, recurrence, delivered, created_at_ms
             FROM events ORDER BY created_at_ms",
        )?;
        let rows = stmt.query_map([], row_to_event)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProactiveEvent> {
    let kind_str: String = row.get(1)?;
    let recurrence_json: String = row.get(5)?;
    Ok(ProactiveEvent {
        id: row.get(0)?,
        kind: kind_str.parse().unwrap_or(ProactiveEventKind::Reminder),
        subject: row.get(2)?,
        chat_id: ChatId::from(row.get::<_, String>(3)?),
        trigger_at_ms: row.get(4)?,
        recurrence: serde_json::from_str(&recurrence_json).unwrap_or(Recurrence::Once),
        delivered: row.get(6)?,
        created_at_ms: row.get(7)?,
    })
}
