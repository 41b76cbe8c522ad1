use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{FeedbackError, Result};
use crate::score::{detect_refinement, score_feedback, FeedbackSignals};

/// One tracked outgoing message.
#[derive(Debug, Clone)]
pub struct OutgoingRow {
    pub ref_key: String,
    pub chat_id: String,
    pub sent_at_ms: i64,
    pub text: String,
    pub reply_count: u32,
    pub reaction_count: u32,
    pub negative_reaction_count: u32,
    pub reaction_net_score: i32,
    pub ends_with_question: bool,
    pub time_to_first_response_ms: Option<i64>,
    pub first_reply_text: Option<String>,
    pub sample_reactions: Vec<String>,
    pub finalized: bool,
}

/// A finalized row together with its computed score.
#[derive(Debug, Clone)]
pub struct ScoredOutcome {
    pub row: OutgoingRow,
    pub score: f64,
}

/// Thread-safe feedback store.
pub struct FeedbackStore {
    db: Mutex<Connection>,
}

impl FeedbackStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Register an assistant send. Folds in any reactions/replies that
    /// arrived before registration; registering the same key twice is
    /// harmless (counts are recomputed from the event tables).
    pub fn register_outgoing(
        &self,
        ref_key: &str,
        chat_id: &str,
        text: &str,
        sent_at_ms: i64,
    ) -> Result<()> {
        let ends_with_question = text.trim_end().ends_with('?');
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO outgoing (ref_key, chat_id, sent_at_ms, text, ends_with_question)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![ref_key, chat_id, sent_at_ms, text, ends_with_question],
        )?;
        fold_events(&db, ref_key)?;
        debug!(ref_key, chat_id, "outgoing registered");
        Ok(())
    }

    /// Record a reaction. Idempotent on `(ref_key, author, emoji, ts)`; if
    /// the outgoing row is not registered yet the event simply waits.
    pub fn record_reaction(
        &self,
        ref_key: &str,
        author_id: &str,
        emoji: &str,
        is_negative: bool,
        timestamp_ms: i64,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let inserted = db.execute(
            "INSERT OR IGNORE INTO reaction_events
             (ref_key, author_id, emoji, is_negative, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![ref_key, author_id, emoji, is_negative, timestamp_ms],
        )?;
        if inserted > 0 {
            fold_events(&db, ref_key)?;
        }
        Ok(())
    }

    /// Record a reply referencing an outgoing message. Same idempotency and
    /// pending semantics as reactions.
    pub fn record_reply(
        &self,
        ref_key: &str,
        author_id: &str,
        text: &str,
        timestamp_ms: i64,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let inserted = db.execute(
            "INSERT OR IGNORE INTO reply_events (ref_key, author_id, text, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![ref_key, author_id, text, timestamp_ms],
        )?;
        if inserted > 0 {
            fold_events(&db, ref_key)?;
        }
        Ok(())
    }

    pub fn get(&self, ref_key: &str) -> Result<Option<OutgoingRow>> {
        let db = self.db.lock().unwrap();
        query_row(&db, ref_key)
    }

    /// Number of sends into `chat_id` since `since_ms` (proactive throttle).
    pub fn sends_since(&self, chat_id: &str, since_ms: i64) -> Result<u32> {
        let db = self.db.lock().unwrap();
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM outgoing WHERE chat_id = ?1 AND sent_at_ms >= ?2",
            rusqlite::params![chat_id, since_ms],
            |row| row.get(0),
        )?;
        Ok(n as u32)
    }

    /// Score and finalize every row that has been quiet for
    /// `finalize_after_ms`. Returns the scored outcomes so the caller can
    /// turn threshold-crossers into lessons.
    pub fn finalize_due(&self, now_ms: i64, finalize_after_ms: i64) -> Result<Vec<ScoredOutcome>> {
        let due: Vec<OutgoingRow> = {
            let db = self.db.lock().unwrap();
            let mut stmt = db.prepare(
                "SELECT ref_key FROM outgoing
                 WHERE finalized = 0 AND ?1 - sent_at_ms >= ?2",
            )?;
            let keys: Vec<String> = stmt
                .query_map(rusqlite::params![now_ms, finalize_after_ms], |row| {
                    row.get::<_, String>(0)
                })?
                .filter_map(|r| r.ok())
                .collect();
            keys.into_iter()
                .filter_map(|k| query_row(&db, &k).ok().flatten())
                .collect()
        };

        let mut outcomes = Vec::new();
        for row in due {
            let signals = FeedbackSignals {
                is_group: row.chat_id.contains(":group:"),
                time_to_first_response_ms: row.time_to_first_response_ms,
                response_count: row.reply_count,
                reaction_count: row.reaction_count,
                negative_reaction_count: row.negative_reaction_count,
                reaction_net_score: row.reaction_net_score,
                outgoing_ends_with_question: row.ends_with_question,
                refinement: row
                    .first_reply_text
                    .as_deref()
                    .filter(|t| detect_refinement(t))
                    .map(str::to_string),
            };
            let score = score_feedback(&signals);

            let db = self.db.lock().unwrap();
            db.execute(
                "UPDATE outgoing SET finalized = 1 WHERE ref_key = ?1",
                [&row.ref_key],
            )?;
            info!(ref_key = %row.ref_key, score, "feedback finalized");
            outcomes.push(ScoredOutcome { row, score });
        }
        Ok(outcomes)
    }
}

/// Recompute an outgoing row's aggregates from the event tables.
///
/// Last-writer-wins on the counters but idempotent on identity keys: the
/// same event set always folds to the same numbers, regardless of arrival
/// order or replay.
fn fold_events(db: &Connection, ref_key: &str) -> Result<()> {
    let exists: bool = db
        .query_row(
            "SELECT 1 FROM outgoing WHERE ref_key = ?1",
            [ref_key],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if !exists {
        return Ok(());
    }

    let (reactions, negatives, net): (i64, i64, i64) = db.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(is_negative), 0),
                COALESCE(SUM(CASE WHEN is_negative THEN -1 ELSE 1 END), 0)
         FROM reaction_events WHERE ref_key = ?1",
        [ref_key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    let samples: Vec<String> = {
        let mut stmt = db.prepare(
            "SELECT emoji FROM reaction_events WHERE ref_key = ?1
             ORDER BY timestamp_ms LIMIT 10",
        )?;
        let result: Vec<String> = stmt
            .query_map([ref_key], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        result
    };

    let replies: i64 = db.query_row(
        "SELECT COUNT(*) FROM reply_events WHERE ref_key = ?1",
        [ref_key],
        |row| row.get(0),
    )?;

    let first_reply: Option<(String, i64)> = db
        .query_row(
            "SELECT text, timestamp_ms FROM reply_events
             WHERE ref_key = ?1 ORDER BY timestamp_ms LIMIT 1",
            [ref_key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(FeedbackError::Database(e)),
        })?;

    let sent_at: i64 = db.query_row(
        "SELECT sent_at_ms FROM outgoing WHERE ref_key = ?1",
        [ref_key],
        |row| row.get(0),
    )?;
    let ttfr = first_reply
        .as_ref()
        .map(|(_, ts)| (ts - sent_at).max(0));

    db.execute(
        "UPDATE outgoing SET
            reaction_count = ?2,
            negative_reaction_count = ?3,
            reaction_net_score = ?4,
            reply_count = ?5,
            time_to_first_response_ms = ?6,
            first_reply_text = ?7,
            sample_reactions_json = ?8
         WHERE ref_key = ?1",
        rusqlite::params![
            ref_key,
            reactions,
            negatives,
            net,
            replies,
            ttfr,
            first_reply.map(|(t, _)| t),
            serde_json::to_string(&samples).unwrap_or_else(|_| "[]".into()),
        ],
    )?;
    Ok(())
}

fn query_row(db: &Connection, ref_key: &str) -> Result<Option<OutgoingRow>> {
    match db.query_row(
        "SELECT ref_key, chat_id, sent_at_ms, text, reply_count, reaction_count,
                negative_reaction_count, reaction_net_score, ends_with_question,
                time_to_first_response_ms, first_reply_text, sample_reactions_json, finalized
         FROM outgoing WHERE ref_key = ?1",
        [ref_key],
        |row| {
            let samples_json: String = row.get(11)?;
            Ok(OutgoingRow {
                ref_key: row.get(0)?,
                chat_id: row.get(1)?,
                sent_at_ms: row.get(2)?,
                text: row.get(3)?,
                reply_count: row.get::<_, i64>(4)? as u32,
                reaction_count: row.get::<_, i64>(5)? as u32,
                negative_reaction_count: row.get::<_, i64>(6)? as u32,
                reaction_net_score: row.get::<_, i64>(7)? as i32,
                ends_with_question: row.get(8)?,
                time_to_first_response_ms: row.get(9)?,
                first_reply_text: row.get(10)?,
                sample_reactions: serde_json::from_str(&samples_json).unwrap_or_default(),
                finalized: row.get(12)?,
            })
        },
    ) {
        Ok(r) => Ok(Some(r)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(FeedbackError::Database(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn store() -> FeedbackStore {
        FeedbackStore::new(open_in_memory().unwrap())
    }

    #[test]
    fn reaction_after_registration_counts() {
        let s = store();
        s.register_outgoing("k1", "cli:local", "yo", 1000).unwrap();
        s.record_reaction("k1", "alice", "🔥", false, 2000).unwrap();

        let row = s.get("k1").unwrap().unwrap();
        assert_eq!(row.reaction_count, 1);
        assert_eq!(row.reaction_net_score, 1);
    }

    #[test]
    fn reaction_before_registration_is_reconciled() {
        let s = store();
        s.record_reaction("k1", "alice", "🔥", false, 2000).unwrap();
        s.record_reaction("k1", "bob", "👎", true, 2100).unwrap();
        s.record_reply("k1", "alice", "lol true", 2500).unwrap();

        s.register_outgoing("k1", "cli:local", "yo", 1000).unwrap();

        let row = s.get("k1").unwrap().unwrap();
        assert_eq!(row.reaction_count, 2);
        assert_eq!(row.negative_reaction_count, 1);
        assert_eq!(row.reaction_net_score, 0);
        assert_eq!(row.reply_count, 1);
        assert_eq!(row.time_to_first_response_ms, Some(1500));
    }

    #[test]
    fn duplicate_events_are_noops() {
        let s = store();
        s.register_outgoing("k1", "cli:local", "yo", 1000).unwrap();
        for _ in 0..3 {
            s.record_reaction("k1", "alice", "🔥", false, 2000).unwrap();
            s.record_reply("k1", "bob", "same", 3000).unwrap();
        }
        let row = s.get("k1").unwrap().unwrap();
        assert_eq!(row.reaction_count, 1);
        assert_eq!(row.reply_count, 1);
    }

    #[test]
    fn counts_equal_union_regardless_of_order() {
        // Same event multiset in two arrival orders → identical final rows.
        let build = |order: &[usize]| {
            let s = store();
            let events: Vec<Box<dyn Fn(&FeedbackStore)>> = vec![
                Box::new(|s: &FeedbackStore| {
                    s.register_outgoing("k", "c", "hello?", 1000).unwrap()
                }),
                Box::new(|s: &FeedbackStore| {
                    s.record_reaction("k", "a", "🔥", false, 1100).unwrap()
                }),
                Box::new(|s: &FeedbackStore| {
                    s.record_reaction("k", "b", "👎", true, 1200).unwrap()
                }),
                Box::new(|s: &FeedbackStore| {
                    s.record_reply("k", "a", "yes", 1300).unwrap()
                }),
            ];
            for &i in order {
                events[i](&s);
            }
            s.get("k").unwrap().unwrap()
        };

        let forward = build(&[0, 1, 2, 3]);
        let reversed = build(&[3, 2, 1, 0]);
        assert_eq!(forward.reaction_count, reversed.reaction_count);
        assert_eq!(forward.reply_count, reversed.reply_count);
        assert_eq!(forward.reaction_net_score, reversed.reaction_net_score);
        assert_eq!(
            forward.time_to_first_response_ms,
            reversed.time_to_first_response_ms
        );
    }

    #[test]
    fn finalize_scores_quiet_rows() {
        let s = store();
        s.register_outgoing("old", "cli:local", "you around?", 1000).unwrap();
        s.register_outgoing("new", "cli:local", "later msg", 90_000).unwrap();

        let outcomes = s.finalize_due(100_000, 50_000).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].row.ref_key, "old");
        // Unanswered question scores negative.
        assert!(outcomes[0].score < 0.0);

        // Second pass: nothing left.
        assert!(s.finalize_due(100_000, 50_000).unwrap().is_empty());
    }

    #[test]
    fn sends_since_counts_by_chat() {
        let s = store();
        s.register_outgoing("a", "signal:dm:+1", "x", 1000).unwrap();
        s.register_outgoing("b", "signal:dm:+1", "y", 5000).unwrap();
        s.register_outgoing("c", "signal:dm:+2", "z", 5000).unwrap();
        assert_eq!(s.sends_since("signal:dm:+1", 2000).unwrap(), 1);
        assert_eq!(s.sends_since("signal:dm:+1", 0).unwrap(), 2);
    }
}
