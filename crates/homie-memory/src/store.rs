use std::collections::HashMap;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

use homie_core::config::RetrievalConfig;
use homie_core::types::{ChatId, PersonId, TrustTier};

use crate::error::{MemoryError, Result};
use crate::retrieval::{cosine, decode_embedding, encode_embedding, fuse_ranks};
use crate::types::*;

/// Thread-safe store for people, facts, episodes, and lessons.
pub struct MemoryStore {
    db: Mutex<Connection>,
}

impl MemoryStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    // -- people -------------------------------------------------------------

    /// Find or create the person behind `(channel, channel_user_id)`.
    pub fn track_person(
        &self,
        channel: &str,
        channel_user_id: &str,
        display_name: &str,
    ) -> Result<PersonRecord> {
        {
            let db = self.db.lock().unwrap();
            if let Some(person) = query_person_by_channel(&db, channel, channel_user_id)? {
                return Ok(person);
            }
        }

        info!(channel, channel_user_id, "first contact; creating person");
        let id = PersonId::generate();
        let now = chrono::Utc::now().timestamp_millis();
        let db = self.db.lock().unwrap();
        // INSERT OR IGNORE + read-back covers the race where two turns meet
        // the same stranger at once.
        db.execute(
            "INSERT OR IGNORE INTO people
             (id, display_name, channel, channel_user_id, relationship_score,
              created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
            rusqlite::params![id.as_str(), display_name, channel, channel_user_id, now],
        )?;
        query_person_by_channel(&db, channel, channel_user_id)?
            .ok_or_else(|| MemoryError::PersonNotFound(format!("{channel}:{channel_user_id}")))
    }

    pub fn get_person(&self, id: &PersonId) -> Result<Option<PersonRecord>> {
        let db = self.db.lock().unwrap();
        query_person_by_id(&db, id.as_str())
    }

    /// Lookup without creating (proactive gating wants "never met" distinct
    /// from "new person row").
    pub fn find_person(&self, channel: &str, channel_user_id: &str) -> Result<Option<PersonRecord>> {
        let db = self.db.lock().unwrap();
        query_person_by_channel(&db, channel, channel_user_id)
    }

    /// Raise the relationship score. The score never decreases: a lower
    /// value than the stored one is a no-op.
    pub fn raise_relationship_score(&self, id: &PersonId, score: f64) -> Result<f64> {
        let score = score.clamp(0.0, 1.0);
        let now = chrono::Utc::now().timestamp_millis();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE people
             SET relationship_score = MAX(relationship_score, ?2), updated_at_ms = ?3
             WHERE id = ?1",
            rusqlite::params![id.as_str(), score, now],
        )?;
        let current: f64 = db.query_row(
            "SELECT relationship_score FROM people WHERE id = ?1",
            [id.as_str()],
            |row| row.get(0),
        )?;
        Ok(current)
    }

    pub fn set_trust_tier_override(
        &self,
        id: &PersonId,
        tier: Option<TrustTier>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE people SET trust_tier_override = ?2 WHERE id = ?1",
            rusqlite::params![id.as_str(), tier.map(|t| t.to_string())],
        )?;
        Ok(())
    }

    pub fn set_capsule(&self, id: &PersonId, capsule: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE people SET capsule = ?2 WHERE id = ?1",
            rusqlite::params![id.as_str(), capsule],
        )?;
        Ok(())
    }

    pub fn set_public_style_capsule(&self, id: &PersonId, capsule: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE people SET public_style_capsule = ?2 WHERE id = ?1",
            rusqlite::params![id.as_str(), capsule],
        )?;
        Ok(())
    }

    // -- facts --------------------------------------------------------------

    /// Insert a fact, enforcing the verbatim-evidence rule: the quote must
    /// survive a whitespace-collapsed substring check against `source_text`.
    pub fn insert_fact(
        &self,
        person_id: Option<&PersonId>,
        subject: &str,
        content: &str,
        category: &str,
        evidence_quote: &str,
        source_text: &str,
    ) -> Result<i64> {
        if !is_verbatim(evidence_quote, source_text) {
            debug!(subject, "dropping fact: evidence not verbatim");
            return Err(MemoryError::EvidenceNotVerbatim);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO facts
             (person_id, subject, content, category, evidence_quote,
              last_accessed_at_ms, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            rusqlite::params![
                person_id.map(|p| p.as_str()),
                subject,
                content,
                category,
                evidence_quote,
                now
            ],
        )?;
        let id = db.last_insert_rowid();
        db.execute(
            "INSERT INTO facts_fts(rowid, subject, content) VALUES(?1, ?2, ?3)",
            rusqlite::params![id, subject, content],
        )?;
        Ok(id)
    }

    pub fn set_fact_embedding(&self, fact_id: i64, embedding: &[f32]) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE facts SET embedding = ?2 WHERE id = ?1",
            rusqlite::params![fact_id, encode_embedding(embedding)],
        )?;
        Ok(())
    }

    /// Hybrid retrieval: FTS rank list fused with a cosine rank list (when a
    /// query embedding is available) plus a recency boost.
    pub fn retrieve_facts(
        &self,
        person_id: Option<&PersonId>,
        query: &str,
        query_embedding: Option<&[f32]>,
        cfg: &RetrievalConfig,
        limit: usize,
    ) -> Result<Vec<ScoredFact>> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let db = self.db.lock().unwrap();

        let fts_ranked = fts_rank(&db, person_id, query, limit * 4)?;
        let vec_ranked = match query_embedding {
            Some(qe) => vector_rank(&db, person_id, qe, limit * 4)?,
            None => Vec::new(),
        };

        let mut candidate_ids: Vec<i64> = fts_ranked.clone();
        for id in &vec_ranked {
            if !candidate_ids.contains(id) {
                candidate_ids.push(*id);
            }
        }
        if candidate_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut age_days: HashMap<i64, f64> = HashMap::new();
        let mut facts: HashMap<i64, Fact> = HashMap::new();
        for id in &candidate_ids {
            if let Some(fact) = query_fact(&db, *id)? {
                age_days.insert(
                    *id,
                    (now_ms - fact.created_at_ms).max(0) as f64 / 86_400_000.0,
                );
                facts.insert(*id, fact);
            }
        }

        let fused = fuse_ranks(&fts_ranked, &vec_ranked, &age_days, cfg);

        let mut out = Vec::new();
        for (id, score) in fused.into_iter().take(limit) {
            if let Some(fact) = facts.remove(&id) {
                db.execute(
                    "UPDATE facts SET last_accessed_at_ms = ?2 WHERE id = ?1",
                    rusqlite::params![id, now_ms],
                )?;
                out.push(ScoredFact { fact, score });
            }
        }
        Ok(out)
    }

    // -- episodes -----------------------------------------------------------

    pub fn log_episode(
        &self,
        chat_id: &ChatId,
        person_id: Option<&PersonId>,
        is_group: bool,
        content: &str,
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO episodes (chat_id, person_id, is_group, content, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                chat_id.as_str(),
                person_id.map(|p| p.as_str()),
                is_group,
                content,
                now
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    // -- lessons ------------------------------------------------------------

    pub fn insert_lesson(&self, lesson: &Lesson) -> Result<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO lessons
             (lesson_type, category, content, rule, person_id, chat_id,
              episode_refs, confidence, times_validated, times_violated, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                lesson.lesson_type.to_string(),
                lesson.category,
                lesson.content,
                lesson.rule,
                lesson.person_id.as_ref().map(|p| p.as_str()),
                lesson.chat_id.as_ref().map(|c| c.as_str()),
                serde_json::to_string(&lesson.episode_refs).unwrap_or_else(|_| "[]".into()),
                lesson.confidence,
                lesson.times_validated,
                lesson.times_violated,
                now
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Global lessons plus lessons scoped to `chat_id`, highest confidence
    /// first.
    pub fn list_lessons(&self, chat_id: Option<&ChatId>, limit: usize) -> Result<Vec<Lesson>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, lesson_type, category, content, rule, person_id, chat_id,
                    episode_refs, confidence, times_validated, times_violated, created_at_ms
             FROM lessons
             WHERE chat_id IS NULL OR chat_id = ?1
             ORDER BY confidence DESC, created_at_ms DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![chat_id.map(|c| c.as_str()), limit as i64],
            row_to_lesson,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Record a validation or violation against a lesson, nudging confidence.
    pub fn record_lesson_outcome(&self, lesson_id: i64, validated: bool) -> Result<()> {
        let db = self.db.lock().unwrap();
        if validated {
            db.execute(
                "UPDATE lessons
                 SET times_validated = times_validated + 1,
                     confidence = MIN(1.0, confidence + 0.05)
                 WHERE id = ?1",
                [lesson_id],
            )?;
        } else {
            db.execute(
                "UPDATE lessons
                 SET times_violated = times_violated + 1,
                     confidence = MAX(0.0, confidence - 0.1)
                 WHERE id = ?1",
                [lesson_id],
            )?;
        }
        Ok(())
    }
}

/// Whitespace-collapsed substring check for the evidence rule.
fn is_verbatim(quote: &str, source: &str) -> bool {
    let collapse = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
    let q = collapse(quote);
    if q.is_empty() {
        return false;
    }
    collapse(source).contains(&q)
}

fn fts_rank(
    db: &Connection,
    person_id: Option<&PersonId>,
    query: &str,
    limit: usize,
) -> Result<Vec<i64>> {
    let sanitized = fts_query(query);
    if sanitized.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = db.prepare(
        "SELECT f.id
         FROM facts f
         JOIN facts_fts ft ON f.id = ft.rowid
         WHERE facts_fts MATCH ?1
           AND (?2 IS NULL OR f.person_id IS NULL OR f.person_id = ?2)
         ORDER BY rank
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(
        rusqlite::params![sanitized, person_id.map(|p| p.as_str()), limit as i64],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Quote each term so user punctuation can't break FTS5 query syntax.
/// One- and two-letter terms are noise and get dropped.
fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| term.replace('"', ""))
        .filter(|t| t.chars().count() > 2)
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn vector_rank(
    db: &Connection,
    person_id: Option<&PersonId>,
    query_embedding: &[f32],
    limit: usize,
) -> Result<Vec<i64>> {
    let mut stmt = db.prepare(
        "SELECT id, embedding FROM facts
         WHERE embedding IS NOT NULL
           AND (?1 IS NULL OR person_id IS NULL OR person_id = ?1)",
    )?;
    let rows = stmt.query_map(rusqlite::params![person_id.map(|p| p.as_str())], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;

    let mut scored: Vec<(i64, f32)> = rows
        .filter_map(|r| r.ok())
        .map(|(id, blob)| (id, cosine(query_embedding, &decode_embedding(&blob))))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(scored.into_iter().take(limit).map(|(id, _)| id).collect())
}

fn query_fact(db: &Connection, id: i64) -> Result<Option<Fact>> {
    match db.query_row(
        "SELECT id, person_id, subject, content, category, evidence_quote,
                last_accessed_at_ms, created_at_ms
         FROM facts WHERE id = ?1",
        [id],
        row_to_fact,
    ) {
        Ok(f) => Ok(Some(f)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(MemoryError::Database(e)),
    }
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    Ok(Fact {
        id: row.get(0)?,
        person_id: row.get::<_, Option<String>>(1)?.map(PersonId::from),
        subject: row.get(2)?,
        content: row.get(3)?,
        category: row.get(4)?,
        evidence_quote: row.get(5)?,
        last_accessed_at_ms: row.get(6)?,
        created_at_ms: row.get(7)?,
    })
}

fn row_to_lesson(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lesson> {
    let type_str: String = row.get(1)?;
    let refs_json: String = row.get(7)?;
    Ok(Lesson {
        id: row.get(0)?,
        lesson_type: type_str.parse().unwrap_or(LessonType::Observation),
        category: row.get(2)?,
        content: row.get(3)?,
        rule: row.get(4)?,
        person_id: row.get::<_, Option<String>>(5)?.map(PersonId::from),
        chat_id: row.get::<_, Option<String>>(6)?.map(ChatId::from),
        episode_refs: serde_json::from_str(&refs_json).unwrap_or_default(),
        confidence: row.get(8)?,
        times_validated: row.get::<_, i64>(9)? as u32,
        times_violated: row.get::<_, i64>(10)? as u32,
        created_at_ms: row.get(11)?,
    })
}

fn query_person_by_channel(
    db: &Connection,
    channel: &str,
    channel_user_id: &str,
) -> Result<Option<PersonRecord>> {
    match db.query_row(
        &format!("{PERSON_SELECT} WHERE channel = ?1 AND channel_user_id = ?2"),
        rusqlite::params![channel, channel_user_id],
        row_to_person,
    ) {
        Ok(p) => Ok(Some(p)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(MemoryError::Database(e)),
    }
}

fn query_person_by_id(db: &Connection, id: &str) -> Result<Option<PersonRecord>> {
    match db.query_row(
        &format!("{PERSON_SELECT} WHERE id = ?1"),
        [id],
        row_to_person,
    ) {
        Ok(p) => Ok(Some(p)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(MemoryError::Database(e)),
    }
}

const PERSON_SELECT: &str = "SELECT id, display_name, channel, channel_user_id,
    relationship_score, trust_tier_override, capsule, public_style_capsule,
    concerns_json, goals_json, preferences_json, mood, curiosity_json,
    created_at_ms, updated_at_ms FROM people";

fn row_to_person(row: &rusqlite::Row<'_>) -> rusqlite::Result<PersonRecord> {
    let parse_list = |s: String| serde_json::from_str::<Vec<String>>(&s).unwrap_or_default();
    Ok(PersonRecord {
        id: PersonId::from(row.get::<_, String>(0)?),
        display_name: row.get(1)?,
        channel: row.get(2)?,
        channel_user_id: row.get(3)?,
        relationship_score: row.get(4)?,
        trust_tier_override: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| s.parse().ok()),
        capsule: row.get(6)?,
        public_style_capsule: row.get(7)?,
        concerns: parse_list(row.get(8)?),
        goals: parse_list(row.get(9)?),
        preferences: parse_list(row.get(10)?),
        mood: row.get(11)?,
        curiosity: parse_list(row.get(12)?),
        created_at_ms: row.get(13)?,
        updated_at_ms: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn store() -> MemoryStore {
        MemoryStore::new(open_in_memory().unwrap())
    }

    #[test]
    fn track_person_is_idempotent() {
        let s = store();
        let a = s.track_person("signal", "+1555", "Alice").unwrap();
        let b = s.track_person("signal", "+1555", "Alice").unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn relationship_score_never_decreases() {
        let s = store();
        let p = s.track_person("cli", "operator", "op").unwrap();
        assert_eq!(s.raise_relationship_score(&p.id, 0.5).unwrap(), 0.5);
        assert_eq!(s.raise_relationship_score(&p.id, 0.3).unwrap(), 0.5);
        assert_eq!(s.raise_relationship_score(&p.id, 0.7).unwrap(), 0.7);
    }

    #[test]
    fn trust_tier_follows_score_and_override() {
        let s = store();
        let p = s.track_person("cli", "op", "op").unwrap();
        assert_eq!(p.trust_tier(), TrustTier::NewContact);

        s.raise_relationship_score(&p.id, 0.3).unwrap();
        let p = s.get_person(&p.id).unwrap().unwrap();
        assert_eq!(p.trust_tier(), TrustTier::GettingToKnow);

        s.set_trust_tier_override(&p.id, Some(TrustTier::CloseFriend)).unwrap();
        let p = s.get_person(&p.id).unwrap().unwrap();
        assert_eq!(p.trust_tier(), TrustTier::CloseFriend);
    }

    #[test]
    fn fact_requires_verbatim_evidence() {
        let s = store();
        let source = "I moved to   Portland last week, it's been raining";

        // Whitespace differences collapse away.
        let ok = s.insert_fact(
            None,
            "location",
            "lives in Portland",
            "fact",
            "moved to Portland",
            source,
        );
        assert!(ok.is_ok());

        let bad = s.insert_fact(
            None,
            "location",
            "lives in Seattle",
            "fact",
            "moved to Seattle",
            source,
        );
        assert!(matches!(bad, Err(MemoryError::EvidenceNotVerbatim)));
    }

    #[test]
    fn fts_retrieval_finds_matches() {
        let s = store();
        let src = "my dog barks at the mailman every single morning";
        s.insert_fact(None, "pets", "has a dog", "fact", "my dog barks", src)
            .unwrap();
        let src2 = "I love making sourdough bread on weekends";
        s.insert_fact(None, "hobbies", "bakes bread", "fact", "making sourdough bread", src2)
            .unwrap();

        let cfg = RetrievalConfig::default();
        let hits = s.retrieve_facts(None, "dog mailman", None, &cfg, 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].fact.subject, "pets");
    }

    #[test]
    fn vector_retrieval_ranks_by_cosine() {
        let s = store();
        let src = "guitar practice is going well";
        let id1 = s
            .insert_fact(None, "music", "plays guitar", "fact", "guitar practice", src)
            .unwrap();
        let src2 = "thinking about getting into climbing";
        let id2 = s
            .insert_fact(None, "sport", "wants to climb", "fact", "into climbing", src2)
            .unwrap();
        s.set_fact_embedding(id1, &[1.0, 0.0]).unwrap();
        s.set_fact_embedding(id2, &[0.0, 1.0]).unwrap();

        let cfg = RetrievalConfig::default();
        let hits = s
            .retrieve_facts(None, "zzzz", Some(&[0.9, 0.1]), &cfg, 5)
            .unwrap();
        assert_eq!(hits[0].fact.id, id1);
    }

    #[test]
    fn lessons_scoped_by_chat() {
        let s = store();
        let mk = |chat: Option<&str>, content: &str| Lesson {
            id: 0,
            lesson_type: LessonType::Observation,
            category: "pacing".into(),
            content: content.into(),
            rule: None,
            person_id: None,
            chat_id: chat.map(ChatId::from),
            episode_refs: vec![],
            confidence: 0.5,
            times_validated: 0,
            times_violated: 0,
            created_at_ms: 0,
        };
        s.insert_lesson(&mk(None, "global lesson")).unwrap();
        s.insert_lesson(&mk(Some("signal:group:1"), "group lesson")).unwrap();
        s.insert_lesson(&mk(Some("signal:group:2"), "other group")).unwrap();

        let lessons = s
            .list_lessons(Some(&ChatId::from("signal:group:1")), 10)
            .unwrap();
        let contents: Vec<&str> = lessons.iter().map(|l| l.content.as_str()).collect();
        assert!(contents.contains(&"global lesson"));
        assert!(contents.contains(&"group lesson"));
        assert!(!contents.contains(&"other group"));
    }

    #[test]
    fn lesson_outcomes_adjust_confidence() {
        let s = store();
        let id = s
            .insert_lesson(&Lesson {
                id: 0,
                lesson_type: LessonType::Pattern,
                category: "timing".into(),
                content: "short replies land better".into(),
                rule: None,
                person_id: None,
                chat_id: None,
                episode_refs: vec![],
                confidence: 0.5,
                times_validated: 0,
                times_violated: 0,
                created_at_ms: 0,
            })
            .unwrap();

        s.record_lesson_outcome(id, true).unwrap();
        s.record_lesson_outcome(id, false).unwrap();
        let lessons = s.list_lessons(None, 10).unwrap();
        let lesson = lessons.iter().find(|l| l.id == id).unwrap();
        assert_eq!(lesson.times_validated, 1);
        assert_eq!(lesson.times_violated, 1);
        assert!((lesson.confidence - 0.45).abs() < 1e-9);
    }
}
