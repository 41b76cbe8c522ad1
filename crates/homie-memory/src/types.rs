use serde::{Deserialize, Serialize};

use homie_core::types::{ChatId, PersonId, TrustTier};

/// One known person. `(channel, channel_user_id)` uniquely identifies them;
/// `relationship_score` only ever goes up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonRecord {
    pub id: PersonId,
    pub display_name: String,
    pub channel: String,
    pub channel_user_id: String,
    pub relationship_score: f64,
    pub trust_tier_override: Option<TrustTier>,
    /// Synthesized markdown summary, regenerated during consolidation.
    pub capsule: Option<String>,
    /// Cross-group-safe tone/style. Never contains DM-private facts.
    pub public_style_capsule: Option<String>,
    pub concerns: Vec<String>,
    pub goals: Vec<String>,
    pub preferences: Vec<String>,
    pub mood: Option<String>,
    pub curiosity: Vec<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl PersonRecord {
    pub fn trust_tier(&self) -> TrustTier {
        TrustTier::from_score(self.relationship_score, self.trust_tier_override)
    }
}

/// An extracted fact. Insertion is refused unless `evidence_quote` appears
/// verbatim (after whitespace collapse) in the source user text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub person_id: Option<PersonId>,
    pub subject: String,
    pub content: String,
    pub category: String,
    pub evidence_quote: String,
    pub last_accessed_at_ms: i64,
    pub created_at_ms: i64,
}

/// One turn's worth of "what happened".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub chat_id: ChatId,
    pub person_id: Option<PersonId>,
    pub is_group: bool,
    pub content: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonType {
    Observation,
    Failure,
    Success,
    Pattern,
}

impl std::fmt::Display for LessonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LessonType::Observation => "observation",
            LessonType::Failure => "failure",
            LessonType::Success => "success",
            LessonType::Pattern => "pattern",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for LessonType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "observation" => Ok(LessonType::Observation),
            "failure" => Ok(LessonType::Failure),
            "success" => Ok(LessonType::Success),
            "pattern" => Ok(LessonType::Pattern),
            other => Err(format!("unknown lesson type: {other}")),
        }
    }
}

/// A behavior insight produced by feedback scoring or reflection. Global
/// when `chat_id` is `None`, group-scoped otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub id: i64,
    pub lesson_type: LessonType,
    pub category: String,
    pub content: String,
    pub rule: Option<String>,
    pub person_id: Option<PersonId>,
    pub chat_id: Option<ChatId>,
    pub episode_refs: Vec<String>,
    pub confidence: f64,
    pub times_validated: u32,
    pub times_violated: u32,
    pub created_at_ms: i64,
}

/// A retrieval hit with its fused relevance score.
#[derive(Debug, Clone)]
pub struct ScoredFact {
    pub fact: Fact,
    pub score: f64,
}
