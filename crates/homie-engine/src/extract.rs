//! Post-turn memory extraction.
//!
//! Best-effort: runs after a successful send, never blocks the reply, and
//! every failure is logged and dropped. Facts only survive if their
//! evidence quote is verbatim in the user's text: the store enforces that.

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use homie_core::types::{ChatId, PersonId, SessionRole};
use homie_memory::MemoryStore;

use crate::backend::{ChatMessage, CompletionParams, LlmBackend};

const EXTRACT_SYSTEM: &str = "You extract durable facts about a person from their chat \
messages. Only include things they actually said; each fact needs an exact quote from the \
text as evidence. Skip small talk. Return JSON: \
{\"facts\":[{\"subject\":\"…\",\"content\":\"…\",\"category\":\"fact|preference|plan|person\",\
\"evidence_quote\":\"…\"}],\"episode\":\"one-line summary of what happened\"}";

#[derive(Deserialize)]
struct Extraction {
    #[serde(default)]
    facts: Vec<ExtractedFact>,
    #[serde(default)]
    episode: Option<String>,
}

#[derive(Deserialize)]
struct ExtractedFact {
    subject: String,
    content: String,
    #[serde(default = "default_category")]
    category: String,
    evidence_quote: String,
}

fn default_category() -> String {
    "fact".to_string()
}

pub struct MemoryExtractor {
    backend: Arc<dyn LlmBackend>,
    fast_model: String,
    memory: Arc<MemoryStore>,
}

impl MemoryExtractor {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        fast_model: String,
        memory: Arc<MemoryStore>,
    ) -> Self {
        Self {
            backend,
            fast_model,
            memory,
        }
    }

    /// Extract facts and an episode from one turn's user text.
    pub async fn run(
        &self,
        chat_id: &ChatId,
        person_id: Option<&PersonId>,
        is_group: bool,
        user_text: &str,
    ) {
        if user_text.trim().is_empty() {
            return;
        }

        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "facts": {"type": "array"},
                "episode": {"type": "string"}
            }
        });
        let params = CompletionParams {
            model: self.fast_model.clone(),
            system: EXTRACT_SYSTEM.to_string(),
            messages: vec![ChatMessage {
                role: SessionRole::User,
                content: user_text.to_string(),
            }],
            tools: vec![],
            tool_runner: None,
            max_steps: 1,
            max_tokens: 600,
            cancel: CancellationToken::new(),
            events: None,
        };

        let value = match self.backend.complete_object(params, &schema).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "memory extraction call failed");
                return;
            }
        };
        let extraction: Extraction = match serde_json::from_value(value) {
            Ok(x) => x,
            Err(e) => {
                warn!(error = %e, "memory extraction had unexpected shape");
                return;
            }
        };

        let mut saved = 0usize;
        for fact in &extraction.facts {
            if fact.subject.is_empty() || fact.content.is_empty() {
                continue;
            }
            match self.memory.insert_fact(
                person_id,
                &fact.subject,
                &fact.content,
                &fact.category,
                &fact.evidence_quote,
                user_text,
            ) {
                Ok(_) => saved += 1,
                Err(homie_memory::MemoryError::EvidenceNotVerbatim) => {
                    debug!(subject = %fact.subject, "fact dropped: evidence not verbatim");
                }
                Err(e) => warn!(error = %e, "fact insert failed"),
            }
        }

        if let Some(episode) = extraction.episode.as_deref().filter(|e| !e.is_empty()) {
            if let Err(e) = self
                .memory
                .log_episode(chat_id, person_id, is_group, episode)
            {
                warn!(error = %e, "episode log failed");
            }
        }

        debug!(saved, total = extraction.facts.len(), "memory extraction done");
    }
}
