//! Behavior engine: the fast-model gate between a drafted reply and the
//! wire. Decides send / react / silence, and provides the velocity
//! heuristics the turn engine uses for group pacing.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use homie_core::sleep::SleepWindow;
use homie_core::types::{SessionMessage, SessionRole};

use crate::accumulator::has_continuation_signal;
use crate::backend::{ChatMessage, CompletionParams, LlmBackend};
use crate::json::extract_json_object;

/// What the behavior engine decided to do with a draft.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Send,
    React { emoji: String },
    Silence { reason: Option<String> },
}

const DECISION_SYSTEM: &str = "You gate a friend-bot's drafted chat message. Decide whether to \
send it, replace it with an emoji reaction, or stay silent. Low-content drafts in groups \
(bare acknowledgements, restatements) should become reactions or silence. \
Reply with one JSON object: {\"action\":\"send\"|\"react\"|\"silence\",\"emoji\":\"…\",\"reason\":\"…\"}. \
emoji only for react; reason only for silence.";

pub struct BehaviorEngine {
    backend: Arc<dyn LlmBackend>,
    fast_model: String,
    sleep: Option<SleepWindow>,
}

impl BehaviorEngine {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        fast_model: String,
        sleep: Option<SleepWindow>,
    ) -> Self {
        Self {
            backend,
            fast_model,
            sleep,
        }
    }

    pub fn sleep_active(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.sleep
            .as_ref()
            .map(|w| w.is_in_window(now))
            .unwrap_or(false)
    }

    /// Classify a draft. Sleep mode short-circuits for non-operators; a
    /// fast-model parse failure falls back to sending the draft untouched.
    pub async fn decide(
        &self,
        draft: &str,
        is_group: bool,
        is_operator: bool,
        cancel: &CancellationToken,
    ) -> Decision {
        if !is_operator && self.sleep_active(chrono::Utc::now()) {
            return Decision::Silence {
                reason: Some("sleep_mode".into()),
            };
        }

        let context_note = if is_group {
            "This draft would go to a group chat."
        } else {
            "This draft would go to a direct message."
        };

        let params = CompletionParams {
            model: self.fast_model.clone(),
            system: DECISION_SYSTEM.to_string(),
            messages: vec![ChatMessage {
                role: SessionRole::User,
                content: format!("{context_note}\n\nDraft:\n{draft}"),
            }],
            tools: vec![],
            tool_runner: None,
            max_steps: 1,
            max_tokens: 200,
            cancel: cancel.clone(),
            events: None,
        };

        let response = match self.backend.complete(params).await {
            Ok(c) => c.text,
            Err(e) => {
                warn!(error = %e, "behavior decision call failed; sending draft");
                return Decision::Send;
            }
        };

        let Some(parsed) = extract_json_object(&response) else {
            debug!("behavior decision was not JSON; sending draft");
            return Decision::Send;
        };

        match parsed.get("action").and_then(|a| a.as_str()) {
            Some("react") => {
                let emoji = parsed
                    .get("emoji")
                    .and_then(|e| e.as_str())
                    .unwrap_or("👍")
                    .to_string();
                Decision::React { emoji }
            }
            Some("silence") => Decision::Silence {
                reason: parsed
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .map(str::to_string),
            },
            _ => Decision::Send,
        }
    }
}

/// Conversation tempo snapshot from recent session messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct VelocitySnapshot {
    pub is_burst: bool,
    pub is_rapid_dialogue: bool,
    pub is_continuation: bool,
}

const BURST_WINDOW_MS: i64 = 20_000;
const RAPID_GAP_MS: i64 = 15_000;

/// Compute velocity over the most recent user messages.
pub fn velocity_snapshot(messages: &[SessionMessage]) -> VelocitySnapshot {
    let recent: Vec<&SessionMessage> = messages
        .iter()
        .filter(|m| m.role == SessionRole::User)
        .rev()
        .take(6)
        .collect();

    if recent.is_empty() {
        return VelocitySnapshot::default();
    }

    let gaps: Vec<i64> = recent
        .windows(2)
        .map(|w| (w[0].created_at_ms - w[1].created_at_ms).abs())
        .collect();
    let avg_gap = if gaps.is_empty() {
        i64::MAX
    } else {
        gaps.iter().sum::<i64>() / gaps.len() as i64
    };

    let authors: std::collections::HashSet<&str> = recent
        .iter()
        .filter_map(|m| m.author_id.as_deref())
        .collect();

    VelocitySnapshot {
        is_burst: recent.len() >= 3 && avg_gap <= BURST_WINDOW_MS,
        is_rapid_dialogue: authors.len() >= 2 && avg_gap < RAPID_GAP_MS,
        is_continuation: has_continuation_signal(&recent[0].content),
    }
}

/// What the engine should do in a group given the tempo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPacing {
    Proceed,
    Wait,
    Skip,
}

pub fn group_pacing(v: &VelocitySnapshot) -> GroupPacing {
    if v.is_rapid_dialogue {
        // People are talking to each other; stay out of the way.
        GroupPacing::Skip
    } else if v.is_continuation {
        GroupPacing::Wait
    } else {
        GroupPacing::Proceed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homie_core::types::ChatId;

    fn msg(author: &str, content: &str, ts: i64) -> SessionMessage {
        SessionMessage {
            chat_id: ChatId::from("signal:group:1"),
            role: SessionRole::User,
            content: content.into(),
            created_at_ms: ts,
            author_id: Some(author.into()),
            source_message_id: None,
        }
    }

    #[test]
    fn burst_detected() {
        let msgs = vec![
            msg("a", "one full message right here ok.", 0),
            msg("a", "two full message right here ok.", 5_000),
            msg("a", "three full message right here.", 10_000),
        ];
        let v = velocity_snapshot(&msgs);
        assert!(v.is_burst);
    }

    #[test]
    fn rapid_dialogue_needs_two_authors() {
        let msgs = vec![
            msg("a", "what do you all think about it?", 0),
            msg("b", "i think it works pretty well ok.", 4_000),
            msg("a", "yeah that matches what i saw too.", 8_000),
        ];
        let v = velocity_snapshot(&msgs);
        assert!(v.is_rapid_dialogue);
        assert_eq!(group_pacing(&v), GroupPacing::Skip);
    }

    #[test]
    fn slow_single_author_proceeds() {
        let msgs = vec![
            msg("a", "morning! how is everyone doing today?", 0),
            msg("a", "we should plan that trip sometime soon.", 600_000),
        ];
        let v = velocity_snapshot(&msgs);
        assert!(!v.is_burst);
        assert!(!v.is_rapid_dialogue);
        assert_eq!(group_pacing(&v), GroupPacing::Proceed);
    }

    #[test]
    fn continuation_waits() {
        let msgs = vec![msg("a", "so i was thinking that we could maybe and", 0)];
        let v = velocity_snapshot(&msgs);
        assert!(v.is_continuation);
        assert_eq!(group_pacing(&v), GroupPacing::Wait);
    }

    #[test]
    fn empty_history_is_default() {
        let v = velocity_snapshot(&[]);
        assert!(!v.is_burst && !v.is_rapid_dialogue && !v.is_continuation);
    }
}
