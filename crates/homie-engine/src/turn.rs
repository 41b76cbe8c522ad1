//! The turn engine: one entry point, `handle_incoming`, which runs the full
//! per-chat pipeline under the chat lock: person tracking, session append,
//! compaction, context build, rate limiting, the generation loop with slop
//! gating, the behavior decision, and side-effect commit.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use homie_core::config::OpenhomieConfig;
use homie_core::error::{HomieError, Result};
use homie_core::keyed::{PerKeyLock, PerKeyRateLimiter};
use homie_core::limiter::TokenBucket;
use homie_core::sleep::SleepWindow;
use homie_core::types::{
    ChatId, IncomingMessage, OutgoingAction, SessionMessage, SessionRole,
};
use homie_feedback::{derive_ref_key, FeedbackStore};
use homie_memory::types::PersonRecord;
use homie_memory::MemoryStore;
use homie_scheduler::EventScheduler;
use homie_sessions::{CompactionParams, SessionStore};

use crate::backend::{ChatMessage, CompletionParams, EventSink, LlmBackend};
use crate::behavior::{group_pacing, velocity_snapshot, BehaviorEngine, Decision, GroupPacing};
use crate::context::ContextBuilder;
use crate::extract::MemoryExtractor;
use crate::identity::IdentityPackage;
use crate::lifecycle::Lifecycle;
use crate::slop::{check_slop, REGEN_DIRECTIVE};
use crate::tools::exec::ToolExecutor;
use crate::tools::{to_specs, ToolContext, ToolRegistry};

/// Messages never summarized away by compaction.
const COMPACTION_RECENT_KEEP: usize = 12;
/// Per-tool output cap (tokens).
const MAX_TOKENS_PER_TOOL: usize = 2_000;
/// Shared tool output budget per turn (tokens).
const TURN_TOOL_BUDGET: usize = 6_000;
/// Completion output ceiling per backend call.
const MAX_COMPLETION_TOKENS: u32 = 1_024;

const SUMMARIZE_SYSTEM: &str = "Summarize this conversation excerpt in a few sentences. Keep \
names, plans, running jokes, and anything either side would expect to be remembered. Plain \
prose, no preamble.";

/// The proactive sentinel: a model with nothing worth saying returns this.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

#[derive(Clone)]
pub struct TurnStores {
    pub sessions: Arc<SessionStore>,
    pub memory: Arc<MemoryStore>,
    pub feedback: Arc<FeedbackStore>,
    pub scheduler: Arc<EventScheduler>,
}

/// Per-call knobs. Proactive turns skip the user-message append and convert
/// empty/heartbeat output to silence.
pub struct TurnOptions {
    pub proactive: bool,
    pub cancel: CancellationToken,
    pub events: Option<EventSink>,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            proactive: false,
            cancel: CancellationToken::new(),
            events: None,
        }
    }
}

pub type CompactionHook = Box<dyn Fn(&[SessionMessage]) + Send + Sync>;

/// Engine-level wiring that isn't part of `OpenhomieConfig`.
pub struct TurnEngineConfig {
    pub identity: IdentityPackage,
    pub registry: ToolRegistry,
}

pub struct TurnEngine {
    config: OpenhomieConfig,
    stores: TurnStores,
    backend: Arc<dyn LlmBackend>,
    context: ContextBuilder,
    behavior: BehaviorEngine,
    extractor: Arc<MemoryExtractor>,
    registry: ToolRegistry,
    persona_reminder: String,
    chat_lock: PerKeyLock<String>,
    global_limiter: TokenBucket,
    chat_limiter: PerKeyRateLimiter<String>,
    response_seq: DashMap<String, u64>,
    lifecycle: Arc<Lifecycle>,
    on_compacted: Option<CompactionHook>,
}

impl TurnEngine {
    pub fn new(
        config: OpenhomieConfig,
        stores: TurnStores,
        backend: Arc<dyn LlmBackend>,
        engine_config: TurnEngineConfig,
    ) -> Result<Self> {
        let sleep = SleepWindow::from_config(&config.behavior.sleep)?;
        let behavior = BehaviorEngine::new(
            Arc::clone(&backend),
            config.model.models.fast.clone(),
            sleep,
        );
        let extractor = Arc::new(MemoryExtractor::new(
            Arc::clone(&backend),
            config.model.models.fast.clone(),
            Arc::clone(&stores.memory),
        ));
        let context = ContextBuilder::new(
            Arc::clone(&stores.sessions),
            Arc::clone(&stores.memory),
            engine_config.identity.clone(),
            config.clone(),
        );
        let persona_reminder = engine_config
            .identity
            .soul
            .as_deref()
            .and_then(|s| s.lines().find(|l| !l.trim().is_empty()))
            .unwrap_or("You are still the same friend you have been all along.")
            .to_string();

        let global_limiter = TokenBucket::new(
            config.engine.limiter.capacity,
            config.engine.limiter.refill_per_second,
        );
        let chat_limiter = PerKeyRateLimiter::new(
            config.engine.per_chat_limiter.capacity,
            config.engine.per_chat_limiter.refill_per_second,
            Duration::from_millis(config.engine.per_chat_limiter.stale_after_ms),
            config.engine.per_chat_limiter.sweep_interval,
        );

        Ok(Self {
            config,
            stores,
            backend,
            context,
            behavior,
            extractor,
            registry: engine_config.registry,
            persona_reminder,
            chat_lock: PerKeyLock::new(),
            global_limiter,
            chat_limiter,
            response_seq: DashMap::new(),
            lifecycle: Arc::new(Lifecycle::new()),
            on_compacted: None,
        })
    }

    pub fn with_compaction_hook(mut self, hook: CompactionHook) -> Self {
        self.on_compacted = Some(hook);
        self
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    /// Handle one (possibly batched) incoming message. Turns for the same
    /// chat are fully serialized; a turn whose input was superseded while it
    /// generated is discarded before persistence.
    pub async fn handle_incoming(
        &self,
        msg: IncomingMessage,
        opts: TurnOptions,
    ) -> Result<OutgoingAction> {
        if self.lifecycle.is_shutting_down() {
            return Ok(OutgoingAction::silence("shutting_down"));
        }

        let chat_key = msg.chat_id.as_str().to_string();
        // Bump before waiting on the lock: any newer arrival supersedes the
        // in-flight turn for this chat.
        let my_seq = {
            let mut entry = self.response_seq.entry(chat_key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let turn_id = Uuid::new_v4();
        self.chat_lock
            .run_exclusive(chat_key, || async {
                match self.run_turn(&msg, &opts, my_seq, turn_id).await {
                    Ok(action) => Ok(action),
                    Err(HomieError::Cancelled) => {
                        info!(%turn_id, chat = %msg.chat_id, "turn cancelled");
                        Ok(OutgoingAction::silence("interrupted"))
                    }
                    Err(e) => {
                        // Never leak backend or tool failures into chat text.
                        error!(
                            %turn_id,
                            chat = %msg.chat_id,
                            message_id = %msg.message_id,
                            kind = e.kind(),
                            error = %e,
                            "turn failed"
                        );
                        Ok(OutgoingAction::silence("turn_error"))
                    }
                }
            })
            .await?
    }

    async fn run_turn(
        &self,
        msg: &IncomingMessage,
        opts: &TurnOptions,
        my_seq: u64,
        turn_id: Uuid,
    ) -> Result<OutgoingAction> {
        let chat_id = &msg.chat_id;

        if msg.text.trim().is_empty() && msg.attachments.is_empty() && !opts.proactive {
            return Ok(OutgoingAction::silence("empty"));
        }

        if !msg.is_operator && self.behavior.sleep_active(chrono::Utc::now()) {
            return Ok(OutgoingAction::silence("sleep_mode"));
        }

        let person = self.track_person(msg);

        if !opts.proactive {
            self.stores
                .sessions
                .append_message(&SessionMessage {
                    chat_id: chat_id.clone(),
                    role: SessionRole::User,
                    content: msg.text.clone(),
                    created_at_ms: msg.timestamp_ms,
                    author_id: Some(msg.author_id.clone()),
                    source_message_id: Some(msg.message_id.clone()),
                })
                .map_err(|e| HomieError::StoreIo(e.to_string()))?;

            if let Err(e) = self.compact_if_needed(chat_id, false).await {
                warn!(%turn_id, error = %e, "compaction failed; continuing");
            }

            // Group pacing: in a busy group, an unmentioned bot stays quiet.
            if msg.is_group && !msg.mentioned {
                let recent = self
                    .stores
                    .sessions
                    .get_messages(chat_id, 8)
                    .map_err(|e| HomieError::StoreIo(e.to_string()))?;
                match group_pacing(&velocity_snapshot(&recent)) {
                    GroupPacing::Skip => {
                        return Ok(OutgoingAction::silence("group_velocity_skip"))
                    }
                    GroupPacing::Wait => return Ok(OutgoingAction::silence("group_wait")),
                    GroupPacing::Proceed => {}
                }
            }
        }

        let selected = self
            .registry
            .select_for_turn(msg.is_operator, &self.config.tools);
        let tool_specs = to_specs(&selected);
        let built =
            self.context
                .build(chat_id, person.as_ref(), msg.is_group, &msg.text, tool_specs)?;

        self.global_limiter.take(1.0, &opts.cancel).await?;
        self.chat_limiter
            .take(&chat_id.as_str().to_string(), 1.0, &opts.cancel)
            .await?;

        let executor = Arc::new(ToolExecutor::new(
            selected,
            ToolContext {
                chat_id: chat_id.clone(),
                is_operator: msg.is_operator,
                is_group: msg.is_group,
                cancel: opts.cancel.clone(),
                sessions: Arc::clone(&self.stores.sessions),
                scheduler: Arc::clone(&self.stores.scheduler),
            },
            MAX_TOKENS_PER_TOOL,
            TURN_TOOL_BUDGET,
        ));

        let mut messages = built.history.clone();
        for data in &built.data_messages {
            messages.push(ChatMessage {
                role: SessionRole::User,
                content: data.clone(),
            });
        }
        if opts.proactive {
            messages.push(ChatMessage {
                role: SessionRole::User,
                content: "Send the proactive message now.".to_string(),
            });
        }

        let max_steps = if opts.proactive {
            self.config.engine.generation.proactive_max_steps
        } else {
            self.config.engine.generation.reactive_max_steps
        };

        // Generation loop: bounded regeneration on slop, one forced
        // compaction retry on context overflow.
        let max_attempts = self.config.engine.generation.max_regens + 1;
        let mut regen_directive: Option<&str> = None;
        let mut overflow_retried = false;
        let mut attempts = 0;
        let draft = loop {
            attempts += 1;
            let mut system = built.system.clone();
            if let Some(directive) = regen_directive {
                system.push_str("\n\n");
                system.push_str(directive);
            }

            let params = CompletionParams {
                model: self.config.model.models.default.clone(),
                system,
                messages: messages.clone(),
                tools: built.tools.clone(),
                tool_runner: Some(executor.clone()),
                max_steps,
                max_tokens: MAX_COMPLETION_TOKENS,
                cancel: opts.cancel.clone(),
                events: opts.events.clone(),
            };

            let completion = match self.backend.complete(params).await {
                Ok(c) => c,
                Err(HomieError::ContextOverflow(m)) if !overflow_retried => {
                    warn!(%turn_id, error = %m, "context overflow; forcing compaction and retrying once");
                    overflow_retried = true;
                    if let Err(e) = self.compact_if_needed(chat_id, true).await {
                        warn!(%turn_id, error = %e, "forced compaction failed");
                    }
                    attempts -= 1;
                    continue;
                }
                Err(HomieError::ContextOverflow(_)) => {
                    return Ok(OutgoingAction::silence("context_overflow"));
                }
                Err(e) => return Err(e),
            };

            debug!(
                %turn_id,
                model = %completion.model_id,
                steps = completion.steps,
                tokens_in = completion.usage.input_tokens,
                tokens_out = completion.usage.output_tokens,
                "generation attempt complete"
            );

            let text = completion.text.trim().to_string();
            if text.is_empty() {
                break String::new();
            }

            let clamped = clamp_chars(&text, built.max_chars);
            let report = check_slop(&clamped);
            if !report.is_slop {
                break clamped;
            }

            let categories: Vec<&str> =
                report.violations.iter().map(|v| v.category).collect();
            if attempts >= max_attempts {
                info!(%turn_id, ?categories, "slop persisted through final attempt; staying silent");
                return Ok(OutgoingAction::silence("slop_rejected"));
            }
            info!(%turn_id, ?categories, attempt = attempts, "slop detected; regenerating");
            regen_directive = Some(REGEN_DIRECTIVE);
        };

        if opts.proactive {
            if draft.is_empty() || draft == HEARTBEAT_OK {
                return Ok(OutgoingAction::silence("heartbeat_ok"));
            }
            return self.commit_send(msg, person.as_ref(), draft, my_seq, true);
        }

        if draft.is_empty() {
            return Ok(OutgoingAction::silence("empty_draft"));
        }

        match self
            .behavior
            .decide(&draft, msg.is_group, msg.is_operator, &opts.cancel)
            .await
        {
            Decision::Send => self.commit_send(msg, person.as_ref(), draft, my_seq, false),
            Decision::React { emoji } => Ok(OutgoingAction::React {
                emoji,
                target_author_id: msg.author_id.clone(),
                target_timestamp_ms: msg.timestamp_ms,
            }),
            Decision::Silence { reason } => Ok(OutgoingAction::Silence {
                reason: reason.or_else(|| Some("behavior_silence".into())),
            }),
        }
    }

    /// Persist and account for a send. The stale-sequence check runs here,
    /// immediately before persistence: if a newer message for this chat
    /// arrived while we generated, this turn's output is discarded.
    fn commit_send(
        &self,
        msg: &IncomingMessage,
        person: Option<&PersonRecord>,
        draft: String,
        my_seq: u64,
        proactive: bool,
    ) -> Result<OutgoingAction> {
        let chat_key = msg.chat_id.as_str();
        let current = self.response_seq.get(chat_key).map(|v| *v).unwrap_or(0);
        if current != my_seq {
            info!(chat = %msg.chat_id, "turn superseded by newer input; discarding draft");
            return Ok(OutgoingAction::silence("superseded"));
        }

        let now = homie_core::types::now_ms();
        self.stores
            .sessions
            .append_message(&SessionMessage {
                chat_id: msg.chat_id.clone(),
                role: SessionRole::Assistant,
                content: draft.clone(),
                created_at_ms: now,
                author_id: None,
                source_message_id: None,
            })
            .map_err(|e| HomieError::StoreIo(e.to_string()))?;

        // Feedback registration is best-effort: a broken feedback store
        // never blocks a send.
        let native_id = format!("{}:{}", msg.channel, my_seq);
        let ref_key = derive_ref_key(&msg.channel, chat_key, &native_id);
        if let Err(e) = self
            .stores
            .feedback
            .register_outgoing(&ref_key, chat_key, &draft, now)
        {
            warn!(error = %e, "feedback registration failed");
        }

        if let Some(person) = person {
            let nudged = (person.relationship_score + 0.01).min(1.0);
            if let Err(e) = self
                .stores
                .memory
                .raise_relationship_score(&person.id, nudged)
            {
                warn!(error = %e, "relationship nudge failed");
            }
        }

        if !proactive && self.config.memory.enabled {
            let extractor = Arc::clone(&self.extractor);
            let chat_id = msg.chat_id.clone();
            let person_id = person.map(|p| p.id.clone());
            let is_group = msg.is_group;
            let user_text = msg.text.clone();
            tokio::spawn(async move {
                extractor
                    .run(&chat_id, person_id.as_ref(), is_group, &user_text)
                    .await;
            });
        }

        self.lifecycle.record_successful_turn();
        Ok(OutgoingAction::SendText { text: draft })
    }

    fn track_person(&self, msg: &IncomingMessage) -> Option<PersonRecord> {
        if !self.config.memory.enabled {
            return None;
        }
        match self
            .stores
            .memory
            .track_person(&msg.channel, &msg.author_id, &msg.author_id)
        {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(error = %e, "person tracking failed");
                None
            }
        }
    }

    /// Run the compaction protocol, summarizing through the fast model.
    pub async fn compact_if_needed(&self, chat_id: &ChatId, force: bool) -> Result<bool> {
        let backend = Arc::clone(&self.backend);
        let fast_model = self.config.model.models.fast.clone();

        let outcome = self
            .stores
            .sessions
            .compact_if_needed(
                CompactionParams {
                    chat_id,
                    max_tokens: self.config.engine.context.max_tokens_default,
                    recent_keep: COMPACTION_RECENT_KEEP,
                    persona_reminder: &self.persona_reminder,
                    force,
                },
                |transcript| async move {
                    let params = CompletionParams {
                        model: fast_model,
                        system: SUMMARIZE_SYSTEM.to_string(),
                        messages: vec![ChatMessage {
                            role: SessionRole::User,
                            content: transcript,
                        }],
                        tools: vec![],
                        tool_runner: None,
                        max_steps: 1,
                        max_tokens: 700,
                        cancel: CancellationToken::new(),
                        events: None,
                    };
                    backend
                        .complete(params)
                        .await
                        .map(|c| c.text)
                        .map_err(|e| e.to_string())
                },
            )
            .await
            .map_err(|e| HomieError::StoreIo(e.to_string()))?;

        if outcome.compacted {
            if let Some(hook) = &self.on_compacted {
                hook(&outcome.summarized);
            }
        }
        Ok(outcome.compacted)
    }
}

/// Clamp to a char budget, then drop the trailing whitespace the slice may
/// have exposed.
fn clamp_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    cut.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_is_noop_when_short() {
        assert_eq!(clamp_chars("hey", 280), "hey");
    }

    #[test]
    fn clamp_cuts_and_trims() {
        let out = clamp_chars("abcd efgh ", 5);
        assert_eq!(out, "abcd");
    }

    #[test]
    fn clamp_handles_multibyte() {
        let out = clamp_chars("héllo wörld", 6);
        assert_eq!(out.chars().count(), 6);
    }
}
