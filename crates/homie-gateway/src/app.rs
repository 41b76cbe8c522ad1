//! Application wiring: stores, backend, engine, dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use homie_core::config::{OpenhomieConfig, ProviderKind};
use homie_core::interval::IntervalLoop;
use homie_engine::backend::{
    anthropic::AnthropicBackend, claude_code::ClaudeCodeBackend, codex::CodexBackend,
    openai::OpenAiCompatBackend, FallbackModel, LlmBackend,
};
use homie_engine::identity::load_identity;
use homie_engine::lifecycle::Lifecycle;
use homie_engine::proactive::ProactiveDispatcher;
use homie_engine::tools::{
    read_url::ReadUrlTool, remind::RemindTool, scratchpad::ScratchpadWriteTool, ToolRegistry,
};
use homie_engine::turn::{TurnEngine, TurnEngineConfig, TurnStores};

pub struct AppState {
    pub config: OpenhomieConfig,
    pub stores: Arc<TurnStores>,
    pub engine: Arc<TurnEngine>,
    pub dispatcher: Arc<ProactiveDispatcher>,
    pub lifecycle: Arc<Lifecycle>,
}

impl AppState {
    pub fn build(config: OpenhomieConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.paths.data_dir)?;
        let data = |name: &str| format!("{}/{}", config.paths.data_dir, name);

        let stores = Arc::new(TurnStores {
            sessions: Arc::new(homie_sessions::SessionStore::new(homie_sessions::db::open(
                &data("sessions.db"),
            )?)),
            memory: Arc::new(homie_memory::MemoryStore::new(homie_memory::db::open(
                &data("memory.db"),
            )?)),
            feedback: Arc::new(homie_feedback::FeedbackStore::new(homie_feedback::db::open(
                &data("feedback.db"),
            )?)),
            scheduler: Arc::new(homie_scheduler::EventScheduler::new(
                homie_scheduler::db::open(&data("events.db"))?,
            )),
        });

        let backend = build_backend(&config);
        info!(backend = backend.name(), model = %config.model.models.default, "backend ready");

        let identity = match load_identity(std::path::Path::new(&config.paths.identity_dir)) {
            Ok(pkg) => pkg,
            Err(e) => {
                warn!("identity load failed ({e}); starting with an empty identity");
                Default::default()
            }
        };

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ReadUrlTool::new(None)))?;
        registry.register(Arc::new(ScratchpadWriteTool))?;
        registry.register(Arc::new(RemindTool))?;

        // Voice-note transcription only when a whisper model is configured.
        if let Ok(model) = std::env::var("OPENHOMIE_WHISPER_MODEL") {
            let audio_dir = std::path::PathBuf::from(data("attachments"));
            std::fs::create_dir_all(&audio_dir)?;
            registry.register(Arc::new(
                homie_engine::tools::transcribe::TranscribeAudioTool::new(
                    None,
                    std::path::PathBuf::from(model),
                    audio_dir,
                ),
            ))?;
        }

        for skill in homie_engine::tools::skills::load_skills(std::path::Path::new(
            &config.paths.skills_dir,
        )) {
            registry.register(skill)?;
        }

        let engine = Arc::new(TurnEngine::new(
            config.clone(),
            (*stores).clone(),
            Arc::clone(&backend),
            TurnEngineConfig { identity, registry },
        )?);
        let lifecycle = engine.lifecycle();

        let dispatcher = Arc::new(ProactiveDispatcher::new(
            Arc::clone(&engine),
            Arc::clone(&stores),
            config.proactive.clone(),
        ));

        Ok(Self {
            config,
            stores,
            engine,
            dispatcher,
            lifecycle,
        })
    }

    /// Periodically score and finalize quiet feedback rows.
    pub fn spawn_finalize_loop(&self, cancel: CancellationToken) -> IntervalLoop {
        let feedback = Arc::clone(&self.stores.feedback);
        let memory = Arc::clone(&self.stores.memory);
        let cfg = self.config.memory.feedback.clone();
        IntervalLoop::spawn(
            "feedback-finalize",
            Duration::from_secs(300),
            cancel,
            move || {
                let feedback = Arc::clone(&feedback);
                let memory = Arc::clone(&memory);
                let cfg = cfg.clone();
                async move {
                    let now = homie_core::types::now_ms();
                    let outcomes = feedback
                        .finalize_due(now, cfg.finalize_after_ms)
                        .map_err(|e| homie_core::error::HomieError::StoreIo(e.to_string()))?;
                    for outcome in outcomes {
                        let lesson_type = if outcome.score >= cfg.success_threshold {
                            Some(homie_memory::types::LessonType::Success)
                        } else if outcome.score <= cfg.failure_threshold {
                            Some(homie_memory::types::LessonType::Failure)
                        } else {
                            None
                        };
                        let Some(lesson_type) = lesson_type else { continue };
                        let lesson = homie_memory::types::Lesson {
                            id: 0,
                            lesson_type,
                            category: "feedback".into(),
                            content: format!(
                                "message {:?} scored {:.2} ({} replies, {} reactions)",
                                summarize(&outcome.row.text),
                                outcome.score,
                                outcome.row.reply_count,
                                outcome.row.reaction_count
                            ),
                            rule: None,
                            person_id: None,
                            chat_id: Some(homie_core::types::ChatId::from(
                                outcome.row.chat_id.clone(),
                            )),
                            episode_refs: vec![],
                            confidence: 0.5,
                            times_validated: 0,
                            times_violated: 0,
                            created_at_ms: now,
                        };
                        if let Err(e) = memory.insert_lesson(&lesson) {
                            warn!(error = %e, "lesson insert failed");
                        }
                    }
                    Ok(())
                }
            },
        )
    }
}

fn summarize(text: &str) -> String {
    text.chars().take(60).collect()
}

fn build_backend(config: &OpenhomieConfig) -> Arc<dyn LlmBackend> {
    let provider = &config.model.provider;
    let api_key = provider.api_key.clone().unwrap_or_default();
    let inner: Arc<dyn LlmBackend> = match provider.kind {
        ProviderKind::Anthropic => Arc::new(AnthropicBackend::new(
            api_key,
            provider.base_url.clone(),
        )),
        ProviderKind::OpenaiCompatible => Arc::new(OpenAiCompatBackend::new(
            "openai-compatible",
            api_key,
            provider.base_url.clone(),
        )),
        ProviderKind::Mpp => Arc::new(OpenAiCompatBackend::new(
            "mpp",
            api_key,
            provider.base_url.clone(),
        )),
        ProviderKind::ClaudeCode => Arc::new(ClaudeCodeBackend::new(provider.command.clone())),
        ProviderKind::CodexCli => Arc::new(CodexBackend::new(provider.command.clone())),
    };
    Arc::new(FallbackModel::new(inner, config.model.models.default.clone()))
}
