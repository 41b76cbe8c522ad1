//! LLM backend contract.
//!
//! Two families implement it: in-process streaming backends (Anthropic,
//! OpenAI-compatible) and subprocess backends (Claude Code CLI, Codex CLI).
//! Streaming is surfaced as a single queue of tagged `TurnEvent`s rather
//! than a bundle of callbacks.

pub mod anthropic;
pub mod claude_code;
pub mod classify;
pub mod codex;
pub mod openai;
pub mod spawn;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use homie_core::error::{HomieError, Result};
use homie_core::types::SessionRole;

pub use usage::Usage;

/// Tagged stream events, delivered in order and non-overlapping per turn.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    TextDelta { text: String },
    ReasoningDelta { text: String },
    ToolCallStarted { id: String, name: String },
    ToolInputDelta { id: String, partial_json: String },
    ToolResult { id: String, name: String, content: String, is_error: bool },
    StepFinished { step: usize },
    Done { model_id: String, usage: Usage },
    ErrorEvent { message: String },
    Aborted,
}

pub type EventSink = mpsc::UnboundedSender<TurnEvent>;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: SessionRole,
    pub content: String,
}

/// Tool surface exposed to the model for one turn.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Outcome of executing one tool call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

/// Executes tool calls on the backend's behalf during the tool loop.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, name: &str, input: serde_json::Value) -> ToolOutcome;
}

pub struct CompletionParams {
    pub model: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub tool_runner: Option<Arc<dyn ToolRunner>>,
    pub max_steps: usize,
    pub max_tokens: u32,
    pub cancel: CancellationToken,
    pub events: Option<EventSink>,
}

impl CompletionParams {
    pub fn emit(&self, event: TurnEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub steps: usize,
    pub usage: Usage,
    pub model_id: String,
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Run one completion, driving the tool loop up to `max_steps`.
    async fn complete(&self, params: CompletionParams) -> Result<Completion>;

    /// JSON-constrained completion. The default implementation appends a
    /// schema instruction and extracts the first JSON object from the text.
    async fn complete_object(
        &self,
        mut params: CompletionParams,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        params.system = format!(
            "{}\n\nRespond with exactly one JSON object matching this schema and nothing else:\n{}",
            params.system, schema
        );
        let completion = self.complete(params).await?;
        crate::json::extract_json_object(&completion.text).ok_or_else(|| {
            HomieError::SchemaValidation("model response contained no JSON object".into())
        })
    }
}

/// One-shot fallback to the configured default model when the requested
/// model is unavailable.
pub struct FallbackModel {
    inner: Arc<dyn LlmBackend>,
    fallback: String,
}

impl FallbackModel {
    pub fn new(inner: Arc<dyn LlmBackend>, fallback: impl Into<String>) -> Self {
        Self {
            inner,
            fallback: fallback.into(),
        }
    }
}

#[async_trait]
impl LlmBackend for FallbackModel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, params: CompletionParams) -> Result<Completion> {
        let requested = params.model.clone();
        let retry_params = CompletionParams {
            model: self.fallback.clone(),
            system: params.system.clone(),
            messages: params.messages.clone(),
            tools: params.tools.clone(),
            tool_runner: params.tool_runner.clone(),
            max_steps: params.max_steps,
            max_tokens: params.max_tokens,
            cancel: params.cancel.clone(),
            events: params.events.clone(),
        };

        match self.inner.complete(params).await {
            Err(HomieError::ModelUnavailable(msg)) if requested != self.fallback => {
                warn!(
                    requested = %requested,
                    fallback = %self.fallback,
                    "model unavailable; falling back once"
                );
                self.inner.complete(retry_params).await.map_err(|e| {
                    info!(error = %e, "fallback model also failed");
                    match e {
                        HomieError::ModelUnavailable(m) => {
                            HomieError::ModelUnavailable(format!("{msg}; fallback failed: {m}"))
                        }
                        other => other,
                    }
                })
            }
            other => other,
        }
    }
}

const BASE_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 8_000;

/// Retry transient failures with bounded exponential backoff. An attempt
/// that reported streamed output is never retried: the user may already
/// have seen part of it.
pub(crate) async fn with_retries<T, F, Fut>(
    max_attempts: usize,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = (Result<T>, bool)>,
{
    let mut last_err = None;
    for i in 0..max_attempts {
        if cancel.is_cancelled() {
            return Err(HomieError::Cancelled);
        }
        let (result, streamed) = attempt(i).await;
        match result {
            Ok(v) => return Ok(v),
            Err(HomieError::TransientBackend(msg)) if !streamed && i + 1 < max_attempts => {
                let delay = (BASE_BACKOFF_MS << i).min(MAX_BACKOFF_MS);
                warn!(attempt = i + 1, delay_ms = delay, error = %msg, "transient backend error; retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(HomieError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                }
                last_err = Some(HomieError::TransientBackend(msg));
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| HomieError::Internal("retry loop exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicUsize::new(0);
        let cancel = CancellationToken::new();
        let result: Result<u32> = with_retries(5, &cancel, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    (Err(HomieError::TransientBackend("flaky".into())), false)
                } else {
                    (Ok(42), false)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn no_retry_after_stream_started() {
        let calls = AtomicUsize::new(0);
        let cancel = CancellationToken::new();
        let result: Result<u32> = with_retries(5, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { (Err(HomieError::TransientBackend("mid-stream".into())), true) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let calls = AtomicUsize::new(0);
        let cancel = CancellationToken::new();
        let result: Result<u32> = with_retries(5, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { (Err(HomieError::ModelUnavailable("gone".into())), false) }
        })
        .await;
        assert!(matches!(result, Err(HomieError::ModelUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
