//! Codex CLI backend (`codex exec --json`). JSONL item stream; the reply is
//! carried by `{"type":"item.completed","item":{"type":"agent_message",…}}`
//! lines. Same spawn timeouts and retry discipline as the Claude Code
//! backend.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use homie_core::error::{HomieError, Result};

use super::classify::{classify_spawn, SpawnErrorClass};
use super::spawn::{spawn_with_timeouts, ChunkSource, NdjsonBuffer, SpawnResult, SpawnTimeouts};
use super::usage::{normalize_usage, Usage};
use super::{with_retries, Completion, CompletionParams, TurnEvent};

const SPAWN_ATTEMPTS: usize = 2;

pub struct CodexBackend {
    command: String,
    timeouts: SpawnTimeouts,
}

impl CodexBackend {
    pub fn new(command: Option<String>) -> Self {
        Self {
            command: command.unwrap_or_else(|| "codex".to_string()),
            timeouts: SpawnTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: SpawnTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    async fn run_once(&self, params: &CompletionParams, streamed: &mut bool) -> Result<Completion> {
        // System prompt and history travel in the prompt text; codex keeps
        // no session state between invocations here.
        let mut prompt = String::new();
        if !params.system.is_empty() {
            prompt.push_str(&params.system);
            prompt.push_str("\n\n");
        }
        for msg in &params.messages {
            prompt.push_str(&msg.content);
            prompt.push('\n');
        }

        let mut cmd = Command::new(&self.command);
        cmd.arg("exec")
            .arg("--json")
            .arg("--model")
            .arg(&params.model)
            .arg("-");
        debug!(command = %self.command, "spawning codex CLI");

        let mut ndjson = NdjsonBuffer::new();
        let mut text_parts: Vec<String> = Vec::new();
        let mut usage = Usage::default();
        let mut saw_delta = false;

        let result: SpawnResult = {
            let on_chunk = |source: ChunkSource, chunk: &str| {
                if source != ChunkSource::Stdout {
                    return;
                }
                for item in ndjson.push(chunk) {
                    handle_item(&item, params, &mut text_parts, &mut usage, &mut saw_delta);
                }
            };
            spawn_with_timeouts(cmd, Some(prompt), self.timeouts, &params.cancel, on_chunk)
                .await?
        };

        if let Some(item) = ndjson.flush() {
            handle_item(&item, params, &mut text_parts, &mut usage, &mut saw_delta);
        }
        *streamed = saw_delta;

        if !result.success() {
            let detail = format!(
                "codex CLI failed (exit {:?}, timed_out {:?}): {}",
                result.exit_code,
                result.timed_out.map(|t| t.as_str()),
                &result.stderr.chars().take(500).collect::<String>(),
            );
            return Err(match classify_spawn(&result) {
                SpawnErrorClass::FirstByteTimeout => HomieError::FirstByteTimeout(detail),
                SpawnErrorClass::Transient => HomieError::TransientBackend(detail),
                SpawnErrorClass::ModelUnavailable => HomieError::ModelUnavailable(detail),
                SpawnErrorClass::Other => HomieError::Internal(detail),
            });
        }

        params.emit(TurnEvent::Done {
            model_id: params.model.clone(),
            usage: usage.clone(),
        });
        Ok(Completion {
            text: text_parts.join("\n"),
            steps: 1,
            usage,
            model_id: params.model.clone(),
        })
    }
}

#[async_trait]
impl super::LlmBackend for CodexBackend {
    fn name(&self) -> &str {
        "codex-cli"
    }

    async fn complete(&self, params: CompletionParams) -> Result<Completion> {
        let cancel = params.cancel.clone();
        with_retries(SPAWN_ATTEMPTS, &cancel, |_| {
            let params = &params;
            async move {
                let mut streamed = false;
                let r = self.run_once(params, &mut streamed).await;
                (r, streamed)
            }
        })
        .await
    }
}

fn handle_item(
    item: &serde_json::Value,
    params: &CompletionParams,
    text_parts: &mut Vec<String>,
    usage: &mut Usage,
    saw_delta: &mut bool,
) {
    match item.get("type").and_then(|t| t.as_str()) {
        Some("item.completed") => {
            let inner = item.get("item").cloned().unwrap_or_default();
            if inner.get("type").and_then(|t| t.as_str()) == Some("agent_message") {
                if let Some(text) = inner.get("text").and_then(|t| t.as_str()) {
                    *saw_delta = true;
                    text_parts.push(text.to_string());
                    params.emit(TurnEvent::TextDelta {
                        text: text.to_string(),
                    });
                }
            }
        }
        Some("turn.completed") => {
            if let Some(raw) = item.get("usage") {
                *usage = normalize_usage(raw);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homie_core::types::SessionRole;
    use tokio_util::sync::CancellationToken;

    fn params() -> CompletionParams {
        CompletionParams {
            model: "gpt-5-codex".into(),
            system: String::new(),
            messages: vec![super::super::ChatMessage {
                role: SessionRole::User,
                content: "hi".into(),
            }],
            tools: vec![],
            tool_runner: None,
            max_steps: 1,
            max_tokens: 1024,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    #[test]
    fn agent_message_items_extracted() {
        let p = params();
        let mut parts = Vec::new();
        let mut usage = Usage::default();
        let mut saw = false;

        let noise = serde_json::json!({"type": "item.started", "item": {"type": "command_execution"}});
        handle_item(&noise, &p, &mut parts, &mut usage, &mut saw);
        assert!(parts.is_empty());

        let message = serde_json::json!({
            "type": "item.completed",
            "item": {"type": "agent_message", "text": "sure thing"}
        });
        handle_item(&message, &p, &mut parts, &mut usage, &mut saw);
        assert_eq!(parts, vec!["sure thing"]);
        assert!(saw);

        let done = serde_json::json!({
            "type": "turn.completed",
            "usage": {"input_tokens": 5, "output_tokens": 3}
        });
        handle_item(&done, &p, &mut parts, &mut usage, &mut saw);
        assert_eq!(usage.output_tokens, 3);
    }
}
