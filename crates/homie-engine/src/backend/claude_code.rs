//! Claude Code CLI backend (`claude -p --output-format stream-json`).
//!
//! The CLI runs its own tool loop internally, so this backend never drives
//! ours. A failing attempt is retried only if it streamed no delta: the
//! user may already have seen partial output otherwise.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use homie_core::error::{HomieError, Result};
use homie_core::types::SessionRole;

use super::classify::{classify_spawn, SpawnErrorClass};
use super::spawn::{spawn_with_timeouts, ChunkSource, NdjsonBuffer, SpawnResult, SpawnTimeouts};
use super::usage::{normalize_usage, Usage};
use super::{with_retries, ChatMessage, Completion, CompletionParams, TurnEvent};

const SPAWN_ATTEMPTS: usize = 2;

pub struct ClaudeCodeBackend {
    command: String,
    timeouts: SpawnTimeouts,
}

impl ClaudeCodeBackend {
    pub fn new(command: Option<String>) -> Self {
        Self {
            command: command.unwrap_or_else(|| "claude".to_string()),
            timeouts: SpawnTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: SpawnTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn build_command(&self, params: &CompletionParams) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--model")
            .arg(&params.model)
            .arg("--append-system-prompt")
            .arg(&params.system);
        cmd
    }

    async fn run_once(&self, params: &CompletionParams, streamed: &mut bool) -> Result<Completion> {
        let prompt = format_prompt(&params.messages);
        debug!(command = %self.command, prompt_len = prompt.len(), "spawning claude CLI");

        let mut ndjson = NdjsonBuffer::new();
        let mut text_parts: Vec<String> = Vec::new();
        let mut usage = Usage::default();
        let mut model_id = params.model.clone();
        let mut saw_delta = false;

        let result: SpawnResult = {
            let on_chunk = |source: ChunkSource, chunk: &str| {
                if source != ChunkSource::Stdout {
                    return;
                }
                for item in ndjson.push(chunk) {
                    handle_stream_item(
                        &item,
                        params,
                        &mut text_parts,
                        &mut usage,
                        &mut model_id,
                        &mut saw_delta,
                    );
                }
            };
            spawn_with_timeouts(
                self.build_command(params),
                Some(prompt),
                self.timeouts,
                &params.cancel,
                on_chunk,
            )
            .await?
        };

        if let Some(item) = ndjson.flush() {
            handle_stream_item(
                &item,
                params,
                &mut text_parts,
                &mut usage,
                &mut model_id,
                &mut saw_delta,
            );
        }
        *streamed = saw_delta;

        if !result.success() {
            let detail = format!(
                "claude CLI failed (exit {:?}, timed_out {:?}): {}",
                result.exit_code,
                result.timed_out.map(|t| t.as_str()),
                excerpt(&result.stderr),
            );
            return Err(match classify_spawn(&result) {
                SpawnErrorClass::FirstByteTimeout => HomieError::FirstByteTimeout(detail),
                SpawnErrorClass::Transient => HomieError::TransientBackend(detail),
                SpawnErrorClass::ModelUnavailable => HomieError::ModelUnavailable(detail),
                SpawnErrorClass::Other => HomieError::Internal(detail),
            });
        }

        params.emit(TurnEvent::Done {
            model_id: model_id.clone(),
            usage: usage.clone(),
        });
        Ok(Completion {
            text: text_parts.join(""),
            steps: 1,
            usage,
            model_id,
        })
    }
}

#[async_trait]
impl super::LlmBackend for ClaudeCodeBackend {
    fn name(&self) -> &str {
        "claude-code"
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

/// Interpret one stream-json line from the CLI.
fn handle_stream_item(
    item: &serde_json::Value,
    params: &CompletionParams,
    text_parts: &mut Vec<String>,
    usage: &mut Usage,
    model_id: &mut String,
    saw_delta: &mut bool,
) {
    match item.get("type").and_then(|t| t.as_str()) {
        Some("assistant") => {
            // {"type":"assistant","message":{"content":[{"type":"text","text":"…"}]}}
            let blocks = item
                .pointer("/message/content")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();
            for block in blocks {
                if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        *saw_delta = true;
                        text_parts.push(text.to_string());
                        params.emit(TurnEvent::TextDelta {
                            text: text.to_string(),
                        });
                    }
                } else if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                    params.emit(TurnEvent::ToolCallStarted {
                        id: block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
            }
            if let Some(model) = item.pointer("/message/model").and_then(|m| m.as_str()) {
                *model_id = model.to_string();
            }
        }
        Some("result") => {
            // Final line: {"type":"result","result":"…","usage":{…},"total_cost_usd":…}
            if text_parts.is_empty() {
                if let Some(text) = item.get("result").and_then(|r| r.as_str()) {
                    if !text.is_empty() {
                        text_parts.push(text.to_string());
                    }
                }
            }
            let mut u = normalize_usage(item.get("usage").unwrap_or(&serde_json::json!({})));
            if u.cost_usd.is_none() {
                u.cost_usd = item.get("total_cost_usd").and_then(|v| v.as_f64());
            }
            if u.payment_tx_hash.is_none() {
                u.payment_tx_hash = super::usage::scan_tx_hash(item, 0);
            }
            *usage = u;
        }
        _ => {}
    }
}

/// Flatten conversation history into a text prompt for the CLI's stdin.
fn format_prompt(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    if messages.len() > 1 {
        out.push_str("[Previous conversation]\n");
        for msg in &messages[..messages.len() - 1] {
            let role = match msg.role {
                SessionRole::User => "User",
                SessionRole::Assistant => "Assistant",
                SessionRole::System => "System",
            };
            out.push_str(&format!("{}: {}\n", role, msg.content));
        }
        out.push_str("\n[Current message]\n");
    }
    if let Some(last) = messages.last() {
        out.push_str(&last.content);
    }
    out
}

fn excerpt(s: &str) -> &str {
    if s.len() <= 500 {
        s
    } else {
        &s[..500]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn params() -> CompletionParams {
        CompletionParams {
            model: "claude-sonnet-4-6".into(),
            system: "sys".into(),
            messages: vec![ChatMessage {
                role: SessionRole::User,
                content: "hey".into(),
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
    fn stream_item_accumulates_text_and_usage() {
        let p = params();
        let mut parts = Vec::new();
        let mut usage = Usage::default();
        let mut model = String::new();
        let mut saw = false;

        let assistant = serde_json::json!({
            "type": "assistant",
            "message": {"model": "claude-sonnet-4-6", "content": [{"type": "text", "text": "yo"}]}
        });
        handle_stream_item(&assistant, &p, &mut parts, &mut usage, &mut model, &mut saw);
        assert!(saw);
        assert_eq!(parts, vec!["yo"]);
        assert_eq!(model, "claude-sonnet-4-6");

        let result = serde_json::json!({
            "type": "result",
            "result": "yo",
            "usage": {"input_tokens": 10, "output_tokens": 2},
            "total_cost_usd": 0.004
        });
        handle_stream_item(&result, &p, &mut parts, &mut usage, &mut model, &mut saw);
        // Text already captured from the assistant event; not duplicated.
        assert_eq!(parts, vec!["yo"]);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.cost_usd, Some(0.004));
    }

    #[test]
    fn prompt_format_includes_history() {
        let prompt = format_prompt(&[
            ChatMessage {
                role: SessionRole::User,
                content: "one".into(),
            },
            ChatMessage {
                role: SessionRole::Assistant,
                content: "two".into(),
            },
            ChatMessage {
                role: SessionRole::User,
                content: "three".into(),
            },
        ]);
        assert!(prompt.contains("[Previous conversation]"));
        assert!(prompt.contains("User: one"));
        assert!(prompt.contains("Assistant: two"));
        assert!(prompt.ends_with("three"));
    }
}
