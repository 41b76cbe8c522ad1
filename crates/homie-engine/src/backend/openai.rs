//! OpenAI-compatible backend (OpenAI, OpenRouter, MPP, and every
//! `/v1/chat/completions` clone). Streaming deltas, tool-call accumulation
//! by index, same bounded tool loop as the Anthropic backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{debug, warn};

use homie_core::error::{HomieError, Result};
use homie_core::types::SessionRole;

use super::anthropic::classify_api_error;
use super::usage::{normalize_usage, Usage};
use super::{with_retries, Completion, CompletionParams, TurnEvent};

const HTTP_ATTEMPTS: usize = 3;

pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    backend_name: String,
}

impl OpenAiCompatBackend {
    pub fn new(name: impl Into<String>, api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
            backend_name: name.into(),
        }
    }

    async fn stream_step(
        &self,
        params: &CompletionParams,
        messages: &[serde_json::Value],
        streamed: &mut bool,
    ) -> Result<StepOutput> {
        let mut body = serde_json::json!({
            "model": params.model,
            "messages": messages,
            "max_tokens": params.max_tokens,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !params.tools.is_empty() {
            let tools: Vec<serde_json::Value> = params
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);
        }

        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!(model = %params.model, backend = %self.backend_name, "openai-compatible streaming request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| HomieError::TransientBackend(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "openai-compatible API error");
            return Err(classify_api_error(status, &text));
        }

        let mut byte_stream = resp.bytes_stream();
        let mut line_buf = String::new();
        let mut text = String::new();
        let mut finish_reason = String::new();
        let mut model = String::new();
        let mut usage_raw = serde_json::json!({});
        // keyed by tool-call index; (id, name, arguments-so-far)
        let mut partial_tools: BTreeMap<u32, (String, String, String)> = BTreeMap::new();

        loop {
            let chunk = tokio::select! {
                _ = params.cancel.cancelled() => {
                    params.emit(TurnEvent::Aborted);
                    return Err(HomieError::Cancelled);
                }
                next = byte_stream.next() => match next {
                    Some(Ok(c)) => c,
                    Some(Err(e)) => {
                        params.emit(TurnEvent::ErrorEvent { message: e.to_string() });
                        return Err(HomieError::TransientBackend(e.to_string()));
                    }
                    None => break,
                },
            };

            let Ok(chunk_text) = std::str::from_utf8(&chunk) else {
                continue;
            };
            line_buf.push_str(chunk_text);

            while let Some(pos) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=pos).collect();
                let line = line.trim();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) else {
                    continue;
                };

                if !chunk.model.is_empty() {
                    model = chunk.model;
                }
                if let Some(u) = chunk.usage {
                    usage_raw = u;
                }
                for choice in chunk.choices {
                    if let Some(reason) = choice.finish_reason {
                        finish_reason = reason;
                    }
                    let Some(delta) = choice.delta else { continue };
                    if let Some(t) = delta.content {
                        if !t.is_empty() {
                            *streamed = true;
                            text.push_str(&t);
                            params.emit(TurnEvent::TextDelta { text: t });
                        }
                    }
                    for tc in delta.tool_calls.unwrap_or_default() {
                        let entry = partial_tools.entry(tc.index).or_default();
                        if let Some(id) = tc.id {
                            entry.0 = id;
                        }
                        if let Some(f) = tc.function {
                            if let Some(name) = f.name {
                                entry.1 = name.clone();
                                params.emit(TurnEvent::ToolCallStarted {
                                    id: entry.0.clone(),
                                    name,
                                });
                            }
                            if let Some(args) = f.arguments {
                                entry.2.push_str(&args);
                                params.emit(TurnEvent::ToolInputDelta {
                                    id: entry.0.clone(),
                                    partial_json: args,
                                });
                            }
                        }
                    }
                }
            }
        }

        let tool_calls: Vec<(String, String, serde_json::Value)> = partial_tools
            .into_values()
            .map(|(id, name, args)| {
                let input = serde_json::from_str(&args).unwrap_or_else(|_| serde_json::json!({}));
                (id, name, input)
            })
            .collect();

        Ok(StepOutput {
            text,
            tool_calls,
            usage: normalize_usage(&usage_raw),
            model,
            finish_reason,
        })
    }
}

#[async_trait]
impl super::LlmBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.backend_name
    }

    async fn complete(&self, params: CompletionParams) -> Result<Completion> {
        let mut messages: Vec<serde_json::Value> = vec![serde_json::json!({
            "role": "system",
            "content": params.system,
        })];
        for m in &params.messages {
            messages.push(serde_json::json!({
                "role": match m.role {
                    SessionRole::Assistant => "assistant",
                    SessionRole::System => "system",
                    SessionRole::User => "user",
                },
                "content": m.content,
            }));
        }

        let mut total_usage = Usage::default();
        let mut model_id = params.model.clone();
        let max_steps = params.max_steps.max(1);

        for step in 0..max_steps {
            if params.cancel.is_cancelled() {
                params.emit(TurnEvent::Aborted);
                return Err(HomieError::Cancelled);
            }

            let step_out = with_retries(HTTP_ATTEMPTS, &params.cancel, |_| {
                let msgs = messages.clone();
                let params = &params;
                async move {
                    let mut streamed = false;
                    let r = self.stream_step(params, &msgs, &mut streamed).await;
                    (r, streamed)
                }
            })
            .await?;

            total_usage.add(&step_out.usage);
            if !step_out.model.is_empty() {
                model_id = step_out.model.clone();
            }
            params.emit(TurnEvent::StepFinished { step });

            let done = step_out.tool_calls.is_empty() || step_out.finish_reason != "tool_calls";
            let runner = params.tool_runner.as_ref();
            if done || runner.is_none() {
                params.emit(TurnEvent::Done {
                    model_id: model_id.clone(),
                    usage: total_usage.clone(),
                });
                return Ok(Completion {
                    text: step_out.text,
                    steps: step + 1,
                    usage: total_usage,
                    model_id,
                });
            }
            let runner = runner.unwrap();

            // Assistant message carrying the tool calls.
            let calls_json: Vec<serde_json::Value> = step_out
                .tool_calls
                .iter()
                .map(|(id, name, input)| {
                    serde_json::json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": input.to_string()},
                    })
                })
                .collect();
            messages.push(serde_json::json!({
                "role": "assistant",
                "content": step_out.text,
                "tool_calls": calls_json,
            }));

            for (id, name, input) in step_out.tool_calls {
                if params.cancel.is_cancelled() {
                    params.emit(TurnEvent::Aborted);
                    return Err(HomieError::Cancelled);
                }
                let outcome = runner.run(&name, input).await;
                params.emit(TurnEvent::ToolResult {
                    id: id.clone(),
                    name,
                    content: outcome.content.clone(),
                    is_error: outcome.is_error,
                });
                messages.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": id,
                    "content": outcome.content,
                }));
            }
        }

        warn!(max_steps, "tool loop hit maximum steps");
        params.emit(TurnEvent::Done {
            model_id: model_id.clone(),
            usage: total_usage.clone(),
        });
        Ok(Completion {
            text: String::new(),
            steps: max_steps,
            usage: total_usage,
            model_id,
        })
    }
}

struct StepOutput {
    text: String,
    tool_calls: Vec<(String, String, serde_json::Value)>,
    usage: Usage,
    model: String,
    finish_reason: String,
}

// OpenAI stream chunk types (deserialization only)

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}
