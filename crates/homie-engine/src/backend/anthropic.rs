//! Anthropic Messages API backend: streaming SSE with an in-process tool
//! loop bounded by `max_steps`.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use homie_core::error::{HomieError, Result};
use homie_core::types::SessionRole;

use super::classify::{
    is_context_overflow_message, is_model_unavailable_message, is_transient_message,
};
use super::usage::{normalize_usage, Usage};
use super::{with_retries, Completion, CompletionParams, TurnEvent};

const API_VERSION: &str = "2023-06-01";
const HTTP_ATTEMPTS: usize = 3;

pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicBackend {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
        }
    }

    async fn stream_step(
        &self,
        params: &CompletionParams,
        raw_messages: &[serde_json::Value],
        streamed: &mut bool,
    ) -> Result<StepOutput> {
        let mut body = serde_json::json!({
            "model": params.model,
            "max_tokens": params.max_tokens,
            "system": params.system,
            "messages": raw_messages,
            "stream": true,
        });
        if !params.tools.is_empty() {
            let tools: Vec<serde_json::Value> = params
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = serde_json::Value::Array(tools);
        }

        let url = format!("{}/v1/messages", self.base_url);
        debug!(model = %params.model, "anthropic streaming request");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| HomieError::TransientBackend(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "anthropic API error");
            return Err(classify_api_error(status, &text));
        }

        process_sse(resp, params, &params.cancel, streamed).await
    }
}

#[async_trait]
impl super::LlmBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, params: CompletionParams) -> Result<Completion> {
        let mut raw_messages: Vec<serde_json::Value> = params
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": match m.role {
                        SessionRole::Assistant => "assistant",
                        _ => "user",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut total_usage = Usage::default();
        let mut model_id = params.model.clone();
        let max_steps = params.max_steps.max(1);

        for step in 0..max_steps {
            if params.cancel.is_cancelled() {
                params.emit(TurnEvent::Aborted);
                return Err(HomieError::Cancelled);
            }

            let step_out = with_retries(HTTP_ATTEMPTS, &params.cancel, |_| {
                let raw = raw_messages.clone();
                let params = &params;
                async move {
                    let mut streamed = false;
                    let r = self.stream_step(params, &raw, &mut streamed).await;
                    (r, streamed)
                }
            })
            .await?;

            total_usage.add(&step_out.usage);
            if !step_out.model.is_empty() {
                model_id = step_out.model.clone();
            }
            params.emit(TurnEvent::StepFinished { step });

            if step_out.tool_calls.is_empty() || step_out.stop_reason != "tool_use" {
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

            let Some(runner) = params.tool_runner.as_ref() else {
                // Tools offered but nobody to run them; stop with the text.
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
            };

            // Assistant turn: any text plus the tool_use blocks.
            let mut assistant_content: Vec<serde_json::Value> = Vec::new();
            if !step_out.text.is_empty() {
                assistant_content.push(serde_json::json!({
                    "type": "text",
                    "text": step_out.text,
                }));
            }
            for call in &step_out.tool_calls {
                assistant_content.push(serde_json::json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": call.input,
                }));
            }
            raw_messages.push(serde_json::json!({
                "role": "assistant",
                "content": assistant_content,
            }));

            let mut results: Vec<serde_json::Value> = Vec::new();
            for call in step_out.tool_calls {
                if params.cancel.is_cancelled() {
                    params.emit(TurnEvent::Aborted);
                    return Err(HomieError::Cancelled);
                }
                let outcome = runner.run(&call.name, call.input.clone()).await;
                params.emit(TurnEvent::ToolResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    content: outcome.content.clone(),
                    is_error: outcome.is_error,
                });
                results.push(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": call.id,
                    "content": outcome.content,
                    "is_error": outcome.is_error,
                }));
            }
            raw_messages.push(serde_json::json!({
                "role": "user",
                "content": results,
            }));
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

pub(crate) fn classify_api_error(status: u16, body: &str) -> HomieError {
    if is_context_overflow_message(body) {
        return HomieError::ContextOverflow(format!("{status}: {body}"));
    }
    if is_model_unavailable_message(body) {
        return HomieError::ModelUnavailable(format!("{status}: {body}"));
    }
    if status == 429 || status >= 500 || is_transient_message(body) {
        return HomieError::TransientBackend(format!("{status}: {body}"));
    }
    HomieError::Internal(format!("backend error {status}: {body}"))
}

struct ToolCallOut {
    id: String,
    name: String,
    input: serde_json::Value,
}

struct StepOutput {
    text: String,
    tool_calls: Vec<ToolCallOut>,
    usage: Usage,
    model: String,
    stop_reason: String,
}

/// Drive one SSE response to completion, emitting deltas as they arrive.
async fn process_sse(
    resp: reqwest::Response,
    params: &CompletionParams,
    cancel: &CancellationToken,
    streamed: &mut bool,
) -> Result<StepOutput> {
    let mut byte_stream = resp.bytes_stream();

    let mut line_buf = String::new();
    let mut current_event = String::new();
    let mut block_type = String::new();
    let mut text = String::new();
    let mut tool_id = String::new();
    let mut tool_name = String::new();
    let mut tool_input_json = String::new();
    let mut tool_calls: Vec<ToolCallOut> = Vec::new();
    let mut usage_raw = serde_json::json!({});
    let mut model = String::new();
    let mut stop_reason = String::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
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
            if line.is_empty() {
                continue;
            }

            if let Some(event) = line.strip_prefix("event: ") {
                current_event = event.to_string();
                continue;
            }
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };

            match current_event.as_str() {
                "message_start" => {
                    if let Ok(start) = serde_json::from_str::<MessageStart>(data) {
                        model = start.message.model;
                        usage_raw["input_tokens"] =
                            serde_json::json!(start.message.usage.input_tokens);
                        if let Some(cache) = start.message.usage.cache_read_input_tokens {
                            usage_raw["cache_read_input_tokens"] = serde_json::json!(cache);
                        }
                    }
                }
                "content_block_start" => {
                    if let Ok(start) = serde_json::from_str::<ContentBlockStart>(data) {
                        block_type = start.content_block.block_type.clone();
                        if block_type == "tool_use" {
                            tool_id = start.content_block.id.unwrap_or_default();
                            tool_name = start.content_block.name.unwrap_or_default();
                            tool_input_json.clear();
                            params.emit(TurnEvent::ToolCallStarted {
                                id: tool_id.clone(),
                                name: tool_name.clone(),
                            });
                        }
                    }
                }
                "content_block_delta" => {
                    if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(data) {
                        match delta.delta.delta_type.as_str() {
                            "text_delta" => {
                                if let Some(t) = delta.delta.text {
                                    *streamed = true;
                                    text.push_str(&t);
                                    params.emit(TurnEvent::TextDelta { text: t });
                                }
                            }
                            "thinking_delta" => {
                                if let Some(t) = delta.delta.thinking {
                                    *streamed = true;
                                    params.emit(TurnEvent::ReasoningDelta { text: t });
                                }
                            }
                            "input_json_delta" => {
                                if let Some(partial) = delta.delta.partial_json {
                                    tool_input_json.push_str(&partial);
                                    params.emit(TurnEvent::ToolInputDelta {
                                        id: tool_id.clone(),
                                        partial_json: partial,
                                    });
                                }
                            }
                            _ => {}
                        }
                    }
                }
                "content_block_stop" => {
                    if block_type == "tool_use" {
                        let input = serde_json::from_str::<serde_json::Value>(&tool_input_json)
                            .unwrap_or_else(|_| serde_json::json!({}));
                        tool_calls.push(ToolCallOut {
                            id: std::mem::take(&mut tool_id),
                            name: std::mem::take(&mut tool_name),
                            input,
                        });
                        tool_input_json.clear();
                    }
                    block_type.clear();
                }
                "message_delta" => {
                    if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                        usage_raw["output_tokens"] = serde_json::json!(delta.usage.output_tokens);
                        if let Some(reason) = delta.delta.stop_reason {
                            stop_reason = reason;
                        }
                    }
                }
                "error" => {
                    warn!(data, "anthropic stream error event");
                    params.emit(TurnEvent::ErrorEvent {
                        message: data.to_string(),
                    });
                    return Err(classify_api_error(0, data));
                }
                _ => {}
            }
        }
    }

    Ok(StepOutput {
        text,
        tool_calls,
        usage: normalize_usage(&usage_raw),
        model,
        stop_reason,
    })
}

// Anthropic SSE data types (deserialization only)

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    model: String,
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u32,
    cache_read_input_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    content_block: ContentBlockMeta,
}

#[derive(Deserialize)]
struct ContentBlockMeta {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_classification() {
        assert!(matches!(
            classify_api_error(429, "rate limited"),
            HomieError::TransientBackend(_)
        ));
        assert!(matches!(
            classify_api_error(503, "unavailable"),
            HomieError::TransientBackend(_)
        ));
        assert!(matches!(
            classify_api_error(404, "model claude-x does not exist"),
            HomieError::ModelUnavailable(_)
        ));
        assert!(matches!(
            classify_api_error(400, "prompt is too long: maximum context length exceeded"),
            HomieError::ContextOverflow(_)
        ));
        assert!(matches!(
            classify_api_error(400, "bad request: unknown field"),
            HomieError::Internal(_)
        ));
    }
}
