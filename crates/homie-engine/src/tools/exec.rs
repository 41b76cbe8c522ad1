//! Bounded tool execution.
//!
//! One `ToolExecutor` lives for one turn. It enforces a per-tool output cap
//! and a shared per-turn token budget, merges the parent cancellation with
//! each tool's own timeout, and converts every failure into a short error
//! string the model can react to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use homie_core::budget::estimate_tokens;
use homie_core::error::HomieError;

use crate::backend::{ToolOutcome, ToolRunner};

use super::{Tool, ToolContext};

/// Default per-call timeout when the tool doesn't declare one.
const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct ToolUsageRecord {
    pub tool_name: String,
    pub tokens_used: usize,
    pub truncated: bool,
    pub is_error: bool,
}

pub struct ToolExecutor {
    tools: HashMap<String, Arc<dyn Tool>>,
    ctx: ToolContext,
    max_tokens_per_tool: usize,
    remaining_tokens: Mutex<usize>,
    records: Mutex<Vec<ToolUsageRecord>>,
}

impl ToolExecutor {
    pub fn new(
        tools: Vec<Arc<dyn Tool>>,
        ctx: ToolContext,
        max_tokens_per_tool: usize,
        turn_budget_tokens: usize,
    ) -> Self {
        Self {
            tools: tools
                .into_iter()
                .map(|t| (t.name().to_string(), t))
                .collect(),
            ctx,
            max_tokens_per_tool,
            remaining_tokens: Mutex::new(turn_budget_tokens),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Usage records accumulated this turn (telemetry and tests).
    pub fn usage_records(&self) -> Vec<ToolUsageRecord> {
        self.records.lock().unwrap().clone()
    }

    fn record(&self, tool_name: &str, tokens_used: usize, truncated: bool, is_error: bool) {
        self.records.lock().unwrap().push(ToolUsageRecord {
            tool_name: tool_name.to_string(),
            tokens_used,
            truncated,
            is_error,
        });
    }

    /// Apply per-tool and shared budgets to a tool's raw output.
    fn apply_budget(&self, tool_name: &str, output: String, is_error: bool) -> ToolOutcome {
        let mut remaining = self.remaining_tokens.lock().unwrap();
        let cap = self.max_tokens_per_tool.min(*remaining);
        let tokens = estimate_tokens(&output);

        let (content, truncated) = if tokens > cap {
            let max_chars = (cap as f64 * 3.3) as usize;
            (truncate_middle(&output, max_chars.max(80)), true)
        } else {
            (output, false)
        };

        let used = estimate_tokens(&content).min(*remaining);
        *remaining -= used;
        drop(remaining);

        self.record(tool_name, used, truncated, is_error);
        if truncated {
            debug!(tool = tool_name, used, "tool output truncated to budget");
        }
        ToolOutcome { content, is_error }
    }
}

#[async_trait]
impl ToolRunner for ToolExecutor {
    async fn run(&self, name: &str, input: serde_json::Value) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            self.record(name, 0, false, true);
            return ToolOutcome {
                content: format!("unknown tool: {name}"),
                is_error: true,
            };
        };

        if *self.remaining_tokens.lock().unwrap() == 0 {
            self.record(name, 0, false, true);
            return ToolOutcome {
                content: "tool output budget for this turn is exhausted".to_string(),
                is_error: true,
            };
        }

        let timeout = Duration::from_millis(tool.timeout_ms().unwrap_or(DEFAULT_TOOL_TIMEOUT_MS));
        // Derived cancellation: parent abort or tool timeout, whichever first.
        let child_cancel = self.ctx.cancel.child_token();
        let mut ctx = self.ctx.clone();
        ctx.cancel = child_cancel.clone();

        debug!(tool = name, "executing tool");
        let result = tokio::select! {
            r = tool.execute(&ctx, input) => r,
            _ = child_cancel.cancelled() => Err(HomieError::Cancelled),
            _ = tokio::time::sleep(timeout) => {
                // Stop any in-flight work the tool spawned off this context.
                child_cancel.cancel();
                Err(HomieError::Internal(format!("tool timed out after {}ms", timeout.as_millis())))
            }
        };

        match result {
            Ok(output) => self.apply_budget(name, output, false),
            Err(e) => {
                warn!(tool = name, error = %e, kind = e.kind(), "tool execution failed");
                // Short error string for the model; details stay in the log.
                let message = match e {
                    HomieError::SchemaValidation(msg) => {
                        format!("input did not match the tool schema: {msg}")
                    }
                    HomieError::Cancelled => "tool execution was cancelled".to_string(),
                    other => format!("tool failed: {}", other.kind()),
                };
                self.apply_budget(name, message, true)
            }
        }
    }
}

/// Middle-omission truncation: keeps the head (what was asked) and the tail
/// (the outcome), cutting on char boundaries.
pub fn truncate_middle(output: &str, max_chars: usize) -> String {
    let chars: Vec<char> = output.chars().collect();
    if chars.len() <= max_chars {
        return output.to_owned();
    }

    let half = max_chars / 2;
    let head: String = chars[..half].iter().collect();
    let tail: String = chars[chars.len() - half..].iter().collect();
    let omitted = chars.len() - max_chars;
    format!("{head}\n... [{omitted} chars omitted] ...\n{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{parse_args, ToolTier};
    use homie_core::error::Result;
    use homie_core::types::ChatId;
    use serde::Deserialize;
    use tokio_util::sync::CancellationToken;

    struct EchoTool;

    #[derive(Deserialize)]
    struct EchoArgs {
        text: String,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo input back"
        }
        fn tier(&self) -> ToolTier {
            ToolTier::Safe
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }
        async fn execute(&self, _ctx: &ToolContext, input: serde_json::Value) -> Result<String> {
            let args: EchoArgs = parse_args("echo", input)?;
            Ok(args.text)
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps forever"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn timeout_ms(&self) -> Option<u64> {
            Some(50)
        }
        async fn execute(&self, _ctx: &ToolContext, _input: serde_json::Value) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("never".into())
        }
    }

    fn context() -> ToolContext {
        ToolContext {
            chat_id: ChatId::from("cli:local"),
            is_operator: true,
            is_group: false,
            cancel: CancellationToken::new(),
            sessions: Arc::new(homie_sessions::SessionStore::new(
                homie_sessions::db::open_in_memory().unwrap(),
            )),
            scheduler: Arc::new(homie_scheduler::EventScheduler::new(
                homie_scheduler::db::open_in_memory().unwrap(),
            )),
        }
    }

    fn executor(per_tool: usize, budget: usize) -> ToolExecutor {
        ToolExecutor::new(
            vec![Arc::new(EchoTool), Arc::new(SlowTool)],
            context(),
            per_tool,
            budget,
        )
    }

    #[tokio::test]
    async fn happy_path_echo() {
        let ex = executor(1000, 10_000);
        let out = ex.run("echo", serde_json::json!({"text": "hello"})).await;
        assert!(!out.is_error);
        assert_eq!(out.content, "hello");
    }

    #[tokio::test]
    async fn unknown_tool_is_error_string() {
        let ex = executor(1000, 10_000);
        let out = ex.run("nope", serde_json::json!({})).await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn schema_mismatch_surfaces_to_model() {
        let ex = executor(1000, 10_000);
        let out = ex.run("echo", serde_json::json!({"wrong": 1})).await;
        assert!(out.is_error);
        assert!(out.content.contains("schema"));
    }

    #[tokio::test]
    async fn tool_timeout_is_bounded() {
        let ex = executor(1000, 10_000);
        let start = std::time::Instant::now();
        let out = ex.run("slow", serde_json::json!({})).await;
        assert!(out.is_error);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn parent_cancellation_stops_tool() {
        let ctx = context();
        let cancel = ctx.cancel.clone();
        let ex = ToolExecutor::new(vec![Arc::new(SlowTool)], ctx, 1000, 10_000);
        cancel.cancel();
        let out = ex.run("slow", serde_json::json!({})).await;
        assert!(out.is_error);
        assert!(out.content.contains("cancelled"));
    }

    #[tokio::test]
    async fn oversized_output_truncated_and_recorded() {
        let ex = executor(20, 10_000);
        let big = "x".repeat(5_000);
        let out = ex.run("echo", serde_json::json!({"text": big})).await;
        assert!(out.content.contains("chars omitted"));
        let records = ex.usage_records();
        assert_eq!(records.len(), 1);
        assert!(records[0].truncated);
    }

    #[tokio::test]
    async fn shared_budget_depletes_across_calls() {
        let ex = executor(10_000, 30);
        let big = "y".repeat(1_000);
        let first = ex.run("echo", serde_json::json!({"text": big.clone()})).await;
        assert!(first.content.contains("chars omitted"));
        // Budget is spent; further calls are refused.
        let second = ex.run("echo", serde_json::json!({"text": "tiny"})).await;
        assert!(second.is_error || estimate_tokens(&second.content) <= 30);
    }

    #[test]
    fn truncate_middle_keeps_ends() {
        let input = format!("{}{}{}", "A".repeat(100), "B".repeat(100), "C".repeat(100));
        let out = truncate_middle(&input, 100);
        assert!(out.starts_with('A'));
        assert!(out.ends_with('C'));
        assert!(out.contains("chars omitted"));
    }

    #[test]
    fn truncate_middle_noop_when_fits() {
        assert_eq!(truncate_middle("short", 100), "short");
    }
}
