//! Per-chat scratchpad tool: small keyed notes the bot keeps for itself.

use async_trait::async_trait;
use serde::Deserialize;

use homie_core::error::{HomieError, Result};

use super::{parse_args, Tool, ToolContext, ToolTier};

pub struct ScratchpadWriteTool;

#[derive(Deserialize)]
struct ScratchpadArgs {
    key: String,
    content: String,
}

#[async_trait]
impl Tool for ScratchpadWriteTool {
    fn name(&self) -> &str {
        "scratchpad_write"
    }
    fn description(&self) -> &str {
        "Save or update a short note under a key for this chat"
    }
    fn tier(&self) -> ToolTier {
        ToolTier::Safe
    }
    fn guidance(&self) -> Option<&str> {
        Some("Use for plans, running jokes, things to follow up on. Keep notes short.")
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "key": {"type": "string", "description": "short stable label"},
                "content": {"type": "string", "description": "the note text"}
            },
            "required": ["key", "content"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, input: serde_json::Value) -> Result<String> {
        let args: ScratchpadArgs = parse_args("scratchpad_write", input)?;
        if args.key.trim().is_empty() {
            return Err(HomieError::SchemaValidation(
                "scratchpad_write: key must not be empty".into(),
            ));
        }
        ctx.sessions
            .upsert_note(&ctx.chat_id, args.key.trim(), &args.content)
            .map_err(|e| HomieError::StoreIo(e.to_string()))?;
        Ok(format!("noted: {}", args.key.trim()))
    }
}
