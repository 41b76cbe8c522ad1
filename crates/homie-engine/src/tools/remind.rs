//! Reminder scheduling tool: the model can ask to be poked later.

use async_trait::async_trait;
use serde::Deserialize;

use homie_core::error::{HomieError, Result};
use homie_scheduler::{ProactiveEventKind, Recurrence};

use super::{parse_args, Tool, ToolContext, ToolTier};

/// Reminders are clamped to at most a year out.
const MAX_MINUTES_AHEAD: u64 = 366 * 24 * 60;

pub struct RemindTool;

#[derive(Deserialize)]
struct RemindArgs {
    subject: String,
    in_minutes: u64,
}

#[async_trait]
impl Tool for RemindTool {
    fn name(&self) -> &str {
        "set_reminder"
    }
    fn description(&self) -> &str {
        "Schedule a reminder in this chat after a delay"
    }
    fn tier(&self) -> ToolTier {
        ToolTier::Safe
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "subject": {"type": "string", "description": "what to bring up"},
                "in_minutes": {"type": "integer", "minimum": 1, "description": "delay in minutes"}
            },
            "required": ["subject", "in_minutes"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, input: serde_json::Value) -> Result<String> {
        let args: RemindArgs = parse_args("set_reminder", input)?;
        if args.in_minutes == 0 || args.in_minutes > MAX_MINUTES_AHEAD {
            return Err(HomieError::SchemaValidation(format!(
                "set_reminder: in_minutes must be between 1 and {MAX_MINUTES_AHEAD}"
            )));
        }

        let trigger = chrono::Utc::now().timestamp_millis() + (args.in_minutes as i64) * 60_000;
        ctx.scheduler
            .add_event(
                ProactiveEventKind::Reminder,
                &args.subject,
                &ctx.chat_id,
                trigger,
                Recurrence::Once,
            )
            .map_err(|e| HomieError::StoreIo(e.to_string()))?;
        Ok(format!(
            "reminder set for {} minutes from now: {}",
            args.in_minutes, args.subject
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homie_core::types::ChatId;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ToolContext {
        ToolContext {
            chat_id: ChatId::from("signal:dm:+1"),
            is_operator: false,
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

    #[tokio::test]
    async fn schedules_a_once_event() {
        let ctx = ctx();
        RemindTool
            .execute(
                &ctx,
                serde_json::json!({"subject": "call mom", "in_minutes": 30}),
            )
            .await
            .unwrap();

        let events = ctx.scheduler.list_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject, "call mom");
        assert_eq!(events[0].kind, ProactiveEventKind::Reminder);
    }

    #[tokio::test]
    async fn zero_minutes_rejected() {
        let ctx = ctx();
        let err = RemindTool
            .execute(&ctx, serde_json::json!({"subject": "x", "in_minutes": 0}))
            .await
            .unwrap_err();
        assert!(matches!(err, HomieError::SchemaValidation(_)));
    }
}
