//! Stdin/stdout transport: the operator talking to the bot locally.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use homie_core::types::{ChatId, IncomingMessage, MessageId, OutgoingAction};
use homie_engine::accumulator::{ArrivalDecision, MessageAccumulator};
use homie_engine::turn::TurnOptions;

use crate::app::AppState;

const CLI_CHAT: &str = "cli:local";

/// Read lines from stdin until EOF or cancellation; each line is one
/// incoming message. The CLI runs with the zero-debounce accumulator: a
/// terminal already batches by line.
pub async fn run(state: Arc<AppState>, cancel: CancellationToken) {
    let accumulator =
        MessageAccumulator::new(homie_core::config::AccumulatorConfig::ZERO_DEBOUNCE);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut seq: u64 = 0;

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => return,
            },
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        seq += 1;
        let msg = IncomingMessage {
            channel: "cli".into(),
            chat_id: ChatId::from(CLI_CHAT),
            message_id: MessageId::from(format!("cli:{seq}")),
            author_id: "operator".into(),
            text: text.to_string(),
            is_group: false,
            is_operator: true,
            mentioned: false,
            attachments: vec![],
            timestamp_ms: homie_core::types::now_ms(),
        };

        let batch = match accumulator.on_arrival(msg) {
            ArrivalDecision::FlushNow(batch) => batch,
            ArrivalDecision::Wait(_) => continue,
        };

        for msg in batch {
            let result = state
                .engine
                .handle_incoming(
                    msg,
                    TurnOptions {
                        cancel: cancel.child_token(),
                        ..Default::default()
                    },
                )
                .await;
            match result {
                Ok(OutgoingAction::SendText { text }) => println!("{text}"),
                Ok(OutgoingAction::React { emoji, .. }) => println!("[react {emoji}]"),
                Ok(OutgoingAction::Silence { reason }) => {
                    if let Some(reason) = reason {
                        tracing::debug!(reason, "silence");
                    }
                }
                Err(e) => warn!(error = %e, "turn error"),
            }
        }
    }
}
