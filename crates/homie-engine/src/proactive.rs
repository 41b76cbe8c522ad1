//! Proactive outreach: due events become synthesized turns.
//!
//! The dispatcher polls the scheduler, gates each event on relationship
//! trust and sleep, and feeds survivors into the regular turn pipeline as
//! virtual incoming messages. An `IntervalLoop` supervises the polling.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use homie_core::config::ProactiveConfig;
use homie_core::error::Result;
use homie_core::interval::IntervalLoop;
use homie_core::types::{ChatId, IncomingMessage, MessageId, OutgoingAction, TrustTier};

use homie_scheduler::{ProactiveEvent, ProactiveEventKind};

use crate::turn::{TurnEngine, TurnOptions, TurnStores};

const WARMING_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

pub struct ProactiveDispatcher {
    engine: Arc<TurnEngine>,
    stores: Arc<TurnStores>,
    config: ProactiveConfig,
}

impl ProactiveDispatcher {
    pub fn new(engine: Arc<TurnEngine>, stores: Arc<TurnStores>, config: ProactiveConfig) -> Self {
        Self {
            engine,
            stores,
            config,
        }
    }

    /// Spawn the supervised heartbeat loop.
    pub fn spawn_loop(self: Arc<Self>, cancel: CancellationToken) -> IntervalLoop {
        let period = Duration::from_millis(self.config.heartbeat_interval_ms.max(1_000));
        IntervalLoop::spawn("proactive", period, cancel, move || {
            let dispatcher = Arc::clone(&self);
            async move { dispatcher.dispatch_due().await }
        })
    }

    /// Process every due event once.
    pub async fn dispatch_due(&self) -> Result<()> {
        let now = homie_core::types::now_ms();
        let due = self
            .stores
            .scheduler
            .due_events(now)
            .map_err(|e| homie_core::error::HomieError::StoreIo(e.to_string()))?;

        for event in due {
            let action = self.dispatch_event(&event).await;
            let reason = match &action {
                OutgoingAction::Silence { reason } => reason.clone().unwrap_or_default(),
                _ => String::new(),
            };

            // An event is consumed on success and on permanent gating
            // outcomes. Sleep mode and turn errors leave it live so a later
            // heartbeat retries.
            let consume = !matches!(reason.as_str(), "sleep_mode" | "turn_error" | "interrupted");
            if consume {
                match self.stores.scheduler.mark_delivered(&event, now) {
                    Ok(true) => debug!(event = %event.id, outcome = %reason, "event consumed"),
                    Ok(false) => warn!(event = %event.id, "event claim lost; already consumed"),
                    Err(e) => warn!(event = %event.id, error = %e, "event claim failed"),
                }
            } else {
                info!(event = %event.id, outcome = %reason, "event deferred for retry");
            }
        }
        Ok(())
    }

    /// Gate and run one event. Returns the action the turn produced (or the
    /// gating silence).
    pub async fn dispatch_event(&self, event: &ProactiveEvent) -> OutgoingAction {
        let Some(msg) = synthesize_message(&event.chat_id, &event.subject) else {
            return OutgoingAction::silence("proactive_unroutable");
        };

        // Trust gating applies to relationship-driven kinds only; explicit
        // reminders and birthdays were asked for.
        if !matches!(
            event.kind,
            ProactiveEventKind::Reminder | ProactiveEventKind::Birthday
        ) && !msg.is_operator
        {
            let tier = match self
                .stores
                .memory
                .find_person(&msg.channel, &msg.author_id)
            {
                Ok(Some(person)) => person.trust_tier(),
                Ok(None) => TrustTier::NewContact,
                Err(e) => {
                    warn!(error = %e, "person lookup failed during proactive gating");
                    TrustTier::NewContact
                }
            };

            match tier {
                TrustTier::NewContact => {
                    return OutgoingAction::silence("proactive_relationship_too_new")
                }
                TrustTier::GettingToKnow => {
                    let since = homie_core::types::now_ms() - WARMING_WINDOW_MS;
                    let recent = self
                        .stores
                        .feedback
                        .sends_since(event.chat_id.as_str(), since)
                        .unwrap_or(0);
                    if recent >= 1 {
                        return OutgoingAction::silence("proactive_warming_throttle");
                    }
                }
                TrustTier::CloseFriend => {}
            }
        }

        info!(event = %event.id, kind = %event.kind, chat = %event.chat_id, "running proactive turn");
        match self
            .engine
            .handle_incoming(
                msg,
                TurnOptions {
                    proactive: true,
                    cancel: CancellationToken::new(),
                    events: None,
                },
            )
            .await
        {
            Ok(action) => action,
            Err(e) => {
                warn!(event = %event.id, error = %e, "proactive turn failed");
                OutgoingAction::silence("turn_error")
            }
        }
    }
}

/// Build the virtual incoming message for a chat id. Returns `None` when
/// the chat id has no recognizable shape.
pub fn synthesize_message(chat_id: &ChatId, subject: &str) -> Option<IncomingMessage> {
    let raw = chat_id.as_str();
    let (channel, rest) = raw.split_once(':')?;
    if channel.is_empty() || rest.is_empty() {
        return None;
    }

    let (author_id, is_group, is_operator) = if channel == "cli" {
        ("operator".to_string(), false, true)
    } else if let Some(group) = rest.strip_prefix("group:") {
        if group.is_empty() {
            return None;
        }
        (format!("group:{group}"), true, false)
    } else if let Some(peer) = rest.strip_prefix("dm:") {
        if peer.is_empty() {
            return None;
        }
        (peer.to_string(), false, false)
    } else {
        return None;
    };

    Some(IncomingMessage {
        channel: channel.to_string(),
        chat_id: chat_id.clone(),
        message_id: MessageId::from(format!("proactive:{subject}")),
        author_id,
        text: String::new(),
        is_group,
        is_operator,
        mentioned: false,
        attachments: vec![],
        timestamp_ms: homie_core::types::now_ms(),
    })
}
