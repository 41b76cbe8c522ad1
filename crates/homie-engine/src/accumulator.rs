//! Per-chat burst grouping.
//!
//! Rapid-fire messages from the same chat are debounced into one turn so
//! the bot answers the thought, not every fragment of it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use homie_core::config::AccumulatorConfig;
use homie_core::types::{ChatId, IncomingMessage};

/// What to do after a message arrives.
#[derive(Debug)]
pub enum ArrivalDecision {
    /// Run a turn now with these messages (batch already drained).
    FlushNow(Vec<IncomingMessage>),
    /// Re-arm the chat's debounce timer; on expiry call `drain`.
    Wait(Duration),
}

struct Batch {
    messages: Vec<IncomingMessage>,
    first_at: Instant,
}

pub struct MessageAccumulator {
    config: AccumulatorConfig,
    batches: Mutex<HashMap<ChatId, Batch>>,
}

impl MessageAccumulator {
    pub fn new(config: AccumulatorConfig) -> Self {
        Self {
            config,
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Record an arrival and decide whether to flush or keep debouncing.
    pub fn on_arrival(&self, msg: IncomingMessage) -> ArrivalDecision {
        // Out-of-band commands flush alone; the ongoing batch is untouched.
        if msg.text.starts_with('/') {
            return ArrivalDecision::FlushNow(vec![msg]);
        }

        let mut batches = self.batches.lock().unwrap();

        // Instant-flush signals carry the accumulated burst with them.
        let instant = (msg.is_group && msg.mentioned) || !msg.attachments.is_empty();
        if instant {
            let mut drained = batches
                .remove(&msg.chat_id)
                .map(|b| b.messages)
                .unwrap_or_default();
            drained.push(msg);
            return ArrivalDecision::FlushNow(drained);
        }

        let is_group = msg.is_group;
        let continuation = has_continuation_signal(&msg.text);
        let chat_id = msg.chat_id.clone();
        let batch = batches.entry(chat_id.clone()).or_insert_with(|| Batch {
            messages: Vec::new(),
            first_at: Instant::now(),
        });
        batch.messages.push(msg);

        let elapsed = batch.first_at.elapsed();
        let count_full = self.config.max_messages > 0
            && batch.messages.len() >= self.config.max_messages;
        let waited_out = elapsed.as_millis() as u64 >= self.config.max_wait_ms;

        // max_messages == 0 is the zero-debounce config: flush on arrival.
        if self.config.max_messages == 0 || count_full || waited_out {
            let drained = batches.remove(&chat_id).map(|b| b.messages).unwrap_or_default();
            return ArrivalDecision::FlushNow(drained);
        }

        let mut window = if is_group {
            self.config.group_window_ms
        } else {
            self.config.dm_window_ms
        } as f64;
        if continuation {
            window *= self.config.continuation_multiplier;
        }

        let remaining = self
            .config
            .max_wait_ms
            .saturating_sub(elapsed.as_millis() as u64);
        let debounce = (window as u64).min(remaining);
        ArrivalDecision::Wait(Duration::from_millis(debounce))
    }

    /// Take the pending batch for a chat (debounce timer fired).
    pub fn drain(&self, chat_id: &ChatId) -> Vec<IncomingMessage> {
        self.batches
            .lock()
            .unwrap()
            .remove(chat_id)
            .map(|b| b.messages)
            .unwrap_or_default()
    }

    /// Number of chats with a pending batch.
    pub fn pending_chats(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

/// The message looks unfinished: the sender is probably still typing.
pub fn has_continuation_signal(text: &str) -> bool {
    let trimmed = text.trim_end();
    if trimmed.ends_with('…') || trimmed.ends_with("...") || trimmed.ends_with(',') {
        return true;
    }

    const CONNECTIVES: &[&str] = &["and", "but", "or", "also", "like", "so"];
    if let Some(last_word) = trimmed.rsplit(char::is_whitespace).next() {
        let word = last_word.to_lowercase();
        if CONNECTIVES.contains(&word.as_str()) {
            return true;
        }
    }

    // Short fragment with no terminal punctuation.
    trimmed.chars().count() < 20 && !trimmed.ends_with(['.', '!', '?'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use homie_core::types::MessageId;

    fn msg(chat: &str, text: &str, is_group: bool) -> IncomingMessage {
        IncomingMessage {
            channel: "signal".into(),
            chat_id: ChatId::from(chat),
            message_id: MessageId::from("m"),
            author_id: "alice".into(),
            text: text.into(),
            is_group,
            is_operator: false,
            mentioned: false,
            attachments: vec![],
            timestamp_ms: 0,
        }
    }

    fn config() -> AccumulatorConfig {
        AccumulatorConfig {
            dm_window_ms: 1000,
            group_window_ms: 2000,
            max_wait_ms: 10_000,
            max_messages: 3,
            continuation_multiplier: 2.0,
        }
    }

    #[test]
    fn zero_config_flushes_every_message() {
        let acc = MessageAccumulator::new(AccumulatorConfig::ZERO_DEBOUNCE);
        for text in ["hey", "and another", "third one…"] {
            match acc.on_arrival(msg("c", text, false)) {
                ArrivalDecision::FlushNow(batch) => assert_eq!(batch.len(), 1),
                ArrivalDecision::Wait(_) => panic!("zero config must not wait"),
            }
        }
        assert_eq!(acc.pending_chats(), 0);
    }

    #[test]
    fn command_flushes_alone_keeping_batch() {
        let acc = MessageAccumulator::new(config());
        assert!(matches!(
            acc.on_arrival(msg("c", "first part of a thought that is long enough.", false)),
            ArrivalDecision::Wait(_)
        ));

        match acc.on_arrival(msg("c", "/status", false)) {
            ArrivalDecision::FlushNow(batch) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].text, "/status");
            }
            ArrivalDecision::Wait(_) => panic!("command must flush"),
        }
        // The earlier message is still pending.
        assert_eq!(acc.drain(&ChatId::from("c")).len(), 1);
    }

    #[test]
    fn mention_flushes_with_burst_context() {
        let acc = MessageAccumulator::new(config());
        acc.on_arrival(msg("g", "talking about the weekend plans here.", true));
        let mut mentioned = msg("g", "@homie thoughts?", true);
        mentioned.mentioned = true;

        match acc.on_arrival(mentioned) {
            ArrivalDecision::FlushNow(batch) => {
                assert_eq!(batch.len(), 2);
                assert_eq!(batch[1].text, "@homie thoughts?");
            }
            ArrivalDecision::Wait(_) => panic!("mention must flush"),
        }
    }

    #[test]
    fn continuation_stretches_window() {
        let acc = MessageAccumulator::new(config());
        let plain = match acc.on_arrival(msg("a", "this is a complete sentence right here.", false)) {
            ArrivalDecision::Wait(d) => d,
            _ => panic!(),
        };
        let continued = match acc.on_arrival(msg("b", "i was thinking that we could maybe, and", false)) {
            ArrivalDecision::Wait(d) => d,
            _ => panic!(),
        };
        assert!(continued > plain);
    }

    #[test]
    fn max_messages_forces_flush() {
        let acc = MessageAccumulator::new(config());
        acc.on_arrival(msg("c", "message one which is long enough here.", false));
        acc.on_arrival(msg("c", "message two which is long enough here.", false));
        match acc.on_arrival(msg("c", "message three which is long enough too.", false)) {
            ArrivalDecision::FlushNow(batch) => assert_eq!(batch.len(), 3),
            ArrivalDecision::Wait(_) => panic!("count cap must flush"),
        }
    }

    #[test]
    fn group_window_wider_than_dm() {
        let acc = MessageAccumulator::new(config());
        let dm = match acc.on_arrival(msg("d", "complete sentence with an ending period.", false)) {
            ArrivalDecision::Wait(d) => d,
            _ => panic!(),
        };
        let group = match acc.on_arrival(msg("g", "complete sentence with an ending period.", true)) {
            ArrivalDecision::Wait(d) => d,
            _ => panic!(),
        };
        assert!(group > dm);
    }

    #[test]
    fn continuation_signals() {
        assert!(has_continuation_signal("I was thinking…"));
        assert!(has_continuation_signal("we could go there and"));
        assert!(has_continuation_signal("first the shop,"));
        assert!(has_continuation_signal("hm"));
        assert!(!has_continuation_signal("that's the whole idea."));
        assert!(!has_continuation_signal("a full sentence that ends properly!"));
    }
}
