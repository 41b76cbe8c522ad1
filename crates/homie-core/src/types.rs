use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

opaque_id!(
    /// Identifies one conversation across a channel, e.g. `cli:local`,
    /// `signal:dm:+15550100`, `signal:group:abc`.
    ChatId
);
opaque_id!(
    /// Transport-native message identifier.
    MessageId
);
opaque_id!(
    /// Stable person identifier (UUIDv7: time-sortable in logs).
    PersonId
);
opaque_id!(FactId);
opaque_id!(EpisodeId);
opaque_id!(LessonId);

impl ChatId {
    /// The channel prefix, e.g. `signal` for `signal:group:1`.
    pub fn channel(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    pub fn is_group(&self) -> bool {
        self.0.contains(":group:")
    }
}

impl PersonId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

/// One message arriving from a transport. Consumed by the turn engine;
/// never persisted in this shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncomingMessage {
    pub channel: String,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub author_id: String,
    pub text: String,
    pub is_group: bool,
    pub is_operator: bool,
    #[serde(default)]
    pub mentioned: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub content_type: String,
    /// Local path the transport downloaded the attachment to, if any.
    pub path: Option<String>,
}

/// What the engine decided to do with a turn. `SendText` is the only variant
/// that persists an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutgoingAction {
    SendText {
        text: String,
    },
    React {
        emoji: String,
        target_author_id: String,
        target_timestamp_ms: i64,
    },
    Silence {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl OutgoingAction {
    pub fn silence(reason: impl Into<String>) -> Self {
        OutgoingAction::Silence {
            reason: Some(reason.into()),
        }
    }

    pub fn is_silence(&self) -> bool {
        matches!(self, OutgoingAction::Silence { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::System => write!(f, "system"),
            SessionRole::User => write!(f, "user"),
            SessionRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for SessionRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(SessionRole::System),
            "user" => Ok(SessionRole::User),
            "assistant" => Ok(SessionRole::Assistant),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One transcript entry. Ordered within a chat by `created_at_ms`, ties
/// broken by insertion order (the store's `seq` column).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMessage {
    pub chat_id: ChatId,
    pub role: SessionRole,
    pub content: String,
    pub created_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message_id: Option<MessageId>,
}

/// Per-chat scratchpad note, upserted by tool and rendered into context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionNote {
    pub chat_id: ChatId,
    pub key: String,
    pub content: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Coarse label over the continuous relationship score. The score is the
/// source of truth; the tier is derived (with an optional operator override).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    NewContact,
    GettingToKnow,
    CloseFriend,
}

impl TrustTier {
    pub fn from_score(score: f64, over: Option<TrustTier>) -> Self {
        if let Some(t) = over {
            return t;
        }
        if score >= 0.65 {
            TrustTier::CloseFriend
        } else if score >= 0.25 {
            TrustTier::GettingToKnow
        } else {
            TrustTier::NewContact
        }
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustTier::NewContact => write!(f, "new_contact"),
            TrustTier::GettingToKnow => write!(f, "getting_to_know"),
            TrustTier::CloseFriend => write!(f, "close_friend"),
        }
    }
}

impl std::str::FromStr for TrustTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "new_contact" => Ok(TrustTier::NewContact),
            "getting_to_know" => Ok(TrustTier::GettingToKnow),
            "close_friend" => Ok(TrustTier::CloseFriend),
            other => Err(format!("unknown trust tier: {other}")),
        }
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_id_channel_and_group() {
        let dm = ChatId::from("signal:dm:+15550100");
        assert_eq!(dm.channel(), "signal");
        assert!(!dm.is_group());

        let group = ChatId::from("signal:group:abc");
        assert!(group.is_group());
    }

    #[test]
    fn trust_tier_boundaries() {
        assert_eq!(TrustTier::from_score(0.0, None), TrustTier::NewContact);
        assert_eq!(TrustTier::from_score(0.25, None), TrustTier::GettingToKnow);
        assert_eq!(TrustTier::from_score(0.649, None), TrustTier::GettingToKnow);
        assert_eq!(TrustTier::from_score(0.65, None), TrustTier::CloseFriend);
        assert_eq!(
            TrustTier::from_score(0.0, Some(TrustTier::CloseFriend)),
            TrustTier::CloseFriend
        );
    }

    #[test]
    fn incoming_message_roundtrip() {
        let msg = IncomingMessage {
            channel: "cli".into(),
            chat_id: ChatId::from("cli:local"),
            message_id: MessageId::from("m1"),
            author_id: "operator".into(),
            text: "hey".into(),
            is_group: false,
            is_operator: true,
            mentioned: false,
            attachments: vec![],
            timestamp_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: IncomingMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn outgoing_action_roundtrip() {
        for action in [
            OutgoingAction::SendText { text: "yo".into() },
            OutgoingAction::React {
                emoji: "💀".into(),
                target_author_id: "alice".into(),
                target_timestamp_ms: 123,
            },
            OutgoingAction::silence("sleep_mode"),
        ] {
            let json = serde_json::to_string(&action).unwrap();
            let back: OutgoingAction = serde_json::from_str(&json).unwrap();
            assert_eq!(back, action);
        }
    }

    #[test]
    fn session_message_roundtrip() {
        let msg = SessionMessage {
            chat_id: ChatId::from("cli:local"),
            role: SessionRole::Assistant,
            content: "yo whats up".into(),
            created_at_ms: 42,
            author_id: None,
            source_message_id: Some(MessageId::from("m9")),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: SessionMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
