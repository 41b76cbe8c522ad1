use serde::{Deserialize, Serialize};

use homie_core::types::ChatId;

/// What kind of outreach an event requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProactiveEventKind {
    Reminder,
    Birthday,
    CheckIn,
}

impl std::fmt::Display for ProactiveEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProactiveEventKind::Reminder => "reminder",
            ProactiveEventKind::Birthday => "birthday",
            ProactiveEventKind::CheckIn => "check_in",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ProactiveEventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reminder" => Ok(ProactiveEventKind::Reminder),
            "birthday" => Ok(ProactiveEventKind::Birthday),
            "check_in" => Ok(ProactiveEventKind::CheckIn),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// When an event repeats. `Once` events are marked delivered after firing;
/// recurring events advance their trigger instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    Once,
    Every { interval_ms: i64 },
    Yearly,
}

impl Recurrence {
    /// The next trigger strictly after `now_ms`, starting from
    /// `current_trigger_ms`. `None` for `Once`.
    pub fn next_after(&self, current_trigger_ms: i64, now_ms: i64) -> Option<i64> {
        match self {
            Recurrence::Once => None,
            Recurrence::Every { interval_ms } => {
                if *interval_ms <= 0 {
                    return None;
                }
                let mut next = current_trigger_ms;
                while next <= now_ms {
                    next += interval_ms;
                }
                Some(next)
            }
            Recurrence::Yearly => {
                let mut dt = chrono::DateTime::from_timestamp_millis(current_trigger_ms)?;
                let now = chrono::DateTime::from_timestamp_millis(now_ms)?;
                while dt <= now {
                    dt = dt.checked_add_months(chrono::Months::new(12))?;
                }
                Some(dt.timestamp_millis())
            }
        }
    }
}

/// A scheduled outreach event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveEvent {
    /// UUID v4 string: primary key.
    pub id: String,
    pub kind: ProactiveEventKind,
    /// What the outreach is about ("water the plants", "Sam's birthday").
    pub subject: String,
    pub chat_id: ChatId,
    pub trigger_at_ms: i64,
    pub recurrence: Recurrence,
    pub delivered: bool,
    pub created_at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_has_no_next() {
        assert_eq!(Recurrence::Once.next_after(1000, 2000), None);
    }

    #[test]
    fn every_advances_past_now() {
        let r = Recurrence::Every { interval_ms: 100 };
        assert_eq!(r.next_after(1000, 1000), Some(1100));
        assert_eq!(r.next_after(1000, 1350), Some(1400));
    }

    #[test]
    fn yearly_advances_a_year() {
        // 2026-03-01T00:00:00Z
        let trigger = chrono::DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z")
            .unwrap()
            .timestamp_millis();
        let now = trigger + 1;
        let next = Recurrence::Yearly.next_after(trigger, now).unwrap();
        let next_dt = chrono::DateTime::from_timestamp_millis(next).unwrap();
        assert_eq!(next_dt.format("%Y-%m-%d").to_string(), "2027-03-01");
    }
}
