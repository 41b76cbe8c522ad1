//! Error classification over finished subprocess results and provider
//! error strings.

use once_cell::sync::Lazy;
use regex::Regex;

use super::spawn::{SpawnResult, TimedOut};

static TRANSIENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)network.?timeout|connection.?(reset|refused)|temporar|rate.?limit|429|502|503|504|overloaded",
    )
    .unwrap()
});

static MODEL_UNAVAILABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)model.*does not exist|not supported|do not have access|not available|upgrade.*plan",
    )
    .unwrap()
});

static CONTEXT_OVERFLOW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)context.{0,20}(length|window)|prompt is too long|too many tokens|maximum.{0,20}tokens.{0,20}exceed",
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnErrorClass {
    Transient,
    ModelUnavailable,
    FirstByteTimeout,
    Other,
}

/// Classify a finished spawn. Precedence: first-byte beats everything (it is
/// the actionable "nothing ever arrived" case), then model access, then
/// transient.
pub fn classify_spawn(result: &SpawnResult) -> SpawnErrorClass {
    if result.timed_out == Some(TimedOut::FirstByte) {
        return SpawnErrorClass::FirstByteTimeout;
    }

    let combined = format!("{}\n{}", result.stdout, result.stderr);
    if MODEL_UNAVAILABLE.is_match(&combined) {
        return SpawnErrorClass::ModelUnavailable;
    }
    if matches!(result.timed_out, Some(TimedOut::Idle) | Some(TimedOut::Total))
        || TRANSIENT.is_match(&combined)
    {
        return SpawnErrorClass::Transient;
    }
    SpawnErrorClass::Other
}

pub fn is_transient_message(msg: &str) -> bool {
    TRANSIENT.is_match(msg)
}

pub fn is_model_unavailable_message(msg: &str) -> bool {
    MODEL_UNAVAILABLE.is_match(msg)
}

pub fn is_context_overflow_message(msg: &str) -> bool {
    CONTEXT_OVERFLOW.is_match(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_result(stdout: &str, stderr: &str, timed_out: Option<TimedOut>) -> SpawnResult {
        SpawnResult {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: Some(1),
            timed_out,
        }
    }

    #[test]
    fn idle_and_total_timeouts_are_transient() {
        for t in [TimedOut::Idle, TimedOut::Total] {
            assert_eq!(
                classify_spawn(&spawn_result("", "", Some(t))),
                SpawnErrorClass::Transient
            );
        }
    }

    #[test]
    fn first_byte_is_its_own_class() {
        assert_eq!(
            classify_spawn(&spawn_result("", "", Some(TimedOut::FirstByte))),
            SpawnErrorClass::FirstByteTimeout
        );
    }

    #[test]
    fn stderr_patterns_classify_transient() {
        for msg in [
            "Error: connection reset by peer",
            "HTTP 503 service unavailable",
            "rate limit exceeded, please retry",
            "server overloaded",
        ] {
            assert_eq!(
                classify_spawn(&spawn_result("", msg, None)),
                SpawnErrorClass::Transient,
                "{msg}"
            );
        }
    }

    #[test]
    fn model_access_patterns_classify_unavailable() {
        for msg in [
            "The model claude-x does not exist",
            "you do not have access to this model",
            "please upgrade your plan",
        ] {
            assert_eq!(
                classify_spawn(&spawn_result(msg, "", None)),
                SpawnErrorClass::ModelUnavailable,
                "{msg}"
            );
        }
    }

    #[test]
    fn model_access_beats_transient_text() {
        let r = spawn_result("model does not exist", "got a 503 too", None);
        assert_eq!(classify_spawn(&r), SpawnErrorClass::ModelUnavailable);
    }

    #[test]
    fn plain_failure_is_other() {
        assert_eq!(
            classify_spawn(&spawn_result("", "segfault", None)),
            SpawnErrorClass::Other
        );
    }

    #[test]
    fn context_overflow_detection() {
        assert!(is_context_overflow_message("prompt is too long: 210000 tokens"));
        assert!(is_context_overflow_message("context length exceeded"));
        assert!(!is_context_overflow_message("just a normal error"));
    }
}
