//! Slop detection: the output filter that keeps the bot sounding like a
//! person. Regex categories over the draft text; any hit fails the draft.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlopViolation {
    pub category: &'static str,
}

#[derive(Debug, Clone)]
pub struct SlopReport {
    pub is_slop: bool,
    pub violations: Vec<SlopViolation>,
}

struct SlopPattern {
    category: &'static str,
    regex: Lazy<Regex>,
}

macro_rules! slop_pattern {
    ($category:literal, $pattern:literal) => {
        SlopPattern {
            category: $category,
            regex: Lazy::new(|| Regex::new($pattern).unwrap()),
        }
    };
}

static PATTERNS: Lazy<Vec<SlopPattern>> = Lazy::new(|| vec![
    slop_pattern!(
        "ai_vocabulary",
        r"(?i)\b(delve|delving|nuanced?|multifaceted|tapestry|leverag(e|ing)|utiliz(e|ing)|fostering|holistic|synerg)\b"
    ),
    slop_pattern!(
        "assistant_speak",
        r"(?i)\b(as an ai|as a language model|i'?m here to help|how can i (help|assist)|let me help you with that|i cannot and will not)\b"
    ),
    slop_pattern!(
        "stock_phrases",
        r"(?i)\b(it'?s (important|worth) (to note|noting)|at the end of the day,|in today'?s (fast-paced|digital) world|navigating the complexities)\b"
    ),
    slop_pattern!(
        "forced_enthusiasm",
        r"(?i)(^|\b)(great question|absolutely!|fantastic!|i'?d be (happy|glad) to|what a great)\b"
    ),
    slop_pattern!(
        "restatement",
        r"(?i)^(so,? (you'?re|what you'?re) (asking|saying)|to (summarize|recap)|in other words,)"
    ),
    slop_pattern!(
        "sign_off",
        r"(?i)\b(let me know if (you|there)|feel free to (reach|ask)|hope (this|that) helps|don'?t hesitate to)\b"
    ),
    slop_pattern!(
        "hedging",
        r"(?i)\b(it'?s worth considering|there are many factors|it depends on (many|various|several) factors)\b"
    ),
    slop_pattern!("list_formatting", r"(?m)^\s*([-*•]|\d+\.)\s+\S"),
]);

/// Scan a draft for slop. Returns every matched category.
pub fn check_slop(text: &str) -> SlopReport {
    let violations: Vec<SlopViolation> = PATTERNS
        .iter()
        .filter(|p| p.regex.is_match(text))
        .map(|p| SlopViolation {
            category: p.category,
        })
        .collect();
    SlopReport {
        is_slop: !violations.is_empty(),
        violations,
    }
}

/// System directive appended before a regeneration attempt.
pub const REGEN_DIRECTIVE: &str = "Rewrite your reply to remove AI slop: no assistant phrasing, \
no forced enthusiasm, no restating the question, no sign-offs, no bullet lists. \
Say it the way a friend would text it.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_passes() {
        let report = check_slop("idk, maybe tacos");
        assert!(!report.is_slop);
        assert!(report.violations.is_empty());
    }

    #[test]
    fn forced_enthusiasm_and_assistant_speak() {
        let report = check_slop("Great question! Let me help you with that.");
        assert!(report.is_slop);
        let cats: Vec<&str> = report.violations.iter().map(|v| v.category).collect();
        assert!(cats.contains(&"forced_enthusiasm"));
        assert!(cats.contains(&"assistant_speak"));
    }

    #[test]
    fn ai_vocabulary_flags() {
        assert!(check_slop("let's delve into the nuanced tapestry of it").is_slop);
        assert!(check_slop("As an AI, I can't say").is_slop);
    }

    #[test]
    fn bullet_lists_flag_in_chat() {
        let report = check_slop("here's the plan:\n- step one\n- step two");
        assert!(report.is_slop);
        assert_eq!(report.violations[0].category, "list_formatting");
    }

    #[test]
    fn sign_offs_flag() {
        assert!(check_slop("anyway, let me know if you need anything else").is_slop);
        assert!(check_slop("Hope this helps!").is_slop);
    }

    #[test]
    fn casual_texting_is_not_slop() {
        for text in [
            "lol no way",
            "yeah i'm down, 8pm?",
            "that movie was mid tbh",
            "ugh monday again",
        ] {
            assert!(!check_slop(text).is_slop, "false positive on: {text}");
        }
    }
}
