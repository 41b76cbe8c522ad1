/// Characters per token for the estimation heuristic. Chat text averages a
/// little above 3 chars/token across the models we target.
const CHARS_PER_TOKEN: f64 = 3.3;

/// Cheap token estimate for budget decisions. Never used for billing.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() as f64 / CHARS_PER_TOKEN).ceil() as usize
}

/// Truncate `text` so its estimate fits `max_tokens`, cutting on a char
/// boundary. Returns the input unchanged when already within budget.
pub fn clamp_to_tokens(text: &str, max_tokens: usize) -> String {
    if estimate_tokens(text) <= max_tokens {
        return text.to_string();
    }
    let max_chars = (max_tokens as f64 * CHARS_PER_TOKEN) as usize;
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn estimate_rounds_up() {
        // 4 chars / 3.3 = 1.21 → 2 tokens
        assert_eq!(estimate_tokens("abcd"), 2);
    }

    #[test]
    fn clamp_respects_budget() {
        let long = "x".repeat(1000);
        let clamped = clamp_to_tokens(&long, 10);
        assert!(estimate_tokens(&clamped) <= 10);
        assert!(clamped.len() < long.len());
    }

    #[test]
    fn clamp_is_noop_under_budget() {
        assert_eq!(clamp_to_tokens("short", 100), "short");
    }
}
