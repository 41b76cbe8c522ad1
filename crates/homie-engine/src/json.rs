//! Tolerant JSON extraction for model output.

/// Pull the first JSON object out of `text`. Accepts raw JSON, a fenced
/// ```` ```json ```` block, or an object embedded in prose: fast models
/// love adding preamble around their JSON.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();

    // Fenced block first: ```json\n{...}\n```
    if let Some(fence_start) = trimmed.find("```") {
        let after = &trimmed[fence_start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        if let Some(fence_end) = after[body_start..].find("```") {
            let body = &after[body_start..body_start + fence_end];
            if let Some(v) = parse_object(body) {
                return Some(v);
            }
        }
    }

    parse_object(trimmed)
}

fn parse_object(s: &str) -> Option<serde_json::Value> {
    let s = s.trim();
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(s) {
        if v.is_object() {
            return Some(v);
        }
    }
    // Embedded object: take the widest {...} span.
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(&s[start..=end])
        .ok()
        .filter(|v| v.is_object())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_object() {
        let v = extract_json_object(r#"{"done":true}"#).unwrap();
        assert_eq!(v["done"], true);
    }

    #[test]
    fn fenced_with_preamble() {
        let text = "Here you go:\n```json\n{\"done\":true}\n```";
        let v = extract_json_object(text).unwrap();
        assert_eq!(v["done"], true);
    }

    #[test]
    fn embedded_in_prose() {
        let text = "Sure! The answer is {\"action\": \"react\", \"emoji\": \"🔥\"} hope that helps";
        let v = extract_json_object(text).unwrap();
        assert_eq!(v["action"], "react");
    }

    #[test]
    fn garbage_is_none() {
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("[1,2,3]").is_none());
    }
}
