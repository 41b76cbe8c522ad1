//! Usage accounting: normalize provider-specific usage payloads and scan
//! for payment transaction hashes in metered-provider responses.

use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub reasoning_tokens: u32,
    pub cache_read_tokens: u32,
    pub cost_usd: Option<f64>,
    pub payment_tx_hash: Option<String>,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cost_usd = match (self.cost_usd, other.cost_usd) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
        if self.payment_tx_hash.is_none() {
            self.payment_tx_hash = other.payment_tx_hash.clone();
        }
    }
}

/// Extract token counts and cost from a raw usage object, tolerating both
/// Anthropic (`input_tokens`) and OpenAI (`prompt_tokens`) field names.
pub fn normalize_usage(raw: &serde_json::Value) -> Usage {
    let read = |keys: &[&str]| -> u32 {
        keys.iter()
            .filter_map(|k| raw.pointer(&format!("/{}", k.replace('.', "/"))))
            .filter_map(|v| v.as_u64())
            .next()
            .unwrap_or(0) as u32
    };

    Usage {
        input_tokens: read(&["input_tokens", "prompt_tokens"]),
        output_tokens: read(&["output_tokens", "completion_tokens"]),
        reasoning_tokens: read(&[
            "reasoning_tokens",
            "completion_tokens_details.reasoning_tokens",
        ]),
        cache_read_tokens: read(&[
            "cache_read_input_tokens",
            "prompt_tokens_details.cached_tokens",
        ]),
        cost_usd: ["cost_usd", "total_cost_usd", "cost"]
            .iter()
            .filter_map(|k| raw.get(*k))
            .filter_map(|v| v.as_f64())
            .next(),
        payment_tx_hash: scan_tx_hash(raw, 0),
    }
}

static TX_HASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"0x[0-9a-fA-F]{64}").unwrap());

const MAX_SCAN_DEPTH: usize = 5;

/// Best-effort scan for a 0x…64-hex transaction hash anywhere in a payload,
/// descending into base64-encoded strings (which may themselves contain
/// JSON) up to a bounded depth.
pub fn scan_tx_hash(value: &serde_json::Value, depth: usize) -> Option<String> {
    if depth > MAX_SCAN_DEPTH {
        return None;
    }
    match value {
        serde_json::Value::String(s) => scan_str(s, depth),
        serde_json::Value::Array(items) => {
            items.iter().find_map(|v| scan_tx_hash(v, depth + 1))
        }
        serde_json::Value::Object(map) => {
            map.values().find_map(|v| scan_tx_hash(v, depth + 1))
        }
        _ => None,
    }
}

fn scan_str(s: &str, depth: usize) -> Option<String> {
    if let Some(m) = TX_HASH.find(s) {
        return Some(m.as_str().to_string());
    }
    if depth >= MAX_SCAN_DEPTH || s.len() < 16 || s.len() > 65_536 {
        return None;
    }
    // Try base64-nested payloads; skip strings that clearly aren't base64.
    let candidate = s.trim();
    if !candidate
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
    {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(candidate)
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    if let Ok(nested) = serde_json::from_str::<serde_json::Value>(&text) {
        return scan_tx_hash(&nested, depth + 1);
    }
    scan_str(&text, depth + 1)
}
