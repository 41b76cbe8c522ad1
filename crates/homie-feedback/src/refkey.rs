use sha2::{Digest, Sha256};

/// Deterministic opaque key for an outgoing message, derived from the
/// channel, chat id, and transport-native message id. Used to correlate
/// reactions and replies that arrive out of order across transports.
pub fn derive_ref_key(channel: &str, chat_id: &str, native_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(channel.as_bytes());
    hasher.update([0x1f]);
    hasher.update(chat_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(native_id.as_bytes());
    hex::encode(hasher.finalize())[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(
            derive_ref_key("cli", "cli:local", "cli:1"),
            derive_ref_key("cli", "cli:local", "cli:1")
        );
    }

    #[test]
    fn distinct_inputs_distinct_keys() {
        let a = derive_ref_key("cli", "cli:local", "cli:1");
        let b = derive_ref_key("cli", "cli:local", "cli:2");
        let c = derive_ref_key("signal", "cli:local", "cli:1");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn separator_prevents_gluing() {
        // ("ab","c") vs ("a","bc") must not collide.
        assert_ne!(
            derive_ref_key("ab", "c", "x"),
            derive_ref_key("a", "bc", "x")
        );
    }
}
