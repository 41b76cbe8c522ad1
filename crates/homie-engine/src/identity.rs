//! Identity package loading.
//!
//! The identity directory is operator-authored and read-only at runtime:
//! SOUL.md, STYLE.md, USER.md, first-meeting.md, personality.json, and an
//! optional BEHAVIOR.md override. Every resolved path must stay inside the
//! identity directory; a symlink pointing elsewhere is rejected.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use homie_core::budget::clamp_to_tokens;
use homie_core::error::{HomieError, Result};

/// Per-file size cap (characters).
const MAX_FILE_CHARS: usize = 20_000;

#[derive(Debug, Clone, Default)]
pub struct IdentityPackage {
    pub soul: Option<String>,
    pub style: Option<String>,
    pub user: Option<String>,
    pub first_meeting: Option<String>,
    pub personality: Option<serde_json::Value>,
    pub behavior_override: Option<String>,
}

impl IdentityPackage {
    /// Compose the identity prompt under a token budget. Sections land in a
    /// fixed order so the cache-friendly prefix stays stable.
    pub fn compose_prompt(&self, max_tokens: usize) -> String {
        let mut sections: Vec<String> = Vec::new();
        if let Some(soul) = &self.soul {
            sections.push(soul.clone());
        }
        if let Some(style) = &self.style {
            sections.push(format!("## Style\n{style}"));
        }
        if let Some(user) = &self.user {
            sections.push(format!("## About the operator\n{user}"));
        }
        if let Some(personality) = &self.personality {
            if let Some(traits) = personality.get("traits").and_then(|t| t.as_array()) {
                let list: Vec<&str> = traits.iter().filter_map(|t| t.as_str()).collect();
                if !list.is_empty() {
                    sections.push(format!("## Personality\n{}", list.join(", ")));
                }
            }
        }
        if let Some(first) = &self.first_meeting {
            sections.push(format!("## Meeting someone new\n{first}"));
        }
        clamp_to_tokens(&sections.join("\n\n"), max_tokens)
    }
}

/// Load the identity package from `dir`. Missing files are fine; files that
/// escape the directory are not.
pub fn load_identity(dir: &Path) -> Result<IdentityPackage> {
    let canonical_dir = dir
        .canonicalize()
        .map_err(|e| HomieError::Config(format!("identity dir unreadable: {e}")))?;

    let read = |name: &str| -> Result<Option<String>> {
        read_contained(&canonical_dir, name)
    };

    let personality = match read("personality.json")? {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "personality.json is not valid JSON; ignoring");
                None
            }
        },
        None => None,
    };

    Ok(IdentityPackage {
        soul: read("SOUL.md")?,
        style: read("STYLE.md")?,
        user: read("USER.md")?,
        first_meeting: read("first-meeting.md")?,
        personality,
        behavior_override: read("BEHAVIOR.md")?,
    })
}

fn read_contained(canonical_dir: &Path, name: &str) -> Result<Option<String>> {
    let path: PathBuf = canonical_dir.join(name);
    if !path.exists() {
        return Ok(None);
    }

    let resolved = path
        .canonicalize()
        .map_err(|e| HomieError::Config(format!("identity file {name} unreadable: {e}")))?;
    if !resolved.starts_with(canonical_dir) {
        return Err(HomieError::PolicyDenied(format!(
            "identity file {name} resolves outside the identity directory"
        )));
    }

    let content = std::fs::read_to_string(&resolved)
        .map_err(|e| HomieError::Config(format!("identity file {name} unreadable: {e}")))?;
    debug!(file = name, chars = content.len(), "identity file loaded");
    if content.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(if content.len() > MAX_FILE_CHARS {
        content.chars().take(MAX_FILE_CHARS).collect()
    } else {
        content
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_present_files_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SOUL.md"), "be a good friend").unwrap();
        std::fs::write(dir.path().join("STYLE.md"), "lowercase, short").unwrap();

        let pkg = load_identity(dir.path()).unwrap();
        assert_eq!(pkg.soul.as_deref(), Some("be a good friend"));
        assert!(pkg.user.is_none());
        assert!(pkg.behavior_override.is_none());
    }

    #[test]
    fn personality_json_parsed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("personality.json"),
            r#"{"traits": ["dry", "curious"]}"#,
        )
        .unwrap();

        let pkg = load_identity(dir.path()).unwrap();
        let prompt = pkg.compose_prompt(1_600);
        assert!(prompt.contains("dry, curious"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_outside_dir_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.md");
        std::fs::write(&secret, "hidden").unwrap();
        std::os::unix::fs::symlink(&secret, dir.path().join("SOUL.md")).unwrap();

        let err = load_identity(dir.path()).unwrap_err();
        assert!(matches!(err, HomieError::PolicyDenied(_)));
    }

    #[test]
    fn prompt_respects_token_budget() {
        let pkg = IdentityPackage {
            soul: Some("x".repeat(50_000)),
            ..Default::default()
        };
        let prompt = pkg.compose_prompt(100);
        assert!(homie_core::budget::estimate_tokens(&prompt) <= 100);
    }
}
