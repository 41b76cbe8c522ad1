//! Skill tools: operator-authored markdown playbooks loaded once at
//! registry build time. Invoking a skill returns its body for the model to
//! follow; the registry's name uniqueness check rejects collisions with
//! built-ins.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use homie_core::error::Result;

use super::{Tool, ToolContext, ToolTier};

/// Per-skill body cap (characters).
const MAX_SKILL_CHARS: usize = 12_000;

pub struct SkillTool {
    name: String,
    description: String,
    body: String,
}

#[async_trait]
impl Tool for SkillTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn tier(&self) -> ToolTier {
        ToolTier::Safe
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _ctx: &ToolContext, _input: serde_json::Value) -> Result<String> {
        Ok(self.body.clone())
    }
}

/// Load every `*.md` skill from `dir`. The tool name is `skill_<stem>`;
/// the description is the first non-empty line of the file.
pub fn load_skills(dir: &Path) -> Vec<Arc<dyn Tool>> {
    let mut skills: Vec<Arc<dyn Tool>> = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        debug!(dir = %dir.display(), "no skills directory");
        return skills;
    };

    let mut paths: Vec<_> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
        .collect();
    paths.sort();

    for path in paths {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let body = match std::fs::read_to_string(&path) {
            Ok(b) => b,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skill unreadable; skipped");
                continue;
            }
        };
        if body.trim().is_empty() {
            continue;
        }

        let name = format!(
            "skill_{}",
            stem.to_lowercase().replace([' ', '-'], "_")
        );
        let description = body
            .lines()
            .map(|l| l.trim_start_matches('#').trim())
            .find(|l| !l.is_empty())
            .unwrap_or("operator-authored skill")
            .to_string();
        let body = if body.len() > MAX_SKILL_CHARS {
            body.chars().take(MAX_SKILL_CHARS).collect()
        } else {
            body
        };

        debug!(skill = %name, "skill loaded");
        skills.push(Arc::new(SkillTool {
            name,
            description,
            body,
        }));
    }
    skills
}
