//! Tool subsystem: definitions, registry, tier/effect gating, and the
//! bounded executor the backends call into.
//!
//! Tiers and effects gate which tools a turn can see. The tier check is a
//! policy decision; the real security boundaries live inside the tools
//! themselves (SSRF checks in `read_url`, size caps in `transcribe_audio`).

pub mod exec;
pub mod read_url;
pub mod remind;
pub mod scratchpad;
pub mod skills;
pub mod transcribe;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use homie_core::config::ToolsConfig;
use homie_core::error::{HomieError, Result};
use homie_core::types::ChatId;
use homie_sessions::SessionStore;

use crate::backend::ToolSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolTier {
    Safe,
    Restricted,
    Dangerous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolEffect {
    Network,
    Filesystem,
    Subprocess,
}

/// Ephemeral per-turn context handed to tool executions. Tools must not
/// retain references after returning.
#[derive(Clone)]
pub struct ToolContext {
    pub chat_id: ChatId,
    pub is_operator: bool,
    pub is_group: bool,
    pub cancel: CancellationToken,
    pub sessions: Arc<SessionStore>,
    pub scheduler: Arc<homie_scheduler::EventScheduler>,
}

/// Trait all tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn tier(&self) -> ToolTier {
        ToolTier::Safe
    }
    fn effects(&self) -> &[ToolEffect] {
        &[]
    }
    /// Extra prompt guidance appended after the description, if any.
    fn guidance(&self) -> Option<&str> {
        None
    }
    /// JSON Schema for the tool input.
    fn input_schema(&self) -> serde_json::Value;
    /// Per-call timeout override in milliseconds.
    fn timeout_ms(&self) -> Option<u64> {
        None
    }
    /// Execute with already-validated context. Implementations parse their
    /// own typed input and surface mismatches as `SchemaValidation`.
    async fn execute(&self, ctx: &ToolContext, input: serde_json::Value) -> Result<String>;
}

/// Parse a tool's typed arguments, converting serde errors into the
/// schema-mismatch error the model is shown.
pub fn parse_args<T: serde::de::DeserializeOwned>(
    tool_name: &str,
    input: serde_json::Value,
) -> Result<T> {
    serde_json::from_value(input)
        .map_err(|e| HomieError::SchemaValidation(format!("{tool_name}: {e}")))
}

/// All known tools, loaded once at startup. Names are unique across sources.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        if self.tools.iter().any(|t| t.name() == tool.name()) {
            return Err(HomieError::Config(format!(
                "duplicate tool name: {}",
                tool.name()
            )));
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn all(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    /// Select the tool surface for one turn.
    ///
    /// Safe tools always ship. Restricted and dangerous tiers require an
    /// operator plus explicit config. Non-operators additionally lose any
    /// tool that touches the filesystem or spawns subprocesses.
    pub fn select_for_turn(&self, is_operator: bool, cfg: &ToolsConfig) -> Vec<Arc<dyn Tool>> {
        let restricted_allow: HashSet<&str> =
            cfg.restricted.allowlist.iter().map(String::as_str).collect();
        let dangerous_allow: HashSet<&str> =
            cfg.dangerous.allowlist.iter().map(String::as_str).collect();

        self.tools
            .iter()
            .filter(|tool| match tool.tier() {
                ToolTier::Safe => true,
                ToolTier::Restricted => {
                    is_operator
                        && cfg.restricted.enabled_for_operator
                        && (restricted_allow.is_empty() || restricted_allow.contains(tool.name()))
                }
                ToolTier::Dangerous => {
                    is_operator
                        && cfg.dangerous.enabled_for_operator
                        && (cfg.dangerous.allow_all || dangerous_allow.contains(tool.name()))
                }
            })
            .filter(|tool| {
                is_operator
                    || !tool
                        .effects()
                        .iter()
                        .any(|e| matches!(e, ToolEffect::Filesystem | ToolEffect::Subprocess))
            })
            .cloned()
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert selected tools to the backend wire format.
pub fn to_specs(tools: &[Arc<dyn Tool>]) -> Vec<ToolSpec> {
    tools
        .iter()
        .map(|t| {
            let description = match t.guidance() {
                Some(g) => format!("{}\n\n{}", t.description(), g),
                None => t.description().to_string(),
            };
            ToolSpec {
                name: t.name().to_string(),
                description,
                input_schema: t.input_schema(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use homie_core::config::{DangerousToolsConfig, RestrictedToolsConfig};

    struct FakeTool {
        name: &'static str,
        tier: ToolTier,
        effects: Vec<ToolEffect>,
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "fake"
        }
        fn tier(&self) -> ToolTier {
            self.tier
        }
        fn effects(&self) -> &[ToolEffect] {
            &self.effects
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _ctx: &ToolContext, _input: serde_json::Value) -> Result<String> {
            Ok("ok".into())
        }
    }

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        r.register(Arc::new(FakeTool {
            name: "safe_plain",
            tier: ToolTier::Safe,
            effects: vec![],
        }))
        .unwrap();
        r.register(Arc::new(FakeTool {
            name: "safe_subprocess",
            tier: ToolTier::Safe,
            effects: vec![ToolEffect::Subprocess],
        }))
        .unwrap();
        r.register(Arc::new(FakeTool {
            name: "restricted_one",
            tier: ToolTier::Restricted,
            effects: vec![],
        }))
        .unwrap();
        r.register(Arc::new(FakeTool {
            name: "dangerous_one",
            tier: ToolTier::Dangerous,
            effects: vec![],
        }))
        .unwrap();
        r
    }

    fn names(tools: &[Arc<dyn Tool>]) -> Vec<&str> {
        tools.iter().map(|t| t.name()).collect()
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut r = registry();
        let err = r.register(Arc::new(FakeTool {
            name: "safe_plain",
            tier: ToolTier::Safe,
            effects: vec![],
        }));
        assert!(err.is_err());
    }

    #[test]
    fn non_operator_gets_safe_without_side_effects() {
        let r = registry();
        let cfg = ToolsConfig::default();
        let picked = r.select_for_turn(false, &cfg);
        let selected = names(&picked);
        assert_eq!(selected, vec!["safe_plain"]);
    }

    #[test]
    fn operator_keeps_subprocess_safe_tools() {
        let r = registry();
        let cfg = ToolsConfig::default();
        let picked = r.select_for_turn(true, &cfg);
        let selected = names(&picked);
        assert!(selected.contains(&"safe_subprocess"));
        assert!(!selected.contains(&"restricted_one"));
    }

    #[test]
    fn restricted_requires_config_and_allowlist() {
        let r = registry();
        let mut cfg = ToolsConfig {
            restricted: RestrictedToolsConfig {
                enabled_for_operator: true,
                allowlist: vec![],
            },
            ..Default::default()
        };
        assert!(names(&r.select_for_turn(true, &cfg)).contains(&"restricted_one"));

        cfg.restricted.allowlist = vec!["other_tool".into()];
        assert!(!names(&r.select_for_turn(true, &cfg)).contains(&"restricted_one"));
    }

    #[test]
    fn dangerous_requires_allow_all_or_allowlist() {
        let r = registry();
        let mut cfg = ToolsConfig {
            dangerous: DangerousToolsConfig {
                enabled_for_operator: true,
                allow_all: false,
                allowlist: vec![],
            },
            ..Default::default()
        };
        assert!(!names(&r.select_for_turn(true, &cfg)).contains(&"dangerous_one"));

        cfg.dangerous.allow_all = true;
        assert!(names(&r.select_for_turn(true, &cfg)).contains(&"dangerous_one"));

        cfg.dangerous.allow_all = false;
        cfg.dangerous.allowlist = vec!["dangerous_one".into()];
        assert!(names(&r.select_for_turn(true, &cfg)).contains(&"dangerous_one"));
    }
}
