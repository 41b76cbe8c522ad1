use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (openhomie.toml + OPENHOMIE_* env overrides).
///
/// Every field carries a serde default, so consumers always see a
/// fully-populated tree after `load`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenhomieConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    #[serde(default)]
    pub proactive: ProactiveConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl OpenhomieConfig {
    /// Load config from a TOML file with OPENHOMIE_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: OpenhomieConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("OPENHOMIE_").split("_"))
            .extract()
            .map_err(|e| crate::error::HomieError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.openhomie/openhomie.toml")
}

// ---------------------------------------------------------------------------
// model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub models: ModelsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    #[default]
    Anthropic,
    OpenaiCompatible,
    Mpp,
    ClaudeCode,
    CodexCli,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Binary name/path for subprocess providers (`claude`, `codex`).
    pub command: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Anthropic,
            api_key: None,
            base_url: None,
            command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_model")]
    pub default: String,
    #[serde(default = "default_fast_model")]
    pub fast: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default: default_model(),
            fast: default_fast_model(),
        }
    }
}

fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_fast_model() -> String {
    "claude-haiku-4-5".to_string()
}

// ---------------------------------------------------------------------------
// engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub per_chat_limiter: PerChatLimiterConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub accumulator: AccumulatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "default_limiter_capacity")]
    pub capacity: f64,
    #[serde(default = "default_limiter_refill")]
    pub refill_per_second: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_limiter_capacity(),
            refill_per_second: default_limiter_refill(),
        }
    }
}

fn default_limiter_capacity() -> f64 {
    10.0
}
fn default_limiter_refill() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerChatLimiterConfig {
    #[serde(default = "default_chat_capacity")]
    pub capacity: f64,
    #[serde(default = "default_chat_refill")]
    pub refill_per_second: f64,
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
}

impl Default for PerChatLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_chat_capacity(),
            refill_per_second: default_chat_refill(),
            stale_after_ms: default_stale_after_ms(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_chat_capacity() -> f64 {
    3.0
}
fn default_chat_refill() -> f64 {
    0.2
}
fn default_stale_after_ms() -> u64 {
    30 * 60 * 1000
}
fn default_sweep_interval() -> u64 {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fetch_limit: default_fetch_limit(),
        }
    }
}

fn default_fetch_limit() -> usize {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens_default: usize,
    #[serde(default = "default_identity_tokens")]
    pub identity_prompt_max_tokens: usize,
    #[serde(default = "default_skills_tokens")]
    pub prompt_skills_max_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens_default: default_max_tokens(),
            identity_prompt_max_tokens: default_identity_tokens(),
            prompt_skills_max_tokens: default_skills_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    12_000
}
fn default_identity_tokens() -> usize {
    1_600
}
fn default_skills_tokens() -> usize {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_reactive_steps")]
    pub reactive_max_steps: usize,
    #[serde(default = "default_proactive_steps")]
    pub proactive_max_steps: usize,
    #[serde(default = "default_max_regens")]
    pub max_regens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            reactive_max_steps: default_reactive_steps(),
            proactive_max_steps: default_proactive_steps(),
            max_regens: default_max_regens(),
        }
    }
}

fn default_reactive_steps() -> usize {
    8
}
fn default_proactive_steps() -> usize {
    4
}
fn default_max_regens() -> usize {
    2
}

/// Burst/debounce settings for the per-chat message accumulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccumulatorConfig {
    #[serde(default = "default_dm_window_ms")]
    pub dm_window_ms: u64,
    #[serde(default = "default_group_window_ms")]
    pub group_window_ms: u64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_continuation_multiplier")]
    pub continuation_multiplier: f64,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            dm_window_ms: default_dm_window_ms(),
            group_window_ms: default_group_window_ms(),
            max_wait_ms: default_max_wait_ms(),
            max_messages: default_max_messages(),
            continuation_multiplier: default_continuation_multiplier(),
        }
    }
}

impl AccumulatorConfig {
    /// All-zero config: every message flushes immediately. Used by the CLI
    /// transport and in tests where debouncing is noise.
    pub const ZERO_DEBOUNCE: AccumulatorConfig = AccumulatorConfig {
        dm_window_ms: 0,
        group_window_ms: 0,
        max_wait_ms: 0,
        max_messages: 0,
        continuation_multiplier: 0.0,
    };
}

fn default_dm_window_ms() -> u64 {
    3_500
}
fn default_group_window_ms() -> u64 {
    8_000
}
fn default_max_wait_ms() -> u64 {
    20_000
}
fn default_max_messages() -> usize {
    8
}
fn default_continuation_multiplier() -> f64 {
    1.8
}

// ---------------------------------------------------------------------------
// behavior
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default)]
    pub sleep: SleepConfig,
    #[serde(default = "default_group_max_chars")]
    pub group_max_chars: usize,
    #[serde(default = "default_dm_max_chars")]
    pub dm_max_chars: usize,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            sleep: SleepConfig::default(),
            group_max_chars: default_group_max_chars(),
            dm_max_chars: default_dm_max_chars(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_group_max_chars() -> usize {
    280
}
fn default_dm_max_chars() -> usize {
    600
}
fn default_min_delay_ms() -> u64 {
    800
}
fn default_max_delay_ms() -> u64 {
    4_000
}
fn default_debounce_ms() -> u64 {
    3_500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepConfig {
    #[serde(default)]
    pub enabled: bool,
    /// IANA timezone name, e.g. "America/New_York".
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Local wall-clock "HH:MM".
    #[serde(default = "default_sleep_start")]
    pub start_local: String,
    #[serde(default = "default_sleep_end")]
    pub end_local: String,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timezone: default_timezone(),
            start_local: default_sleep_start(),
            end_local: default_sleep_end(),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_sleep_start() -> String {
    "23:00".to_string()
}
fn default_sleep_end() -> String {
    "07:00".to_string()
}

// ---------------------------------------------------------------------------
// proactive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub dm: ProactiveCaps,
    #[serde(default)]
    pub group: ProactiveCaps,
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            heartbeat_interval_ms: default_heartbeat_ms(),
            dm: ProactiveCaps::default(),
            group: ProactiveCaps::default(),
        }
    }
}

fn default_heartbeat_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveCaps {
    #[serde(default = "default_daily_cap")]
    pub max_per_day: u32,
}

impl Default for ProactiveCaps {
    fn default() -> Self {
        Self {
            max_per_day: default_daily_cap(),
        }
    }
}

fn default_daily_cap() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_memory_budget")]
    pub context_budget_tokens: usize,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            context_budget_tokens: default_memory_budget(),
            retrieval: RetrievalConfig::default(),
            feedback: FeedbackConfig::default(),
        }
    }
}

fn default_memory_budget() -> usize {
    900
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_fts_weight")]
    pub fts_weight: f64,
    #[serde(default = "default_vec_weight")]
    pub vec_weight: f64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            fts_weight: default_fts_weight(),
            vec_weight: default_vec_weight(),
            recency_weight: default_recency_weight(),
            half_life_days: default_half_life_days(),
        }
    }
}

fn default_rrf_k() -> f64 {
    60.0
}
fn default_fts_weight() -> f64 {
    1.0
}
fn default_vec_weight() -> f64 {
    1.0
}
fn default_recency_weight() -> f64 {
    0.25
}
fn default_half_life_days() -> f64 {
    30.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    #[serde(default = "default_finalize_after_ms")]
    pub finalize_after_ms: i64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            finalize_after_ms: default_finalize_after_ms(),
            success_threshold: default_success_threshold(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

fn default_finalize_after_ms() -> i64 {
    6 * 60 * 60 * 1000
}
fn default_success_threshold() -> f64 {
    0.6
}
fn default_failure_threshold() -> f64 {
    -0.4
}

// ---------------------------------------------------------------------------
// tools
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub restricted: RestrictedToolsConfig,
    #[serde(default)]
    pub dangerous: DangerousToolsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestrictedToolsConfig {
    #[serde(default)]
    pub enabled_for_operator: bool,
    #[serde(default)]
    pub allowlist: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DangerousToolsConfig {
    #[serde(default)]
    pub enabled_for_operator: bool,
    #[serde(default)]
    pub allow_all: bool,
    #[serde(default)]
    pub allowlist: Vec<String>,
}

// ---------------------------------------------------------------------------
// paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_project_dir")]
    pub project_dir: String,
    #[serde(default = "default_identity_dir")]
    pub identity_dir: String,
    #[serde(default = "default_skills_dir")]
    pub skills_dir: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            project_dir: default_project_dir(),
            identity_dir: default_identity_dir(),
            skills_dir: default_skills_dir(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_project_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.openhomie")
}
fn default_identity_dir() -> String {
    format!("{}/identity", default_project_dir())
}
fn default_skills_dir() -> String {
    format!("{}/skills", default_project_dir())
}
fn default_data_dir() -> String {
    format!("{}/data", default_project_dir())
}

fn bool_true() -> bool {
    true
}
