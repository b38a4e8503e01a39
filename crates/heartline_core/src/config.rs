use crate::relationship::{default_thresholds, StageTable, StageThreshold};
use crate::scenario::{builtin_rules, ScenarioRule, ScenarioTrigger, SuppressionScope};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HeartlineConfig {
    pub llm: LlmConfig,
    pub dialogue: DialogueConfig,
    pub session: SessionConfig,
    pub relationship: RelationshipConfig,
    pub scenario: ScenarioConfig,
    pub gateway: GatewayConfig,
    pub storage: StorageConfig,
}

impl HeartlineConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    /// After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: HeartlineConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Try to load from path; if the file is missing or invalid, return
    /// defaults with env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({:#}), using defaults", e);
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg
            }
        }
    }

    /// Apply environment variable overrides on top of file-based config.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LLM_PROVIDER") {
            self.llm.provider = v;
        }
        if let Ok(v) = std::env::var("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("LLM_BASE_URL") {
            self.llm.base_url = Some(v);
        }
        if let Ok(v) = std::env::var("LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("LLM_MAX_TOKENS") {
            if let Ok(n) = v.parse() {
                self.llm.max_tokens = n;
            }
        }
        if let Ok(v) = std::env::var("LLM_TEMPERATURE") {
            if let Ok(n) = v.parse() {
                self.llm.temperature = n;
            }
        }
        if let Ok(v) = std::env::var("HEARTLINE_DB") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HEARTLINE_BIND") {
            match v.rsplit_once(':') {
                Some((host, port)) => match port.parse() {
                    Ok(port) => {
                        self.gateway.host = host.to_string();
                        self.gateway.port = port;
                    }
                    Err(_) => tracing::warn!("Ignoring HEARTLINE_BIND with bad port: {}", v),
                },
                None => tracing::warn!("Ignoring HEARTLINE_BIND without port: {}", v),
            }
        }
    }

    /// Cross-field checks that serde alone cannot express.
    pub fn validate(&self) -> Result<()> {
        self.relationship.stage_table()?;
        anyhow::ensure!(self.dialogue.max_choices > 0, "dialogue.max_choices must be at least 1");
        anyhow::ensure!(self.dialogue.max_attempts > 0, "dialogue.max_attempts must be at least 1");
        anyhow::ensure!(self.session.summary_interval > 0, "session.summary_interval must be at least 1");
        Ok(())
    }
}

// ============================================================================
// Sub-configs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// "openai" (any OpenAI-compatible endpoint) or "mock".
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            max_tokens: 600,
            temperature: 0.85,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Per-turn affection delta bound, applied symmetrically.
    pub max_affection_delta: i32,
    /// Per-turn trust and intimacy delta bound.
    pub max_trust_delta: i32,
    pub max_choices: usize,
    /// Raw messages included in the prompt after the summary.
    pub recent_messages: usize,
    /// LLM attempts per turn before the filler is used.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub attempt_timeout_ms: u64,
    /// Whole-generation budget; exceeding it takes the degraded path.
    pub turn_budget_ms: u64,
    pub tease_chars: usize,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            max_affection_delta: 10,
            max_trust_delta: 5,
            max_choices: 4,
            recent_messages: 12,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 4_000,
            attempt_timeout_ms: 20_000,
            turn_budget_ms: 45_000,
            tease_chars: 40,
        }
    }
}

impl DialogueConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn turn_budget(&self) -> Duration {
        Duration::from_millis(self.turn_budget_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Resummarize every N unsummarized messages.
    pub summary_interval: u64,
    /// ...or when the unsummarized window exceeds this many characters.
    pub summary_char_budget: usize,
    /// Newest messages always kept raw, never folded into the summary.
    pub keep_recent: usize,
    /// Script served to brand-new sessions; `None` starts in freeform chat.
    pub onboarding_script: Option<String>,
    /// Attempts for a turn commit that loses the session version race.
    pub commit_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            summary_interval: 20,
            summary_char_budget: 6_000,
            keep_recent: 10,
            onboarding_script: Some("onboarding".to_string()),
            commit_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelationshipConfig {
    pub thresholds: Vec<StageThreshold>,
    /// Compare-and-swap attempts for a relationship write.
    pub cas_retries: u32,
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        Self {
            thresholds: default_thresholds(),
            cas_retries: 5,
        }
    }
}

impl RelationshipConfig {
    pub fn stage_table(&self) -> Result<StageTable> {
        StageTable::new(self.thresholds.clone()).context("Invalid relationship.thresholds")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub enabled: bool,
    pub suppression_scope: SuppressionScope,
    /// Extra rules, usually `custom` scenarios.
    pub custom_rules: Vec<ScenarioRule>,
    /// Use only `custom_rules` and drop the built-in set.
    pub replace_builtin: bool,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            suppression_scope: SuppressionScope::Session,
            custom_rules: Vec::new(),
            replace_builtin: false,
        }
    }
}

impl ScenarioConfig {
    pub fn build_trigger(&self) -> ScenarioTrigger {
        let mut rules = if self.replace_builtin || !self.enabled {
            Vec::new()
        } else {
            builtin_rules()
        };
        if self.enabled {
            rules.extend(self.custom_rules.iter().cloned());
        }
        ScenarioTrigger::new(rules, self.suppression_scope)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub persona_dir: PathBuf,
    pub scripts_dir: PathBuf,
    pub timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/heartline.db"),
            persona_dir: PathBuf::from("personas"),
            scripts_dir: PathBuf::from("scripts"),
            timeout_ms: 5_000,
        }
    }
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relationship::RelationshipStage;
    use crate::scenario::ScenarioType;

    #[test]
    fn test_default_config() {
        let cfg = HeartlineConfig::default();
        assert_eq!(cfg.llm.provider, "openai");
        assert_eq!(cfg.dialogue.max_affection_delta, 10);
        assert_eq!(cfg.dialogue.max_choices, 4);
        assert_eq!(cfg.scenario.suppression_scope, SuppressionScope::Session);
        assert_eq!(cfg.session.onboarding_script.as_deref(), Some("onboarding"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
[llm]
provider = "mock"
"#;
        let cfg: HeartlineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.llm.provider, "mock");
        // Defaults for unspecified fields
        assert_eq!(cfg.llm.max_tokens, 600);
        assert_eq!(cfg.gateway.port, 8787);
        assert_eq!(cfg.relationship.thresholds.len(), 4);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[llm]
provider = "openai"
model = "openrouter/some-model"
base_url = "https://openrouter.ai/api/v1"
max_tokens = 400
temperature = 0.6

[dialogue]
max_affection_delta = 5
max_choices = 3
max_attempts = 2

[session]
summary_interval = 10
onboarding_script = "rainy_day"

[relationship]
cas_retries = 8
thresholds = [
    { stage = "acquaintance", min_score = 5.0, min_messages = 2 },
    { stage = "close", min_score = 25.0, min_messages = 10 },
]

[scenario]
suppression_scope = "relationship"
replace_builtin = true
custom_rules = [
    { scenario_type = "custom", keywords = ["anniversary"], context = "One year together" },
]

[gateway]
host = "0.0.0.0"
port = 9000

[storage]
db_path = "/var/lib/heartline/db.sqlite"
"#;
        let cfg: HeartlineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.llm.max_tokens, 400);
        assert_eq!(cfg.dialogue.max_affection_delta, 5);
        assert_eq!(cfg.session.onboarding_script.as_deref(), Some("rainy_day"));
        assert_eq!(cfg.relationship.cas_retries, 8);
        assert_eq!(cfg.relationship.thresholds[1].stage, RelationshipStage::Friend);
        assert_eq!(cfg.gateway.bind_addr(), "0.0.0.0:9000");
        assert!(cfg.validate().is_ok());

        let trigger = cfg.scenario.build_trigger();
        assert_eq!(trigger.scope(), SuppressionScope::Relationship);
        assert_eq!(trigger.rules().len(), 1);
        assert_eq!(trigger.rules()[0].scenario_type, ScenarioType::Custom);
    }

    #[test]
    fn test_custom_rules_extend_builtin() {
        let mut cfg = ScenarioConfig::default();
        cfg.custom_rules.push(ScenarioRule::default());
        assert_eq!(cfg.build_trigger().rules().len(), builtin_rules().len() + 1);
    }

    #[test]
    fn test_disabled_scenarios_have_no_rules() {
        let cfg = ScenarioConfig {
            enabled: false,
            custom_rules: vec![ScenarioRule::default()],
            ..ScenarioConfig::default()
        };
        assert!(cfg.build_trigger().rules().is_empty());
    }

    #[test]
    fn test_invalid_thresholds_fail_validation() {
        let toml_str = r#"
[relationship]
thresholds = [
    { stage = "friend", min_score = 30.0, min_messages = 15 },
    { stage = "intimate", min_score = 20.0, min_messages = 40 },
]
"#;
        let cfg: HeartlineConfig = toml::from_str(toml_str).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("heartline.toml");
        std::fs::write(&path, "[dialogue]\nmax_choices = 0\n").unwrap();
        assert!(HeartlineConfig::load(&path).is_err());
    }

    #[test]
    fn test_env_overrides_and_defaults() {
        // Part 1: env overrides
        std::env::set_var("LLM_MODEL", "gpt-4o");
        std::env::set_var("HEARTLINE_BIND", "0.0.0.0:7000");

        let mut cfg = HeartlineConfig::default();
        cfg.apply_env_overrides();

        assert_eq!(cfg.llm.model, "gpt-4o");
        assert_eq!(cfg.gateway.host, "0.0.0.0");
        assert_eq!(cfg.gateway.port, 7000);

        std::env::remove_var("LLM_MODEL");
        std::env::remove_var("HEARTLINE_BIND");

        // Part 2: nonexistent path returns defaults (no env interference)
        let cfg = HeartlineConfig::load_or_default("/nonexistent/heartline.toml");
        assert_eq!(cfg.llm.model, "gpt-4o-mini");
    }
}
