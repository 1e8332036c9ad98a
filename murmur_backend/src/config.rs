use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Tuning knobs for the background simulation. Read-only to the core; the
/// heartbeat re-reads them on every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimSettings {
    #[serde(default)]
    pub enable_background_activity: bool,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_private_wake_probability")]
    pub private_wake_probability: f64,
    #[serde(default = "default_group_wake_probability")]
    pub group_wake_probability: f64,
    #[serde(default = "default_max_agents_per_tick")]
    pub max_agents_per_tick: usize,
    #[serde(default = "default_block_cooldown_hours")]
    pub block_cooldown_hours: f64,
    #[serde(default = "default_summary_trigger_threshold")]
    pub summary_trigger_threshold: u64,
    #[serde(default = "default_max_summaries_per_tick")]
    pub max_summaries_per_tick: usize,
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    #[serde(default = "default_context_message_limit")]
    pub context_message_limit: usize,
    #[serde(default = "default_feed_context_limit")]
    pub feed_context_limit: usize,
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_private_wake_probability() -> f64 {
    0.25
}

fn default_group_wake_probability() -> f64 {
    0.15
}

fn default_max_agents_per_tick() -> usize {
    2
}

fn default_block_cooldown_hours() -> f64 {
    6.0
}

fn default_summary_trigger_threshold() -> u64 {
    25
}

fn default_max_summaries_per_tick() -> usize {
    1
}

fn default_generation_timeout_secs() -> u64 {
    180
}

fn default_context_message_limit() -> usize {
    20
}

fn default_feed_context_limit() -> usize {
    8
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            enable_background_activity: false,
            tick_interval_secs: default_tick_interval_secs(),
            private_wake_probability: default_private_wake_probability(),
            group_wake_probability: default_group_wake_probability(),
            max_agents_per_tick: default_max_agents_per_tick(),
            block_cooldown_hours: default_block_cooldown_hours(),
            summary_trigger_threshold: default_summary_trigger_threshold(),
            max_summaries_per_tick: default_max_summaries_per_tick(),
            generation_timeout_secs: default_generation_timeout_secs(),
            context_message_limit: default_context_message_limit(),
            feed_context_limit: default_feed_context_limit(),
        }
    }
}

impl SimSettings {
    pub fn cooldown_millis(&self) -> i64 {
        (self.block_cooldown_hours.max(0.0) * 3_600_000.0) as i64
    }

    /// Clamp values a hand-edited config file could get wrong.
    pub fn sanitized(mut self) -> Self {
        self.tick_interval_secs = self.tick_interval_secs.max(1);
        self.private_wake_probability = clamp_probability(self.private_wake_probability);
        self.group_wake_probability = clamp_probability(self.group_wake_probability);
        self.summary_trigger_threshold = self.summary_trigger_threshold.max(1);
        self.generation_timeout_secs = self.generation_timeout_secs.max(1);
        self.context_message_limit = self.context_message_limit.max(1);
        self
    }
}

fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub llm_temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub llm_max_tokens: u32,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default)]
    pub simulation: SimSettings,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f32 {
    0.8
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_database_path() -> String {
    "murmur.db".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_temperature: default_temperature(),
            llm_max_tokens: default_max_tokens(),
            database_path: default_database_path(),
            simulation: SimSettings::default(),
        }
    }
}

impl BackendConfig {
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to murmur_config.toml next to the executable
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("murmur_config.toml")
    }

    /// Load config from murmur_config.toml, falling back to env vars.
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Ok(Some(config)) => {
                tracing::info!("Loaded config from {:?}", path);
                return config;
            }
            Ok(None) => {}
            Err(e) => tracing::error!("Failed to parse {:?}: {:#}", path, e),
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        let Ok(contents) = fs::read_to_string(path) else {
            return Ok(None);
        };
        let mut config =
            toml::from_str::<BackendConfig>(&contents).context("Invalid config TOML")?;
        config.simulation = config.simulation.sanitized();
        Ok(Some(config))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("MURMUR_LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("MURMUR_LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("MURMUR_LLM_API_KEY") {
            if !key.trim().is_empty() {
                config.llm_api_key = Some(key);
            }
        }

        if let Ok(path) = env::var("MURMUR_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(enabled) = env::var("MURMUR_ENABLE_BACKGROUND") {
            config.simulation.enable_background_activity = parse_flag(&enabled);
        }

        if let Ok(interval) = env::var("MURMUR_TICK_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse() {
                config.simulation.tick_interval_secs = seconds;
            }
        }

        config.simulation = config.simulation.sanitized();
        config
    }
}

fn parse_flag(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}
