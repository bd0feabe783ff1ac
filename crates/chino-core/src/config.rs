//! Runtime configuration for the coordination layer.
//!
//! Precedence: environment (`CHINO__SECTION__KEY`) > TOML file (`CHINO_CONFIG`, else
//! `config/chino.toml`) > built-in defaults. Every section carries `#[serde(default)]`
//! so a partial file only overrides what it names.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

const DEFAULT_CONFIG_PATH: &str = "config/chino.toml";

/// Which language-model collaborator to construct. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmMode {
    /// Scripted in-process model. No network.
    #[default]
    Mock,
    /// OpenAI-compatible server on the local machine (llama.cpp, vLLM, ...).
    Local,
    /// Hosted OpenRouter endpoint. Requires an API key.
    OpenRouter,
}

impl LlmMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmMode::Mock => "mock",
            LlmMode::Local => "local",
            LlmMode::OpenRouter => "openrouter",
        }
    }
}

impl std::str::FromStr for LlmMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(LlmMode::Mock),
            "local" => Ok(LlmMode::Local),
            "openrouter" => Ok(LlmMode::OpenRouter),
            other => Err(CoreError::Config(format!("unknown llm mode: {other}"))),
        }
    }
}

/// Backend for the short-term conversation buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShortTermBackend {
    /// Process-local list store.
    #[default]
    Memory,
    /// Persistent key-ordered store on disk.
    Sled,
}

/// What crossing triggers compression of the short-term buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionTriggerKind {
    #[default]
    Turns,
    Tokens,
}

/// Resolved compression policy. Exactly one trigger is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionPolicy {
    /// Compress once the buffer holds at least this many turns.
    TurnCount(usize),
    /// Compress once the estimated token count reaches this budget.
    TokenBudget(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub mode: LlmMode,
    pub model: String,
    pub openrouter_base_url: String,
    pub local_base_url: String,
    pub local_model: String,
    /// Falls back to `OPENROUTER_API_KEY` when unset.
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    /// Sent as `X-Title` to OpenRouter.
    pub app_title: String,
    /// Sent as `HTTP-Referer` to OpenRouter.
    pub referer: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            mode: LlmMode::Mock,
            model: "meta-llama/llama-3.3-70b-instruct".to_string(),
            openrouter_base_url: "https://openrouter.ai/api/v1".to_string(),
            local_base_url: "http://127.0.0.1:8080/v1".to_string(),
            local_model: "local".to_string(),
            api_key: None,
            timeout_secs: 60,
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 512,
            app_title: "Chino Voice Assistant".to_string(),
            referer: "http://localhost".to_string(),
        }
    }
}

impl LlmConfig {
    /// Configured key, else `OPENROUTER_API_KEY`. Blank values count as missing.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.resolved_api_key_with(|key| std::env::var(key).ok())
    }

    /// `resolved_api_key` reading the environment through `lookup`.
    pub fn resolved_api_key_with<F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |k: String| {
            let k = k.trim().to_string();
            (!k.is_empty()).then_some(k)
        };
        self.api_key
            .clone()
            .and_then(non_blank)
            .or_else(|| lookup("OPENROUTER_API_KEY").and_then(non_blank))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub backend: ShortTermBackend,
    /// Maximum turns retained in the short-term buffer.
    pub capacity: usize,
    pub key_prefix: String,
    pub compression_trigger: CompressionTriggerKind,
    pub compress_threshold: usize,
    pub token_budget: usize,
    /// Model used by the summarizer. Defaults to the dialog model.
    pub summarizer_mode: Option<LlmMode>,
    /// Summaries injected into each prompt.
    pub summary_limit: usize,
    pub min_importance: f32,
    /// SQLite file for summaries. `None` keeps summaries in memory.
    pub summary_db_path: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: ShortTermBackend::Memory,
            capacity: 64,
            key_prefix: "chino:conversation".to_string(),
            compression_trigger: CompressionTriggerKind::Turns,
            compress_threshold: 50,
            token_budget: 8192,
            summarizer_mode: None,
            summary_limit: 3,
            min_importance: 0.0,
            summary_db_path: None,
        }
    }
}

impl MemoryConfig {
    pub fn compression_policy(&self) -> CompressionPolicy {
        match self.compression_trigger {
            CompressionTriggerKind::Turns => CompressionPolicy::TurnCount(self.compress_threshold),
            CompressionTriggerKind::Tokens => CompressionPolicy::TokenBudget(self.token_budget),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogConfig {
    pub idle_timeout_secs: u64,
    pub watchdog_interval_ms: u64,
    pub auto_trigger_enabled: bool,
    /// History turns included in each prompt.
    pub history_limit: usize,
    pub system_prompt: Option<String>,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
            watchdog_interval_ms: 5_000,
            auto_trigger_enabled: true,
            history_limit: 20,
            system_prompt: None,
        }
    }
}

impl DialogConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub lanes: usize,
    /// Complete routed sentences immediately when no synthesis workers consume the lanes.
    pub passthrough: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            lanes: 2,
            passthrough: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub history_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
        }
    }
}

/// Global configuration for the assistant process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    /// Base directory for on-disk stores.
    pub storage_path: String,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub dialog: DialogConfig,
    pub router: RouterConfig,
    pub bus: BusConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            app_name: "Chino".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8000,
            storage_path: "./data".to_string(),
            llm: LlmConfig::default(),
            memory: MemoryConfig::default(),
            dialog: DialogConfig::default(),
            router: RouterConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load config from file and environment, then validate it.
    pub fn load() -> CoreResult<Self> {
        let config_path =
            std::env::var("CHINO_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let builder = config::Config::builder()
            .set_default("app_name", "Chino")?
            .set_default("port", 8000_i64)?
            .set_default("storage_path", "./data")?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("CHINO")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: CoreConfig = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document on top of the defaults.
    pub fn from_toml_str(raw: &str) -> CoreResult<Self> {
        let cfg: CoreConfig =
            toml::from_str(raw).map_err(|e| CoreError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.router.lanes == 0 {
            return Err(CoreError::Config("router.lanes must be at least 1".into()));
        }
        if self.memory.capacity == 0 {
            return Err(CoreError::Config("memory.capacity must be at least 1".into()));
        }
        if self.bus.history_capacity == 0 {
            return Err(CoreError::Config("bus.history_capacity must be at least 1".into()));
        }
        match self.memory.compression_policy() {
            CompressionPolicy::TurnCount(0) | CompressionPolicy::TokenBudget(0) => {
                return Err(CoreError::Config("compression trigger must be positive".into()));
            }
            CompressionPolicy::TurnCount(n) if n > self.memory.capacity => {
                return Err(CoreError::Config(format!(
                    "memory.compress_threshold ({n}) exceeds memory.capacity ({}); compression would never run",
                    self.memory.capacity
                )));
            }
            _ => {}
        }
        Ok(())
    }

    /// `{storage_path}/chino_short_term` for the sled backend.
    pub fn short_term_path(&self) -> PathBuf {
        PathBuf::from(&self.storage_path).join("chino_short_term")
    }

    /// Explicit summary DB path, else `{storage_path}/chino_memory/summaries.sqlite`.
    pub fn summary_db_path(&self) -> PathBuf {
        match &self.memory.summary_db_path {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from(&self.storage_path)
                .join("chino_memory")
                .join("summaries.sqlite"),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = CoreConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.memory.compression_policy(), CompressionPolicy::TurnCount(50));
        assert_eq!(cfg.router.lanes, 2);
        assert_eq!(cfg.dialog.idle_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_toml_overrides_only_named_keys() {
        let cfg = CoreConfig::from_toml_str(
            r#"
            port = 9001

            [llm]
            mode = "openrouter"

            [memory]
            compression_trigger = "tokens"
            token_budget = 4096
            "#,
        )
        .unwrap();
        assert_eq!(cfg.port, 9001);
        assert_eq!(cfg.llm.mode, LlmMode::OpenRouter);
        assert_eq!(cfg.memory.compression_policy(), CompressionPolicy::TokenBudget(4096));
        assert_eq!(cfg.memory.capacity, 64);
        assert_eq!(cfg.dialog.history_limit, 20);
    }

    #[test]
    fn threshold_above_capacity_is_rejected() {
        let mut cfg = CoreConfig::default();
        cfg.memory.capacity = 20;
        cfg.memory.compress_threshold = 50;
        assert!(matches!(cfg.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn zero_lanes_is_rejected() {
        let mut cfg = CoreConfig::default();
        cfg.router.lanes = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn llm_mode_parses_case_insensitively() {
        assert_eq!("OpenRouter".parse::<LlmMode>().unwrap(), LlmMode::OpenRouter);
        assert_eq!("local".parse::<LlmMode>().unwrap(), LlmMode::Local);
        assert!("gpt".parse::<LlmMode>().is_err());
    }
}
