//! Service Configuration
//!
//! Defaults, then an optional YAML file, then environment overrides.
//! API keys are never read from the file, only from the environment
//! variable the provider section names.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::generation::{
    AnthropicProvider, LLMProvider, OllamaProvider, OpenAICompatibleProvider, RefusalDetector,
    DEFAULT_REFUSAL_PHRASES,
};

pub const CONFIG_ENV: &str = "ENDPOINT_EVOLUTION_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    #[serde(alias = "openai-compatible")]
    OpenAI,
    Ollama,
}

impl ProviderKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Some(Self::Anthropic),
            "openai" | "openai-compatible" => Some(Self::OpenAI),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-3-5-haiku-20241022",
            Self::OpenAI => "gpt-4o-mini",
            Self::Ollama => "llama3.2",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Self::Anthropic => crate::generation::provider::ANTHROPIC_API_BASE,
            Self::OpenAI => "https://api.openai.com/v1",
            Self::Ollama => "http://localhost:11434",
        }
    }

    fn default_key_env(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAI => "OPENAI_API_KEY",
            Self::Ollama => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Falls back to a per-provider default.
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Anthropic,
            model: None,
            base_url: None,
            api_key_env: None,
        }
    }
}

impl ProviderConfig {
    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.kind.default_model().to_string())
    }

    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.kind.default_base_url().to_string())
    }

    pub fn api_key_env(&self) -> String {
        self.api_key_env
            .clone()
            .unwrap_or_else(|| self.kind.default_key_env().to_string())
    }

    pub fn build(&self) -> Result<Arc<dyn LLMProvider>> {
        let key_env = self.api_key_env();
        let api_key = if key_env.is_empty() {
            None
        } else {
            std::env::var(&key_env).ok().filter(|k| !k.trim().is_empty())
        };

        Ok(match self.kind {
            ProviderKind::Anthropic => {
                let Some(key) = api_key else {
                    bail!("{} is not set; the Anthropic provider needs an API key", key_env);
                };
                Arc::new(AnthropicProvider::with_base_url(self.base_url(), key))
            }
            ProviderKind::OpenAI => Arc::new(OpenAICompatibleProvider::new(self.base_url(), api_key)),
            ProviderKind::Ollama => Arc::new(OllamaProvider::from_url(&self.base_url())?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub bind_addr: String,
    pub data_file: PathBuf,
    pub capabilities_dir: PathBuf,
    pub evolve_interval_secs: u64,
    pub decay_interval_secs: u64,
    pub execution_timeout_ms: u64,
    pub refusal_phrases: Vec<String>,
    pub log_filter: Option<String>,
    pub log_dir: Option<String>,
    pub provider: ProviderConfig,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            data_file: PathBuf::from("data/endpoints.json"),
            capabilities_dir: PathBuf::from("capabilities"),
            evolve_interval_secs: 30,
            decay_interval_secs: 60,
            execution_timeout_ms: 5000,
            refusal_phrases: DEFAULT_REFUSAL_PHRASES.iter().map(|p| p.to_string()).collect(),
            log_filter: None,
            log_dir: None,
            provider: ProviderConfig::default(),
        }
    }
}

impl EvolutionConfig {
    /// Load `.env`, then the YAML file (explicit path, else
    /// `ENDPOINT_EVOLUTION_CONFIG`), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) => {
                tracing::warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read config at {:?}", path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse config at {:?}", path))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = get("PORT") {
            self.bind_addr = format!("0.0.0.0:{}", port.trim());
        }
        if let Some(bind) = get("ENDPOINT_EVOLUTION_BIND") {
            self.bind_addr = bind;
        }
        if let Some(data) = get("ENDPOINT_EVOLUTION_DATA") {
            self.data_file = PathBuf::from(data);
        }
        if let Some(dir) = get("ENDPOINT_EVOLUTION_CAPABILITIES") {
            self.capabilities_dir = PathBuf::from(dir);
        }
        if let Some(kind) = get("ENDPOINT_EVOLUTION_PROVIDER") {
            match ProviderKind::parse(&kind) {
                Some(kind) => self.provider.kind = kind,
                None => tracing::warn!("Unknown provider '{}', keeping {:?}", kind, self.provider.kind),
            }
        }
        if let Some(model) = get("ENDPOINT_EVOLUTION_MODEL") {
            self.provider.model = Some(model);
        }
        if let Some(url) = get("ENDPOINT_EVOLUTION_BASE_URL") {
            self.provider.base_url = Some(url);
        }
        if let Some(dir) = get("ENDPOINT_EVOLUTION_LOG_DIR") {
            self.log_dir = Some(dir);
        }
    }

    pub fn evolve_interval(&self) -> Duration {
        Duration::from_secs(self.evolve_interval_secs.max(1))
    }

    pub fn decay_interval(&self) -> Duration {
        Duration::from_secs(self.decay_interval_secs.max(1))
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms.max(1))
    }

    pub fn refusal_detector(&self) -> Result<RefusalDetector> {
        RefusalDetector::new(&self.refusal_phrases)
    }
}
