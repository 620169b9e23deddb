//! Configuration types and loading
//!
//! YAML with a fallback chain: explicit path, then project-local
//! `.pipewright.yml`, then the user config directory, then defaults. Every
//! section tolerates omission via `#[serde(default)]`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};

use crate::llm::{ContextThresholds, ModelCatalog};
use crate::mcp::McpServerConfig;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Known models and their context windows
    pub models: HashMap<String, ModelConfig>,

    /// Context-window warning thresholds
    pub context: ContextConfig,

    /// Scheduler policy knobs
    pub scheduler: SchedulerSettings,

    /// Storage locations
    pub storage: StorageConfig,

    /// External tool servers, keyed by server id
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

impl Config {
    /// Load configuration with the fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".pipewright.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("pipewright").join("pipewright.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// The model catalog the dispatcher consults
    pub fn model_catalog(&self) -> ModelCatalog {
        let mut catalog = ModelCatalog::default();
        for (model, spec) in &self.models {
            catalog.insert(model, spec.window, spec.serialize_requests);
        }
        catalog
    }

    /// Utilisation thresholds as the dispatcher wants them
    pub fn thresholds(&self) -> ContextThresholds {
        ContextThresholds {
            warn_percent: self.context.warn_percent,
            stop_percent: self.context.stop_percent,
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name (reference implementation: "anthropic")
    pub provider: String,
    /// Default model for commands that don't declare one
    pub model: String,
    /// Model escalation re-dispatches target (should carry a larger window)
    pub escalation_model: Option<String>,
    /// API base URL
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Default output-token ceiling per request
    pub max_output_tokens: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            escalation_model: Some("claude-opus-4-5".to_string()),
            base_url: "https://api.anthropic.com".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            max_output_tokens: 8_192,
        }
    }
}

impl LlmConfig {
    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env)
            .map_err(|_| eyre!("API key environment variable '{}' is not set", self.api_key_env))
    }
}

/// One model's limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Context window in tokens
    pub window: u64,
    /// Serialise requests to this model (provider rate limits)
    pub serialize_requests: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            window: 200_000,
            serialize_requests: false,
        }
    }
}

/// Context-window warning thresholds, percent
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub warn_percent: f64,
    pub stop_percent: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            warn_percent: 70.0,
            stop_percent: 85.0,
        }
    }
}

/// Scheduler policy knobs
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Treat a failed optional stage as demoting SUCCESS to PARTIAL
    pub demote_on_optional_failure: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            demote_on_optional_failure: false,
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Session store root (sessions land under `<root>/sessions/`)
    pub root: PathBuf,
    /// Prompt/command tree root (`prompts/`, `commands/`)
    pub registry_root: PathBuf,
    /// Agent registry document
    pub agents_file: PathBuf,
    /// MCP approval cache file
    pub approvals_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".ai"),
            registry_root: PathBuf::from("."),
            agents_file: PathBuf::from("agents.json"),
            approvals_file: PathBuf::from(".mcp-approvals.json"),
        }
    }
}
