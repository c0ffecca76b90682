//! Configuration Store
//!
//! Handles loading/saving the planner's TOML config file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PlannerError, Result};
use crate::llm::SamplingConfig;
use crate::npc::types::DecisionSchema;

/// Environment variable overriding `model.path`
pub const MODEL_PATH_ENV: &str = "NPC_PLANNER_MODEL";
/// Environment variable overriding `backend.base_url`
pub const BASE_URL_ENV: &str = "NPC_PLANNER_BASE_URL";

/// Unified planner configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub sampling: SamplingConfig,

    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub planner: DecisionConfig,

    #[serde(default)]
    pub prompts: PromptsConfig,
}

/// Model weights and context sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the GGUF weights file
    #[serde(default)]
    pub path: PathBuf,

    #[serde(default = "default_context_size")]
    pub context_size: u32,

    /// Layers offloaded to the GPU (0 = CPU only)
    #[serde(default)]
    pub gpu_layers: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            context_size: default_context_size(),
            gpu_layers: 0,
        }
    }
}

fn default_context_size() -> u32 {
    2048
}

/// How to reach the inference backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Attach to an already running llama-server instead of spawning one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Extra directories searched for the server executable and accelerator libraries
    #[serde(default)]
    pub search_dirs: Vec<PathBuf>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            search_dirs: Vec::new(),
            port: default_port(),
            startup_timeout_secs: default_startup_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_port() -> u16 {
    8089
}

fn default_startup_timeout_secs() -> u64 {
    120
}

fn default_request_timeout_secs() -> u64 {
    300
}

/// Conversation sessions created at initialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_session_count")]
    pub count: usize,

    /// System message seeded into every session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            count: default_session_count(),
            system_prompt: Some(default_chat_system_prompt()),
        }
    }
}

fn default_session_count() -> usize {
    1
}

fn default_chat_system_prompt() -> String {
    "You are a calculator. Answer with the numeric result only.".to_string()
}

/// NPC decision settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionConfig {
    #[serde(default)]
    pub schema: DecisionSchema,

    /// Constrain generation with a grammar when the engine accepts it
    #[serde(default = "default_true")]
    pub use_grammar: bool,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            schema: DecisionSchema::default(),
            use_grammar: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Prompt rule text overrides; `None` selects the built-in template for the schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_template: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_template: Option<String>,
}

impl PlannerConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: PlannerConfig =
            toml::from_str(&content).map_err(|e| PlannerError::ConfigParse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| PlannerError::InvalidConfig {
            message: e.to_string(),
        })?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("npc-planner").join("config.toml"))
    }

    /// Load from the default location, falling back to defaults when absent or unreadable
    pub fn load_or_default() -> Self {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                match Self::load(&path) {
                    Ok(config) => return config,
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config"),
                }
            }
        }
        Self::default()
    }

    /// Apply `NPC_PLANNER_*` environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(model) = std::env::var(MODEL_PATH_ENV) {
            if !model.trim().is_empty() {
                self.model.path = PathBuf::from(model);
            }
        }
        if let Ok(url) = std::env::var(BASE_URL_ENV) {
            if !url.trim().is_empty() {
                self.backend.base_url = Some(url);
            }
        }
        self
    }

    /// Reject settings the runtime cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.sessions.count == 0 {
            return Err(PlannerError::NoSessions);
        }
        if self.model.context_size == 0 {
            return Err(invalid("model.context_size must be at least 1"));
        }
        if self.sampling.max_tokens == 0 {
            return Err(invalid("sampling.max_tokens must be at least 1"));
        }
        if !self.sampling.temperature.is_finite() || self.sampling.temperature < 0.0 {
            return Err(invalid("sampling.temperature must be a non-negative number"));
        }
        if !self.sampling.repeat_penalty.is_finite() || self.sampling.repeat_penalty <= 0.0 {
            return Err(invalid("sampling.repeat_penalty must be positive"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> PlannerError {
    PlannerError::InvalidConfig {
        message: message.to_string(),
    }
}
