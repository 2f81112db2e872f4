use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::EngineConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BottleConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(skip)]
    pub llm_api_key: Option<String>,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Gating and windowing
    #[serde(default = "default_synthesis_threshold")]
    pub synthesis_threshold: usize,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_max_turn_chars")]
    pub max_turn_chars: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // Sampling
    #[serde(default = "default_synthesis_temperature")]
    pub synthesis_temperature: f32,
    #[serde(default = "default_synthesis_max_tokens")]
    pub synthesis_max_tokens: u32,
    #[serde(default = "default_reply_temperature")]
    pub reply_temperature: f32,
    #[serde(default = "default_reply_max_tokens")]
    pub reply_max_tokens: u32,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_database_path() -> String {
    "bottle_chat.db".to_string()
}

fn default_synthesis_threshold() -> usize {
    50
}

fn default_context_window() -> usize {
    5
}

fn default_max_turn_chars() -> usize {
    500
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_synthesis_temperature() -> f32 {
    0.7
}

fn default_synthesis_max_tokens() -> u32 {
    500
}

fn default_reply_temperature() -> f32 {
    0.8
}

fn default_reply_max_tokens() -> u32 {
    150
}

impl Default for BottleConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            database_path: default_database_path(),
            synthesis_threshold: default_synthesis_threshold(),
            context_window: default_context_window(),
            max_turn_chars: default_max_turn_chars(),
            request_timeout_secs: default_request_timeout_secs(),
            synthesis_temperature: default_synthesis_temperature(),
            synthesis_max_tokens: default_synthesis_max_tokens(),
            reply_temperature: default_reply_temperature(),
            reply_max_tokens: default_reply_max_tokens(),
        }
    }
}

impl BottleConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("bottle_config.toml")
    }

    /// Load config from bottle_config.toml (next to executable), falling back to env vars.
    ///
    /// The API key is never read from the file; it always comes from `LLM_API_KEY`.
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!("No config file at {:?}, using defaults + env vars", path);
                return Self::from_env();
            }
            Err(e) => {
                tracing::error!("Failed to read {:?}: {}; using defaults + env vars", path, e);
                return Self::from_env();
            }
        };

        match Self::from_toml_str(&contents) {
            Ok(mut config) => {
                tracing::info!("Loaded config from {:?}", path);
                config.apply_env();
                config
            }
            Err(e) => {
                tracing::error!("Ignoring {:?}: {:#}; using defaults + env vars", path, e);
                Self::from_env()
            }
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: BottleConfig = toml::from_str(contents).context("Invalid config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            let key = key.trim().to_string();
            if !key.is_empty() {
                self.llm_api_key = Some(key);
            }
        }

        if let Ok(path) = env::var("BOTTLE_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        if let Ok(raw) = env::var("BOTTLE_SYNTHESIS_THRESHOLD") {
            match raw.parse() {
                Ok(threshold) if threshold > 0 => self.synthesis_threshold = threshold,
                _ => tracing::warn!("Ignoring invalid BOTTLE_SYNTHESIS_THRESHOLD '{}'", raw),
            }
        }

        if let Ok(raw) = env::var("BOTTLE_CONTEXT_WINDOW") {
            match raw.parse() {
                Ok(window) if window > 0 => self.context_window = window,
                _ => tracing::warn!("Ignoring invalid BOTTLE_CONTEXT_WINDOW '{}'", raw),
            }
        }

        if let Ok(raw) = env::var("BOTTLE_REQUEST_TIMEOUT_SECS") {
            if let Ok(seconds) = raw.parse() {
                self.request_timeout_secs = seconds;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.synthesis_threshold == 0 {
            anyhow::bail!("synthesis_threshold must be at least 1");
        }
        if self.context_window == 0 {
            anyhow::bail!("context_window must be at least 1");
        }
        if self.max_turn_chars == 0 {
            anyhow::bail!("max_turn_chars must be at least 1");
        }
        if self.llm_api_url.trim().is_empty() {
            anyhow::bail!("llm_api_url cannot be empty");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Engine settings derived from this config
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            synthesis_threshold: self.synthesis_threshold,
            context_window: self.context_window,
            max_turn_chars: self.max_turn_chars,
            request_timeout: self.request_timeout(),
            synthesis_temperature: self.synthesis_temperature,
            synthesis_max_tokens: self.synthesis_max_tokens,
            reply_temperature: self.reply_temperature,
            reply_max_tokens: self.reply_max_tokens,
        }
    }
}
