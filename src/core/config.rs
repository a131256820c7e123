//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::core::models::{Model, Tier};
use crate::core::retry::RetryPolicy;

/// Configuration for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub api_key: String,
    pub api_endpoint: String,
    pub models: Vec<Model>,
    pub target_language: String,
    pub daily_token_limit: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub timeout_ms: u64,
    /// Directory for the persisted key/value store
    pub data_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("GEMINI_API_KEY").unwrap_or_default(),
            api_endpoint: std::env::var("API_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string()),
            models: vec![],
            target_language: "Burmese".to_string(),
            daily_token_limit: 500_000,
            max_retries: 3,
            retry_delay_ms: 1000,
            batch_size: 30,
            batch_delay_ms: 6000,
            timeout_ms: 60000,
            data_dir: PathBuf::from(".dialogue-translator"),
        }
    }
}

const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default models configuration
const DEFAULT_MODELS: &[(&str, Tier, bool, bool)] = &[
    ("gemini-3-flash-preview", Tier::Fast, true, true),
    ("gemini-3.1-pro-preview", Tier::Pro, true, true),
    ("gemini-flash-lite-latest", Tier::Fast, false, false),
];

/// Read an env var and parse it, falling back to `default` when unset
fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY environment variable is required"))?;

        let defaults = Self::default();

        Ok(Self {
            api_key,
            api_endpoint: std::env::var("API_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string()),
            models: vec![],
            target_language: std::env::var("TARGET_LANGUAGE")
                .unwrap_or(defaults.target_language),
            daily_token_limit: env_or("DAILY_TOKEN_LIMIT", defaults.daily_token_limit)?,
            max_retries: env_or("MAX_RETRIES", defaults.max_retries)?,
            retry_delay_ms: env_or("RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            batch_size: env_or("BATCH_SIZE", defaults.batch_size)?,
            batch_delay_ms: env_or("BATCH_DELAY_MS", defaults.batch_delay_ms)?,
            timeout_ms: env_or("REQUEST_TIMEOUT_MS", defaults.timeout_ms)?,
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
        })
    }

    /// Load configuration with default models
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::from_env()?;
        config.fill_default_models();
        Ok(config)
    }

    /// Populate the model list when none is configured
    pub fn fill_default_models(&mut self) {
        if !self.models.is_empty() {
            return;
        }
        self.models = DEFAULT_MODELS
            .iter()
            .map(|(id, tier, high_reasoning, enabled)| Model {
                id: id.to_string(),
                tier: *tier,
                high_reasoning: *high_reasoning,
                enabled: *enabled,
            })
            .collect();

        info!("Loaded {} default models", self.models.len());
    }

    /// Load from a JSON file; absent fields take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)?;
        config.fill_default_models();
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_endpoint.is_empty() {
            return Err(anyhow::anyhow!("API endpoint is required"));
        }

        if self.models.is_empty() {
            warn!("No models configured");
        }

        for tier in [Tier::Fast, Tier::Pro] {
            if self.get_model_for_tier(tier).is_none() {
                return Err(anyhow::anyhow!("no enabled model for tier {}", tier));
            }
        }

        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("batch_size must be greater than 0"));
        }

        if self.daily_token_limit == 0 {
            return Err(anyhow::anyhow!("daily_token_limit must be greater than 0"));
        }

        Ok(())
    }

    /// Retry settings derived from this config
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Path of the key/value store file
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    /// Get all enabled models
    pub fn get_enabled_models(&self) -> Vec<&Model> {
        self.models.iter().filter(|m| m.enabled).collect()
    }

    /// Find model by ID
    pub fn find_model(&self, id: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Get model for tier
    pub fn get_model_for_tier(&self, tier: Tier) -> Option<&Model> {
        self.models.iter().find(|m| m.is_compatible(tier))
    }
}
