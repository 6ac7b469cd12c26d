// engine/src/config.rs
//!
//! Engine configuration, loaded from a TOML file.
//!
//! The `[[providers]]` array is the statically configured LM Client provider
//! set. Its order is the fallback-chain order used by `LmClient::complete`.

use crate::model_adapters::ApiStyle;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: PathBuf,
    /// Gates the ledger snapshot download.
    pub federation_enabled: bool,
    pub providers: Vec<ProviderConfig>,
    pub rate_limits: RateLimitConfig,
    /// Registered providers whose heartbeat is older than this go dormant.
    pub heartbeat_stale_secs: u64,
    pub replay_concurrency: usize,
    pub sweep_interval_secs: u64,
    /// Credits debited per model in a dispatch; zero disables billing.
    pub dispatch_credit_cost: i64,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("horostracker.sqlite"),
            federation_enabled: false,
            providers: Vec::new(),
            rate_limits: RateLimitConfig::default(),
            heartbeat_stale_secs: 300,
            replay_concurrency: 8,
            sweep_interval_secs: 60,
            dispatch_credit_cost: 0,
            log_filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub api_style: ApiStyle,
    pub endpoint: String,
    /// Environment variable holding the API key, if the provider needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Provider supports a native JSON response mode.
    #[serde(default)]
    pub json_mode: bool,
}

fn default_timeout_ms() -> u64 {
    120_000
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowLimit {
    pub limit: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub search: WindowLimit,
    pub batch_resolution: WindowLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            search: WindowLimit {
                limit: 30,
                window_secs: 60,
            },
            batch_resolution: WindowLimit {
                limit: 10,
                window_secs: 3600,
            },
        }
    }
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let toml_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        Self::load_from_str(&toml_str)
    }

    pub fn load_from_str(toml_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml_str).context("Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(anyhow!("provider name must not be empty"));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(anyhow!("duplicate provider name '{}'", provider.name));
            }
            if provider.timeout_ms == 0 {
                return Err(anyhow!("provider '{}' has a zero timeout", provider.name));
            }
        }
        for (label, limit) in [
            ("search", self.rate_limits.search),
            ("batch_resolution", self.rate_limits.batch_resolution),
        ] {
            if limit.window_secs == 0 || limit.limit == 0 {
                return Err(anyhow!("rate limit '{label}' needs a non-zero limit and window"));
            }
        }
        if self.dispatch_credit_cost < 0 {
            return Err(anyhow!("dispatch_credit_cost must not be negative"));
        }
        if self.replay_concurrency == 0 {
            return Err(anyhow!("replay_concurrency must be at least 1"));
        }
        Ok(())
    }
}
