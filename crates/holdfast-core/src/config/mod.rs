//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::locking::LockConfig;
use crate::domain::versioning::RetryPolicy;
use crate::domain::versioning::retry::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_RETRIES,
};

/// Keys accepted by `get` and `set`
const KEYS: [&str; 7] = [
    "locking.default_ttl_secs",
    "locking.cleanup_interval_secs",
    "locking.lock_dir",
    "retry.max_retries",
    "retry.base_delay_ms",
    "retry.backoff_multiplier",
    "retry.max_delay_ms",
];

/// Holdfast configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub locking: LockingConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    pub default_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    pub lock_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        let defaults = LockConfig::default();
        Self {
            default_ttl_secs: defaults.default_ttl.as_secs(),
            cleanup_interval_secs: defaults.cleanup_interval.as_secs(),
            lock_dir: defaults.lock_dir,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("HOLDFAST_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("holdfast")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Parse and validate a TOML document; missing fields take defaults
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.locking.cleanup_interval_secs == 0 {
            return Err(anyhow!("locking.cleanup_interval_secs must be greater than 0"));
        }
        if self.retry.max_retries == 0 {
            return Err(anyhow!("retry.max_retries must be at least 1"));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(anyhow!("retry.backoff_multiplier must be at least 1.0"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(anyhow!(
                "retry.max_delay_ms must not be less than retry.base_delay_ms"
            ));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            // Locking settings
            "locking.default_ttl_secs" => Ok(self.locking.default_ttl_secs.to_string()),
            "locking.cleanup_interval_secs" => Ok(self.locking.cleanup_interval_secs.to_string()),
            "locking.lock_dir" => Ok(self.locking.lock_dir.display().to_string()),

            // Retry settings
            "retry.max_retries" => Ok(self.retry.max_retries.to_string()),
            "retry.base_delay_ms" => Ok(self.retry.base_delay_ms.to_string()),
            "retry.backoff_multiplier" => Ok(self.retry.backoff_multiplier.to_string()),
            "retry.max_delay_ms" => Ok(self.retry.max_delay_ms.to_string()),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `holdfast config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    ///
    /// The updated configuration is validated; on failure `self` is unchanged.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut updated = self.clone();
        match key {
            "locking.default_ttl_secs" => updated.locking.default_ttl_secs = parse(key, value)?,
            "locking.cleanup_interval_secs" => {
                updated.locking.cleanup_interval_secs = parse(key, value)?
            }
            "locking.lock_dir" => {
                if value.trim().is_empty() {
                    return Err(anyhow!("locking.lock_dir must not be empty"));
                }
                updated.locking.lock_dir = PathBuf::from(value);
            }
            "retry.max_retries" => updated.retry.max_retries = parse(key, value)?,
            "retry.base_delay_ms" => updated.retry.base_delay_ms = parse(key, value)?,
            "retry.backoff_multiplier" => updated.retry.backoff_multiplier = parse(key, value)?,
            "retry.max_delay_ms" => updated.retry.max_delay_ms = parse(key, value)?,
            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `holdfast config list` to see available keys.",
                    key
                ));
            }
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }

    /// Lock settings for `LockManager`
    pub fn lock_config(&self) -> LockConfig {
        LockConfig::default()
            .with_lock_dir(self.locking.lock_dir.clone())
            .with_ttl(Duration::from_secs(self.locking.default_ttl_secs))
            .with_cleanup_interval(Duration::from_secs(self.locking.cleanup_interval_secs))
    }

    /// Backoff settings for `VersionGuard`
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(self.retry.max_retries)
            .with_base_delay(Duration::from_millis(self.retry.base_delay_ms))
            .with_backoff_multiplier(self.retry.backoff_multiplier)
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
    }
}
