use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::duration::deserialize_duration;
use crate::prices::{CircuitBreakerConfig, RefreshTimeouts, RetryPolicy, Schedule, TruncgilConfig};

fn default_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_cycle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_refresh_on_start() -> bool {
    true
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

/// Refresh cadence and time bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Time between scheduled refreshes of a class.
    #[serde(
        default = "default_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "crate::duration::serialize_duration"
    )]
    pub interval: Duration,

    /// Random extra wait added to each interval.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "crate::duration::serialize_duration"
    )]
    pub jitter: Duration,

    /// Upper bound for a whole cycle, retries included.
    #[serde(
        default = "default_cycle_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "crate::duration::serialize_duration"
    )]
    pub cycle_timeout: Duration,

    #[serde(
        default = "default_provider_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "crate::duration::serialize_duration"
    )]
    pub provider_timeout: Duration,

    #[serde(
        default = "default_store_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "crate::duration::serialize_duration"
    )]
    pub store_timeout: Duration,

    /// Refresh every class as soon as the scheduler starts.
    #[serde(default = "default_refresh_on_start")]
    pub refresh_on_start: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            jitter: Duration::ZERO,
            cycle_timeout: default_cycle_timeout(),
            provider_timeout: default_provider_timeout(),
            store_timeout: default_store_timeout(),
            refresh_on_start: default_refresh_on_start(),
        }
    }
}

impl RefreshConfig {
    pub fn timeouts(&self) -> RefreshTimeouts {
        RefreshTimeouts {
            cycle: self.cycle_timeout,
            provider_call: self.provider_timeout,
            store_call: self.store_timeout,
        }
    }

    pub fn schedule(&self) -> Schedule {
        Schedule {
            interval: self.interval,
            jitter: self.jitter,
            run_immediately: self.refresh_on_start,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the query surface listens on.
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to data directory. If relative, resolved from config file location.
    /// If not specified, defaults to the config file's directory.
    pub data_dir: Option<PathBuf>,

    pub refresh: RefreshConfig,

    pub retry: RetryPolicy,

    pub circuit_breaker: CircuitBreakerConfig,

    pub provider: TruncgilConfig,

    pub server: ServerConfig,
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load config from a file, or return default config if file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the data directory path.
    ///
    /// If `data_dir` is set and relative, it's resolved relative to `config_dir`.
    /// If `data_dir` is not set, returns `config_dir`.
    pub fn resolve_data_dir(&self, config_dir: &Path) -> PathBuf {
        match &self.data_dir {
            Some(data_dir) if data_dir.is_absolute() => data_dir.clone(),
            Some(data_dir) => config_dir.join(data_dir),
            None => config_dir.to_path_buf(),
        }
    }

    fn resolve(self, config_dir: &Path) -> ResolvedConfig {
        ResolvedConfig {
            data_dir: self.resolve_data_dir(config_dir),
            refresh: self.refresh,
            retry: self.retry,
            circuit_breaker: self.circuit_breaker,
            provider: self.provider,
            server: self.server,
        }
    }
}

/// Loaded configuration with resolved paths.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// The resolved data directory path.
    pub data_dir: PathBuf,
    pub refresh: RefreshConfig,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub provider: TruncgilConfig,
    pub server: ServerConfig,
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./kurabak.toml` if it exists in current directory
/// 2. `~/.local/share/kurabak/kurabak.toml` (XDG data directory)
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from("kurabak.toml");
    if local_config.exists() {
        return local_config;
    }

    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("kurabak").join("kurabak.toml");
    }

    local_config
}

impl ResolvedConfig {
    /// Load and resolve config from a file path.
    ///
    /// The data directory is resolved relative to the config file's parent directory.
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_path = config_path
            .canonicalize()
            .with_context(|| format!("Config file not found: {}", config_path.display()))?;

        let config_dir = config_path
            .parent()
            .context("Config file has no parent directory")?;

        let config = Config::load(&config_path)?;
        Ok(config.resolve(config_dir))
    }

    /// Load config, falling back to defaults if the file doesn't exist.
    ///
    /// Without a file, the config file's intended parent directory becomes the data
    /// directory.
    pub fn load_or_default(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            return Self::load(config_path);
        }

        let config_path = if config_path.is_relative() {
            std::env::current_dir()
                .context("Failed to get current directory")?
                .join(config_path)
        } else {
            config_path.to_path_buf()
        };

        let config_dir = config_path
            .parent()
            .context("Config path has no parent directory")?;

        Ok(Config::default().resolve(config_dir))
    }
}
