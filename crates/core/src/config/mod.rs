//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (LUMEN_*)
//! 2. TOML config file (if LUMEN_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (LUMEN_*)
/// 2. TOML config file (if LUMEN_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding the disk cache.
    ///
    /// Set via LUMEN_CACHE_DIR environment variable.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Version tag of the stored data. Changing it discards the disk cache.
    ///
    /// Set via LUMEN_APP_VERSION environment variable.
    #[serde(default = "default_app_version")]
    pub app_version: u32,

    /// Byte budget of the disk cache.
    ///
    /// Set via LUMEN_MAX_DISK_BYTES environment variable.
    #[serde(default = "default_max_disk_bytes")]
    pub max_disk_bytes: u64,

    /// Share of `memory_budget_bytes` given to decoded images.
    ///
    /// Set via LUMEN_MEMORY_FRACTION environment variable.
    #[serde(default = "default_memory_fraction")]
    pub memory_fraction: f64,

    /// Memory available to the process, as reported by the host.
    ///
    /// Set via LUMEN_MEMORY_BUDGET_BYTES environment variable.
    #[serde(default = "default_memory_budget_bytes")]
    pub memory_budget_bytes: u64,

    /// Maximum number of outstanding network fetches.
    ///
    /// Set via LUMEN_INFLIGHT_CAPACITY environment variable.
    #[serde(default = "default_inflight_capacity")]
    pub inflight_capacity: usize,

    /// Freshness applied when a response carries no caching headers.
    ///
    /// Set via LUMEN_DEFAULT_TTL_MS environment variable.
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Pause dispatching while the user drags a list.
    ///
    /// Set via LUMEN_PAUSE_ON_SCROLL environment variable.
    #[serde(default)]
    pub pause_on_scroll: bool,

    /// Pause dispatching while a list settles after a fling.
    ///
    /// Set via LUMEN_PAUSE_ON_FLING environment variable.
    #[serde(default = "default_true")]
    pub pause_on_fling: bool,

    /// User-Agent string for HTTP requests.
    ///
    /// Set via LUMEN_USER_AGENT environment variable.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// HTTP request timeout in milliseconds.
    ///
    /// Set via LUMEN_TIMEOUT_MS environment variable.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Largest response body accepted.
    ///
    /// Set via LUMEN_MAX_BYTES environment variable.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./lumen-cache")
}

fn default_app_version() -> u32 {
    1
}

fn default_max_disk_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_memory_fraction() -> f64 {
    0.125
}

fn default_memory_budget_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_inflight_capacity() -> usize {
    32
}

fn default_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_user_agent() -> String {
    "lumen/0.1".into()
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_max_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            app_version: default_app_version(),
            max_disk_bytes: default_max_disk_bytes(),
            memory_fraction: default_memory_fraction(),
            memory_budget_bytes: default_memory_budget_bytes(),
            inflight_capacity: default_inflight_capacity(),
            default_ttl_ms: default_ttl_ms(),
            pause_on_scroll: false,
            pause_on_fling: true,
            user_agent: default_user_agent(),
            timeout_ms: default_timeout_ms(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl AppConfig {
    /// Timeout as Duration for use with reqwest/tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Memory cache capacity in bytes.
    pub fn memory_cache_bytes(&self) -> usize {
        (self.memory_budget_bytes as f64 * self.memory_fraction) as usize
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `LUMEN_`
    /// 2. TOML file from `LUMEN_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("LUMEN_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("LUMEN_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.cache_dir, PathBuf::from("./lumen-cache"));
        assert_eq!(config.app_version, 1);
        assert_eq!(config.max_disk_bytes, 10 * 1024 * 1024);
        assert_eq!(config.inflight_capacity, 32);
        assert_eq!(config.user_agent, "lumen/0.1");
        assert_eq!(config.max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.timeout_ms, 20_000);
        assert!(!config.pause_on_scroll);
        assert!(config.pause_on_fling);
    }

    #[test]
    fn test_timeout_duration() {
        let config = AppConfig::default();
        assert_eq!(config.timeout(), Duration::from_millis(20_000));
    }

    #[test]
    fn test_memory_cache_bytes() {
        let config = AppConfig::default();
        assert_eq!(config.memory_cache_bytes(), 32 * 1024 * 1024);

        let config = AppConfig { memory_budget_bytes: 1000, memory_fraction: 0.5, ..Default::default() };
        assert_eq!(config.memory_cache_bytes(), 500);
    }

    #[test]
    fn test_default_ttl() {
        let config = AppConfig::default();
        assert_eq!(config.default_ttl(), Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn test_layered_loading() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("lumen.toml", "app_version = 7\nmax_disk_bytes = 4096\n")?;
            jail.set_env("LUMEN_CONFIG_FILE", "lumen.toml");
            jail.set_env("LUMEN_MAX_DISK_BYTES", "8192");

            let config = AppConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.app_version, 7);
            assert_eq!(config.max_disk_bytes, 8192);
            assert_eq!(config.inflight_capacity, 32);
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("LUMEN_INFLIGHT_CAPACITY", "0");
            assert!(matches!(AppConfig::load(), Err(ConfigError::Invalid { field, .. }) if field == "inflight_capacity"));
            Ok(())
        });
    }
}
