//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `max_disk_bytes` is 0
    /// - `memory_fraction` is outside (0, 1]
    /// - `inflight_capacity` is 0
    /// - `max_bytes` is 0 or exceeds 50MB
    /// - `timeout_ms` is less than 100ms or exceeds 5 minutes
    /// - `user_agent` is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_disk_bytes == 0 {
            return Err(invalid("max_disk_bytes", "must be greater than 0"));
        }

        if !(self.memory_fraction > 0.0 && self.memory_fraction <= 1.0) {
            return Err(invalid("memory_fraction", "must be in (0, 1]"));
        }

        if self.inflight_capacity == 0 {
            return Err(invalid("inflight_capacity", "must be greater than 0"));
        }

        if self.max_bytes == 0 {
            return Err(invalid("max_bytes", "must be greater than 0"));
        }
        if self.max_bytes > 50 * 1024 * 1024 {
            return Err(invalid("max_bytes", "must not exceed 50MB"));
        }

        if self.timeout_ms < 100 {
            return Err(invalid("timeout_ms", "must be at least 100ms"));
        }
        if self.timeout_ms > 300_000 {
            return Err(invalid("timeout_ms", "must not exceed 5 minutes (300000ms)"));
        }

        if self.user_agent.is_empty() {
            return Err(invalid("user_agent", "must not be empty"));
        }

        if self.memory_cache_bytes() == 0 {
            tracing::warn!(
                memory_budget_bytes = self.memory_budget_bytes,
                memory_fraction = self.memory_fraction,
                "memory cache budget rounds down to zero; decoded images will not be retained"
            );
        }

        Ok(())
    }
}
