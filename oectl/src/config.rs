//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides.
//! Variables prefixed with `OECTL_` override YAML values; nested keys use double
//! underscores, e.g. `OECTL_TASKS__MAX_WORKERS=4` sets `tasks.max_workers`.
//!
//! All sections have working defaults, so an empty file (or a missing one) yields
//! a usable configuration:
//!
//! ```yaml
//! logging:
//!   level: info
//!   format: text
//! rate_limits:
//!   enabled: true
//!   default:
//!     requests_per_minute: 10000
//!   agents:
//!     chat:
//!       requests_per_minute: 60
//! tasks:
//!   max_workers: 2
//!   task_ttl_seconds: 3600
//! ```

use std::collections::HashMap;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Logging level and output format
    pub logging: LoggingConfig,
    /// Admission-control limits per API key and agent scope
    pub rate_limits: RateLimitsConfig,
    /// Async task queue tuning
    pub tasks: TaskQueueConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is unset (e.g. "info", "oectl=debug")
    pub level: String,
    /// Log output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Rate limits for the request, token, and cost dimensions.
///
/// Each field is an independent ceiling; `None` means unlimited for that
/// window/dimension. Per-agent overrides merge field-by-field over the
/// default policy.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitPolicy {
    pub requests_per_minute: Option<u64>,
    pub requests_per_hour: Option<u64>,
    pub requests_per_day: Option<u64>,

    pub tokens_per_minute: Option<u64>,
    pub tokens_per_hour: Option<u64>,
    pub tokens_per_day: Option<u64>,

    pub cost_per_minute: Option<f64>,
    pub cost_per_hour: Option<f64>,
    pub cost_per_day: Option<f64>,
}

impl RateLimitPolicy {
    /// Returns this policy with unset fields filled in from `base`.
    pub fn overlaid_on(&self, base: &RateLimitPolicy) -> RateLimitPolicy {
        RateLimitPolicy {
            requests_per_minute: self.requests_per_minute.or(base.requests_per_minute),
            requests_per_hour: self.requests_per_hour.or(base.requests_per_hour),
            requests_per_day: self.requests_per_day.or(base.requests_per_day),
            tokens_per_minute: self.tokens_per_minute.or(base.tokens_per_minute),
            tokens_per_hour: self.tokens_per_hour.or(base.tokens_per_hour),
            tokens_per_day: self.tokens_per_day.or(base.tokens_per_day),
            cost_per_minute: self.cost_per_minute.or(base.cost_per_minute),
            cost_per_hour: self.cost_per_hour.or(base.cost_per_hour),
            cost_per_day: self.cost_per_day.or(base.cost_per_day),
        }
    }
}

/// Global and per-agent rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitsConfig {
    /// Whether rate limiting is enabled
    pub enabled: bool,
    /// Default limits applied to all agents
    pub default: RateLimitPolicy,
    /// Optional per-agent limit overrides
    pub agents: HashMap<String, RateLimitPolicy>,
    /// Interval for in-memory counter cleanup
    pub cleanup_interval_seconds: u64,
}

impl RateLimitsConfig {
    /// Resolves the effective policy for an agent scope: the agent override
    /// with unset fields inherited from the default policy.
    pub fn policy_for(&self, agent: &str) -> RateLimitPolicy {
        match self.agents.get(agent) {
            Some(override_policy) => override_policy.overlaid_on(&self.default),
            None => self.default.clone(),
        }
    }
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default: RateLimitPolicy {
                requests_per_minute: Some(10_000),
                requests_per_hour: Some(100_000),
                requests_per_day: Some(500_000),
                tokens_per_day: Some(10_000_000),
                cost_per_day: Some(1_000.0),
                ..RateLimitPolicy::default()
            },
            agents: HashMap::new(),
            cleanup_interval_seconds: 300,
        }
    }
}

/// Async task queue configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskQueueConfig {
    /// Number of concurrent worker loops (fixed at startup)
    pub max_workers: usize,
    /// How long finished tasks stay queryable before being purged
    pub task_ttl_seconds: u64,
    /// Interval between expiry sweeps
    pub cleanup_interval_seconds: u64,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            task_ttl_seconds: 3600,
            cleanup_interval_seconds: 30,
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file merged with `OECTL_` environment
    /// variables, then validates it.
    pub fn load(config_path: &str) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(config_path).extract()?;
        config
            .validate()
            .map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(config_path: &str) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(config_path))
            // Environment variables can still override specific values
            .merge(Env::prefixed("OECTL_").split("__"))
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.tasks.max_workers == 0 {
            return Err(Error::Internal {
                operation: "validate config: tasks.max_workers must be at least 1".to_string(),
            });
        }
        if self.tasks.cleanup_interval_seconds == 0 {
            return Err(Error::Internal {
                operation: "validate config: tasks.cleanup_interval_seconds must be at least 1"
                    .to_string(),
            });
        }
        if self.rate_limits.cleanup_interval_seconds == 0 {
            return Err(Error::Internal {
                operation:
                    "validate config: rate_limits.cleanup_interval_seconds must be at least 1"
                        .to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tasks.max_workers, 2);
        assert_eq!(config.rate_limits.cleanup_interval_seconds, 300);
        assert_eq!(
            config.rate_limits.default.requests_per_minute,
            Some(10_000)
        );
        assert!(config.rate_limits.default.tokens_per_minute.is_none());
    }

    #[test]
    fn yaml_file_and_env_overrides_merge() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r#"
logging:
  level: debug
rate_limits:
  agents:
    chat:
      requests_per_minute: 60
tasks:
  task_ttl_seconds: 120
"#,
            )?;
            jail.set_env("OECTL_TASKS__MAX_WORKERS", "4");

            let config = Config::load("config.yaml")?;
            assert_eq!(config.logging.level, "debug");
            assert_eq!(config.tasks.task_ttl_seconds, 120);
            // Env var wins over the file default
            assert_eq!(config.tasks.max_workers, 4);
            assert_eq!(
                config.rate_limits.agents["chat"].requests_per_minute,
                Some(60)
            );
            Ok(())
        });
    }

    #[test]
    fn validation_rejects_zero_workers() {
        let mut config = Config::default();
        config.tasks.max_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn policy_resolution_merges_per_field() {
        let mut config = RateLimitsConfig {
            default: RateLimitPolicy {
                requests_per_minute: Some(10),
                tokens_per_day: Some(1_000),
                ..RateLimitPolicy::default()
            },
            ..RateLimitsConfig::default()
        };
        config.agents.insert(
            "chat".to_string(),
            RateLimitPolicy {
                requests_per_minute: Some(1),
                ..RateLimitPolicy::default()
            },
        );

        let chat = config.policy_for("chat");
        // Overridden field
        assert_eq!(chat.requests_per_minute, Some(1));
        // Inherited field
        assert_eq!(chat.tokens_per_day, Some(1_000));

        // Unknown agents fall back to the default policy wholesale
        let research = config.policy_for("research");
        assert_eq!(research.requests_per_minute, Some(10));
    }
}
