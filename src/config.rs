//! Configuration management for Formguard.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{FormguardError, Result};
use crate::ratelimit::{
    QuotaOverrides, QuotaTable, DEFAULT_KEY_PREFIX, DEFAULT_MAX_ENTRIES, DEFAULT_SWEEP_PROBABILITY,
};

/// Prefix of environment variables that override file configuration.
pub const ENV_PREFIX: &str = "FORMGUARD";

/// Main configuration for the Formguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormguardConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Accounts known to the bundled directory
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Identifier of this instance in logs
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Bearer token guarding the admin routes; they are disabled when unset
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            instance_id: default_instance_id(),
            admin_token: None,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Redis URL for shared counters; local counting only when unset
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for counter keys in Redis
    #[serde(default = "default_key_prefix")]
    pub redis_key_prefix: String,

    /// Bound on one Redis round trip in milliseconds
    #[serde(default = "default_redis_timeout")]
    pub redis_timeout_ms: u64,

    /// How long to count locally after a Redis failure, in milliseconds
    #[serde(default = "default_redis_retry_after")]
    pub redis_retry_after_ms: u64,

    /// Maximum number of local counters
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,

    /// Interval of the background sweep in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Chance that a single request triggers a sweep
    #[serde(default = "default_sweep_probability")]
    pub sweep_probability: f64,

    /// Complete quota table; the built-in table is used when unset
    #[serde(default)]
    pub quotas: Option<QuotaOverrides>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_key_prefix: default_key_prefix(),
            redis_timeout_ms: default_redis_timeout(),
            redis_retry_after_ms: default_redis_retry_after(),
            local_max_entries: default_local_max_entries(),
            sweep_interval_secs: default_sweep_interval(),
            sweep_probability: default_sweep_probability(),
            quotas: None,
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_redis_timeout() -> u64 {
    250
}

fn default_redis_retry_after() -> u64 {
    5000
}

fn default_local_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_sweep_probability() -> f64 {
    DEFAULT_SWEEP_PROBABILITY
}

impl RateLimitingConfig {
    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }

    pub fn redis_retry_after(&self) -> Duration {
        Duration::from_millis(self.redis_retry_after_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Build the quota table, failing on a missing or invalid row.
    pub fn quota_table(&self) -> Result<QuotaTable> {
        QuotaTable::from_config(self.quotas.as_ref())
    }
}

/// One account of the bundled directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Bearer token presented by the user
    pub token: String,
    /// Opaque user id
    pub user_id: String,
    /// Billing plan name
    #[serde(default = "default_plan")]
    pub plan: String,
    /// Ids of the forms this user owns
    #[serde(default)]
    pub forms: Vec<String>,
}

fn default_plan() -> String {
    "free".to_string()
}

impl FormguardConfig {
    /// Load configuration from an optional file plus `FORMGUARD__*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: FormguardConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| FormguardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FormguardConfig =
            serde_yaml::from_str(yaml).map_err(|e| FormguardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        if !(0.0..=1.0).contains(&rl.sweep_probability) {
            return Err(FormguardError::Config(format!(
                "sweep_probability must be within [0, 1], got {}",
                rl.sweep_probability
            )));
        }
        if rl.sweep_interval_secs == 0 {
            return Err(FormguardError::Config("sweep_interval_secs must be positive".to_string()));
        }
        if rl.redis_timeout_ms == 0 {
            return Err(FormguardError::Config("redis_timeout_ms must be positive".to_string()));
        }
        rl.quota_table()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{LimitClass, Tier};

    #[test]
    fn test_defaults() {
        let config = FormguardConfig::default();

        assert_eq!(config.server.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert!(config.rate_limiting.redis_url.is_none());
        assert_eq!(config.rate_limiting.redis_timeout(), Duration::from_millis(250));
        assert_eq!(config.rate_limiting.redis_key_prefix, "formguard:ratelimit:");
        assert!(config.accounts.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
rate_limiting:
  redis_url: "redis://cache:6379/"
  sweep_probability: 0.05
accounts:
  - token: tok-1
    user_id: u1
    plan: pro
    forms: [contact, survey]
  - token: tok-2
    user_id: u2
"#;
        let config = FormguardConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.rate_limiting.redis_url.as_deref(), Some("redis://cache:6379/"));
        assert_eq!(config.rate_limiting.sweep_probability, 0.05);
        assert_eq!(config.rate_limiting.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[0].forms, vec!["contact", "survey"]);
        assert_eq!(config.accounts[1].plan, "free");
        assert!(config.accounts[1].forms.is_empty());
    }

    #[test]
    fn test_quota_overrides_must_be_total() {
        let yaml = r#"
rate_limiting:
  quotas:
    submission:
      free: { limit: 3, window_ms: 1000 }
"#;
        let err = FormguardConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, FormguardError::Config(_)));
    }

    #[test]
    fn test_invalid_sweep_probability() {
        let yaml = r#"
rate_limiting:
  sweep_probability: 1.5
"#;
        assert!(FormguardConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = FormguardConfig::load(None).unwrap();
        let table = config.rate_limiting.quota_table().unwrap();

        assert_eq!(table.lookup(LimitClass::Submission, Tier::Free).limit, 10);
    }
}
