//! Pipeline configuration.
//!
//! Loaded from `~/.graham/pipeline.json`; every field has a default so a
//! partial file (or no file) is valid. `GRAHAM_*` environment variables
//! override file values. Validation failures are fatal at startup.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use graham_common::config::{config_path, env_override, load_json_or_default};
use graham_common::validation::{require_nonzero, require_positive, require_range};
use graham_common::{ObservabilityConfig, Validate, ValidationError, ValidationResult};

use crate::valuation::ValuationThresholds;

/// Default config file name inside the config directory.
pub const CONFIG_FILE: &str = "pipeline.json";

// ============================================================================
// Root Configuration
// ============================================================================

/// Configuration for one pipeline deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of concurrent workers
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Attempts per security against the primary source
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt (ms); doubles per attempt
    #[serde(default = "default_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,

    /// Upper bound for a single backoff delay (ms)
    #[serde(default = "default_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,

    /// Jitter as a fraction of the backoff delay
    #[serde(default = "default_jitter_factor")]
    pub retry_jitter_factor: f64,

    /// Timeout for a single fetch (seconds)
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// How long in-flight tasks may run after cancellation (seconds)
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// Token bucket applied independently to every target host
    #[serde(default)]
    pub rate_limit_per_host: RateLimitConfig,

    /// Relay pool settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Where records are fetched from
    #[serde(default)]
    pub source: SourceConfig,

    /// Scoring thresholds
    #[serde(default)]
    pub valuation_thresholds: ValuationThresholds,

    /// Logging
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_attempts: default_max_attempts(),
            retry_backoff_base_ms: default_backoff_base_ms(),
            retry_backoff_max_ms: default_backoff_max_ms(),
            retry_jitter_factor: default_jitter_factor(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            rate_limit_per_host: RateLimitConfig::default(),
            proxy: ProxyConfig::default(),
            source: SourceConfig::default(),
            valuation_thresholds: ValuationThresholds::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

fn default_worker_count() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_fetch_timeout_secs() -> u64 {
    15
}

fn default_cancel_grace_secs() -> u64 {
    5
}

impl PipelineConfig {
    /// Load from the default path and apply environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path(CONFIG_FILE))
    }

    /// Load from a specific path and apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config: Self = load_json_or_default(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `GRAHAM_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        env_override("GRAHAM_WORKERS", &mut self.worker_count);
        env_override("GRAHAM_MAX_ATTEMPTS", &mut self.max_attempts);
        env_override("GRAHAM_BACKOFF_BASE_MS", &mut self.retry_backoff_base_ms);
        env_override("GRAHAM_RATE_CAPACITY", &mut self.rate_limit_per_host.capacity);
        env_override(
            "GRAHAM_RATE_REFILL_PER_SEC",
            &mut self.rate_limit_per_host.refill_per_sec,
        );
        env_override("GRAHAM_PROXY_THRESHOLD", &mut self.proxy.score_threshold);
        env_override("GRAHAM_PROXY_COOLDOWN_SECS", &mut self.proxy.cooldown_seconds);
        self.observability.apply_env_overrides();
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    /// Total attempts a task may make across primary and fallback sources.
    pub fn attempt_budget(&self) -> u32 {
        let primary = if self.source.primary_enabled {
            self.max_attempts
        } else {
            0
        };
        let fallback = if self.source.fallback_url_template.is_some() {
            self.source.fallback_attempts
        } else {
            0
        };
        primary.saturating_add(fallback)
    }
}

impl Validate for PipelineConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = require_nonzero("worker_count", self.worker_count) {
            errors.push(e);
        }
        if self.max_attempts == 0 {
            errors.push(ValidationError::invalid("max_attempts", "must be greater than zero"));
        }
        if self.retry_backoff_max_ms < self.retry_backoff_base_ms {
            errors.push(ValidationError::Conflict {
                reason: format!(
                    "retry_backoff_max_ms ({}) is below retry_backoff_base_ms ({})",
                    self.retry_backoff_max_ms, self.retry_backoff_base_ms
                ),
            });
        }
        if let Err(e) = require_range("retry_jitter_factor", self.retry_jitter_factor, 0.0, 1.0) {
            errors.push(e);
        }
        if self.fetch_timeout_secs == 0 {
            errors.push(ValidationError::invalid("fetch_timeout_secs", "must be greater than zero"));
        }

        for section in [
            self.rate_limit_per_host.validate(),
            self.proxy.validate(),
            self.source.validate(),
            self.valuation_thresholds.validate(),
        ] {
            if let Err(e) = section {
                errors.push(e);
            }
        }

        if self.attempt_budget() == 0 {
            errors.push(ValidationError::Conflict {
                reason: "primary source disabled and no fallback configured".into(),
            });
        }

        ValidationError::collect(errors)
    }
}

// ============================================================================
// Rate Limit Configuration
// ============================================================================

/// Slowest accepted refill rate: one token every ~17 minutes.
pub const MIN_REFILL_PER_SEC: f64 = 0.001;

/// Token bucket parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Burst size (tokens the bucket holds when full)
    #[serde(default = "default_rate_capacity")]
    pub capacity: u32,

    /// Continuous refill rate (tokens per second)
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            refill_per_sec: default_refill_per_sec(),
        }
    }
}

fn default_rate_capacity() -> u32 {
    2
}

fn default_refill_per_sec() -> f64 {
    1.0
}

impl Validate for RateLimitConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.capacity == 0 {
            return Err(ValidationError::invalid(
                "rate_limit_per_host.capacity",
                "must be greater than zero",
            ));
        }
        require_positive("rate_limit_per_host.refill_per_sec", self.refill_per_sec)?;
        if self.refill_per_sec < MIN_REFILL_PER_SEC {
            return Err(ValidationError::invalid(
                "rate_limit_per_host.refill_per_sec",
                format!("must be at least {}, got {}", MIN_REFILL_PER_SEC, self.refill_per_sec),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Proxy Configuration
// ============================================================================

/// Relay pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Score below which a relay is banned
    #[serde(default = "default_score_threshold")]
    pub score_threshold: u32,

    /// How long a banned relay sits out before re-verification
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Score assigned on registration
    #[serde(default = "default_initial_score")]
    pub initial_score: u32,

    /// Points added per successful use
    #[serde(default = "default_reward")]
    pub reward: u32,

    /// Base points removed per failure, multiplied by (1 + consecutive failures)
    #[serde(default = "default_penalty")]
    pub penalty: u32,

    /// Consecutive failures that demote a relay to degraded
    #[serde(default = "default_degraded_after")]
    pub degraded_after_failures: u32,

    /// Concurrent leases a single relay may hold
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_proxy: usize,

    /// Lightweight target used by health sweeps
    #[serde(default = "default_canary_url")]
    pub canary_url: String,

    /// Timeout for a single health check (seconds)
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,

    /// Refuse to fetch directly when no relays are registered
    #[serde(default)]
    pub required: bool,

    /// Relays registered at startup (`host:port`, optionally `scheme://` prefixed)
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            score_threshold: default_score_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
            initial_score: default_initial_score(),
            reward: default_reward(),
            penalty: default_penalty(),
            degraded_after_failures: default_degraded_after(),
            max_concurrent_per_proxy: default_max_concurrent(),
            canary_url: default_canary_url(),
            check_timeout_secs: default_check_timeout_secs(),
            required: false,
            endpoints: Vec::new(),
        }
    }
}

fn default_score_threshold() -> u32 {
    20
}

fn default_cooldown_seconds() -> u64 {
    300
}

fn default_initial_score() -> u32 {
    50
}

fn default_reward() -> u32 {
    10
}

fn default_penalty() -> u32 {
    5
}

fn default_degraded_after() -> u32 {
    3
}

fn default_max_concurrent() -> usize {
    2
}

fn default_canary_url() -> String {
    "http://www.baidu.com".to_string()
}

fn default_check_timeout_secs() -> u64 {
    5
}

impl ProxyConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

impl Validate for ProxyConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if self.score_threshold > 100 {
            errors.push(ValidationError::invalid("proxy.score_threshold", "must be within [0, 100]"));
        }
        if self.initial_score > 100 {
            errors.push(ValidationError::invalid("proxy.initial_score", "must be within [0, 100]"));
        }
        if self.initial_score < self.score_threshold {
            errors.push(ValidationError::Conflict {
                reason: format!(
                    "proxy.initial_score ({}) is below proxy.score_threshold ({}); new relays would be banned on arrival",
                    self.initial_score, self.score_threshold
                ),
            });
        }
        if self.degraded_after_failures == 0 {
            errors.push(ValidationError::invalid(
                "proxy.degraded_after_failures",
                "must be greater than zero",
            ));
        }
        if let Err(e) = require_nonzero("proxy.max_concurrent_per_proxy", self.max_concurrent_per_proxy) {
            errors.push(e);
        }
        if url::Url::parse(&self.canary_url).is_err() {
            errors.push(ValidationError::invalid("proxy.canary_url", "not a valid URL"));
        }

        ValidationError::collect(errors)
    }
}

// ============================================================================
// Source Configuration
// ============================================================================

/// Primary/fallback record sources. `{id}` in a template is replaced with the security id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_primary_template")]
    pub primary_url_template: String,

    #[serde(default)]
    pub fallback_url_template: Option<String>,

    /// Disable to route every attempt to the fallback
    #[serde(default = "default_true")]
    pub primary_enabled: bool,

    /// Attempts granted to the fallback once the primary is exhausted
    #[serde(default = "default_fallback_attempts")]
    pub fallback_attempts: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            primary_url_template: default_primary_template(),
            fallback_url_template: None,
            primary_enabled: true,
            fallback_attempts: default_fallback_attempts(),
        }
    }
}

fn default_primary_template() -> String {
    "https://emweb.securities.eastmoney.com/api/finance/{id}".to_string()
}

fn default_true() -> bool {
    true
}

fn default_fallback_attempts() -> u32 {
    1
}

impl Validate for SourceConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        let templates = std::iter::once(("source.primary_url_template", Some(&self.primary_url_template)))
            .chain(std::iter::once((
                "source.fallback_url_template",
                self.fallback_url_template.as_ref(),
            )));

        for (field, template) in templates {
            let Some(template) = template else { continue };
            if !template.contains("{id}") {
                errors.push(ValidationError::invalid(field, "must contain an {id} placeholder"));
            } else if url::Url::parse(&template.replace("{id}", "0")).is_err() {
                errors.push(ValidationError::invalid(field, "not a valid URL"));
            }
        }

        ValidationError::collect(errors)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.proxy.score_threshold, 20);
        assert_eq!(config.valuation_thresholds.safety_margin_tiers, vec![0.5, 0.3, 0.2]);
    }

    #[test]
    fn test_zero_rate_capacity_is_fatal() {
        let mut config = PipelineConfig::default();
        config.rate_limit_per_host.capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rate_limit_per_host.capacity"));
    }

    #[test]
    fn test_multiple_errors_are_collected() {
        let mut config = PipelineConfig::default();
        config.worker_count = 0;
        config.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::Multiple(errors)) if errors.len() == 2
        ));
    }

    #[test]
    fn test_template_requires_placeholder() {
        let mut config = PipelineConfig::default();
        config.source.fallback_url_template = Some("https://backup.example.com/finance".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_attempt_budget() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.attempt_budget(), 3);

        config.source.fallback_url_template = Some("https://backup.example.com/{id}".into());
        assert_eq!(config.attempt_budget(), 4);

        config.source.primary_enabled = false;
        assert_eq!(config.attempt_budget(), 1);

        config.source.fallback_url_template = None;
        assert_eq!(config.attempt_budget(), 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_attempt_budget_saturates() {
        let mut config = PipelineConfig::default();
        config.max_attempts = u32::MAX;
        config.source.fallback_url_template = Some("https://backup.example.com/{id}".into());
        config.source.fallback_attempts = u32::MAX;
        assert_eq!(config.attempt_budget(), u32::MAX);
    }

    #[test]
    fn test_refill_rate_floor() {
        let slow = RateLimitConfig {
            capacity: 1,
            refill_per_sec: 1e-20,
        };
        assert!(matches!(slow.validate(), Err(ValidationError::InvalidValue { .. })));

        let floor = RateLimitConfig {
            capacity: 1,
            refill_per_sec: MIN_REFILL_PER_SEC,
        };
        assert!(floor.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "worker_count": 8,
                "rate_limit_per_host": {{ "capacity": 5 }},
                "proxy": {{ "endpoints": ["10.0.0.1:8080"] }}
            }}"#
        )
        .unwrap();

        let config = PipelineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.rate_limit_per_host.capacity, 5);
        assert_eq!(config.rate_limit_per_host.refill_per_sec, 1.0);
        assert_eq!(config.proxy.endpoints, vec!["10.0.0.1:8080".to_string()]);
        assert_eq!(config.proxy.cooldown_seconds, 300);
    }
}
