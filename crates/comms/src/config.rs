//! Configuration for the communication layer
//!
//! [`CommsConfig`] is the static init surface, loaded from TOML and
//! `COMMS_*` environment overrides by [`ConfigLoader`]. [`CallOptions`] are
//! per-call overrides that resolve into an immutable [`CallConfig`].

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::types::Priority;

/// Latency thresholds in milliseconds, ordered from fastest to slowest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceThresholds {
    pub excellent_ms: u64,
    pub good_ms: u64,
    pub acceptable_ms: u64,
    /// Calls above this raise a warning alert
    pub slow_ms: u64,
    /// Calls above this raise a critical alert
    pub critical_ms: u64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            excellent_ms: 100,
            good_ms: 500,
            acceptable_ms: 1000,
            slow_ms: 5000,
            critical_ms: 10_000,
        }
    }
}

/// Process-wide configuration of a [`crate::ServiceCommunicator`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommsConfig {
    pub default_timeout_ms: u64,
    pub fast_timeout_ms: u64,
    pub slow_timeout_ms: u64,

    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,

    /// Consecutive failures that open a breaker
    pub circuit_breaker_threshold: u32,
    /// Failures further apart than this do not count as consecutive
    pub circuit_breaker_window_ms: u64,
    pub circuit_breaker_recovery_ms: u64,

    pub cache_enabled: bool,
    pub cache_ttl_ms: u64,
    pub cache_sweep_interval_ms: u64,
    /// Stale reads are served up to `cache_ttl × factor`
    pub stale_ceiling_factor: u32,

    pub batch_max_size: usize,
    pub batch_window_ms: u64,
    pub max_parallel_replicas: usize,

    pub summary_interval_ms: u64,
    pub event_buffer: usize,

    pub thresholds: PerformanceThresholds,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5000,
            fast_timeout_ms: 1000,
            slow_timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1000,
            backoff_multiplier: 2.0,
            circuit_breaker_threshold: 5,
            circuit_breaker_window_ms: 60_000,
            circuit_breaker_recovery_ms: 30_000,
            cache_enabled: true,
            cache_ttl_ms: 300_000,
            cache_sweep_interval_ms: 60_000,
            stale_ceiling_factor: 10,
            batch_max_size: 10,
            batch_window_ms: 10,
            max_parallel_replicas: 3,
            summary_interval_ms: 300_000,
            event_buffer: 1024,
            thresholds: PerformanceThresholds::default(),
        }
    }
}

impl CommsConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn fast_timeout(&self) -> Duration {
        Duration::from_millis(self.fast_timeout_ms)
    }

    pub fn slow_timeout(&self) -> Duration {
        Duration::from_millis(self.slow_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn circuit_breaker_window(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_window_ms)
    }

    pub fn circuit_breaker_recovery(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_recovery_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn summary_interval(&self) -> Duration {
        Duration::from_millis(self.summary_interval_ms)
    }

    /// Reject configurations the components cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker_threshold == 0 {
            bail!("circuit_breaker_threshold must be at least 1");
        }
        if self.max_retries == 0 {
            bail!("max_retries must be at least 1");
        }
        if self.backoff_multiplier < 1.0 {
            bail!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            );
        }
        for (name, value) in [
            ("default_timeout_ms", self.default_timeout_ms),
            ("fast_timeout_ms", self.fast_timeout_ms),
            ("slow_timeout_ms", self.slow_timeout_ms),
            ("cache_sweep_interval_ms", self.cache_sweep_interval_ms),
            ("summary_interval_ms", self.summary_interval_ms),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        if self.batch_max_size == 0 {
            bail!("batch_max_size must be at least 1");
        }
        if self.max_parallel_replicas < 2 {
            bail!(
                "max_parallel_replicas must be at least 2, got {}",
                self.max_parallel_replicas
            );
        }
        if self.stale_ceiling_factor == 0 {
            bail!("stale_ceiling_factor must be at least 1");
        }
        if self.event_buffer == 0 {
            bail!("event_buffer must be at least 1");
        }
        let t = &self.thresholds;
        if !(t.excellent_ms <= t.good_ms
            && t.good_ms <= t.acceptable_ms
            && t.acceptable_ms <= t.slow_ms
            && t.slow_ms <= t.critical_ms)
        {
            bail!("performance thresholds must be ordered excellent <= good <= acceptable <= slow <= critical");
        }
        Ok(())
    }
}

/// Named timeout budgets from the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyClass {
    Fast,
    Default,
    Slow,
}

/// Per-call overrides; unset fields fall back to [`CommsConfig`]
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub latency_class: Option<LatencyClass>,
    pub enable_cache: Option<bool>,
    pub enable_fallback: Option<bool>,
    pub priority: Option<Priority>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub backoff_multiplier: Option<f64>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fast() -> Self {
        Self {
            latency_class: Some(LatencyClass::Fast),
            ..Self::default()
        }
    }

    pub fn slow() -> Self {
        Self {
            latency_class: Some(LatencyClass::Slow),
            ..Self::default()
        }
    }

    pub fn critical() -> Self {
        Self {
            priority: Some(Priority::Critical),
            ..Self::default()
        }
    }

    pub fn no_cache() -> Self {
        Self {
            enable_cache: Some(false),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.enable_fallback = Some(enabled);
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.enable_cache = Some(enabled);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = Some(multiplier);
        self
    }

    /// Merge with process defaults into the immutable per-call config
    pub fn resolve(&self, defaults: &CommsConfig) -> CallConfig {
        let timeout = self.timeout.unwrap_or_else(|| match self.latency_class {
            Some(LatencyClass::Fast) => defaults.fast_timeout(),
            Some(LatencyClass::Slow) => defaults.slow_timeout(),
            Some(LatencyClass::Default) | None => defaults.default_timeout(),
        });

        CallConfig {
            timeout,
            enable_cache: self.enable_cache.unwrap_or(defaults.cache_enabled),
            enable_fallback: self.enable_fallback.unwrap_or(true),
            priority: self.priority.unwrap_or_default(),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries).max(1),
            retry_delay: self.retry_delay.unwrap_or_else(|| defaults.retry_delay()),
            backoff_multiplier: self
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier)
                .max(1.0),
        }
    }
}

/// Fully resolved configuration of one call
#[derive(Debug, Clone, PartialEq)]
pub struct CallConfig {
    pub timeout: Duration,
    pub enable_cache: bool,
    pub enable_fallback: bool,
    pub priority: Priority,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
}

/// Loads [`CommsConfig`] from a TOML file plus environment overrides
pub struct ConfigLoader {
    path: Option<PathBuf>,
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            path: None,
            env_prefix: "COMMS_".to_string(),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn load(&self) -> Result<CommsConfig> {
        let mut config = match &self.path {
            Some(path) => Self::load_file(path)?,
            None => {
                debug!("No config file given, starting from defaults");
                CommsConfig::default()
            }
        };

        self.apply_env_overrides(&mut config)?;
        config.validate().context("Invalid communication config")?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<CommsConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: CommsConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;
        info!("Loaded communication config from: {}", path.display());
        Ok(config)
    }

    fn apply_env_overrides(&self, config: &mut CommsConfig) -> Result<()> {
        macro_rules! override_field {
            ($($name:literal => $field:expr),* $(,)?) => {
                $(
                    let key = format!("{}{}", self.env_prefix, $name);
                    if let Ok(raw) = env::var(&key) {
                        $field = raw
                            .trim()
                            .parse()
                            .with_context(|| format!("Invalid value for {key}: {raw}"))?;
                        debug!(key = %key, "Applied environment override");
                    }
                )*
            };
        }

        override_field! {
            "DEFAULT_TIMEOUT_MS" => config.default_timeout_ms,
            "FAST_TIMEOUT_MS" => config.fast_timeout_ms,
            "SLOW_TIMEOUT_MS" => config.slow_timeout_ms,
            "MAX_RETRIES" => config.max_retries,
            "RETRY_DELAY_MS" => config.retry_delay_ms,
            "BACKOFF_MULTIPLIER" => config.backoff_multiplier,
            "CIRCUIT_BREAKER_THRESHOLD" => config.circuit_breaker_threshold,
            "CIRCUIT_BREAKER_WINDOW_MS" => config.circuit_breaker_window_ms,
            "CIRCUIT_BREAKER_RECOVERY_MS" => config.circuit_breaker_recovery_ms,
            "CACHE_ENABLED" => config.cache_enabled,
            "CACHE_TTL_MS" => config.cache_ttl_ms,
            "CACHE_SWEEP_INTERVAL_MS" => config.cache_sweep_interval_ms,
            "BATCH_MAX_SIZE" => config.batch_max_size,
            "BATCH_WINDOW_MS" => config.batch_window_ms,
            "STALE_CEILING_FACTOR" => config.stale_ceiling_factor,
            "MAX_PARALLEL_REPLICAS" => config.max_parallel_replicas,
            "SUMMARY_INTERVAL_MS" => config.summary_interval_ms,
            "EVENT_BUFFER" => config.event_buffer,
            "EXCELLENT_THRESHOLD_MS" => config.thresholds.excellent_ms,
            "GOOD_THRESHOLD_MS" => config.thresholds.good_ms,
            "ACCEPTABLE_THRESHOLD_MS" => config.thresholds.acceptable_ms,
            "SLOW_THRESHOLD_MS" => config.thresholds.slow_ms,
            "CRITICAL_THRESHOLD_MS" => config.thresholds.critical_ms,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CommsConfig::default();
        config.validate().expect("Test operation should succeed");
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert_eq!(config.circuit_breaker_recovery(), Duration::from_secs(30));
        assert_eq!(config.thresholds.slow_ms, 5000);
        assert_eq!(config.thresholds.critical_ms, 10_000);
    }

    #[test]
    fn test_resolve_merges_overrides() {
        let defaults = CommsConfig::default();

        let resolved = CallOptions::new().resolve(&defaults);
        assert_eq!(resolved.timeout, defaults.default_timeout());
        assert_eq!(resolved.max_retries, 3);
        assert!(resolved.enable_cache);
        assert!(resolved.enable_fallback);
        assert_eq!(resolved.priority, Priority::Normal);

        let resolved = CallOptions::fast()
            .with_max_retries(5)
            .with_fallback(false)
            .resolve(&defaults);
        assert_eq!(resolved.timeout, defaults.fast_timeout());
        assert_eq!(resolved.max_retries, 5);
        assert!(!resolved.enable_fallback);

        let resolved = CallOptions::slow()
            .with_timeout(Duration::from_millis(42))
            .resolve(&defaults);
        assert_eq!(resolved.timeout, Duration::from_millis(42));
    }

    #[test]
    fn test_validate_rejects_unordered_thresholds() {
        let mut config = CommsConfig::default();
        config.thresholds.slow_ms = 20_000;
        assert!(config.validate().is_err());

        let mut config = CommsConfig::default();
        config.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_single_replica_fan_out() {
        let config = CommsConfig {
            max_parallel_replicas: 1,
            ..CommsConfig::default()
        };
        let error = config.validate().expect_err("Test operation should fail");
        assert!(error.to_string().contains("max_parallel_replicas"));

        let config = CommsConfig {
            max_parallel_replicas: 2,
            ..CommsConfig::default()
        };
        config.validate().expect("Test operation should succeed");
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("Test operation should succeed");
        writeln!(
            file,
            r#"
max_retries = 4
cache_ttl_ms = 5000

[thresholds]
slow_ms = 2000
critical_ms = 4000
"#
        )
        .expect("Test operation should succeed");

        let config = ConfigLoader::new()
            .with_path(file.path())
            .with_env_prefix("COMMS_TEST_UNSET_")
            .load()
            .expect("Test operation should succeed");

        assert_eq!(config.max_retries, 4);
        assert_eq!(config.cache_ttl(), Duration::from_millis(5000));
        assert_eq!(config.thresholds.slow_ms, 2000);
        // untouched fields keep their defaults
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert_eq!(config.thresholds.excellent_ms, 100);
    }

    #[test]
    fn test_env_override_wins_over_defaults() {
        // unique prefix so parallel tests never observe this variable
        env::set_var("COMMS_ENV_TEST_MAX_RETRIES", "7");
        let config = ConfigLoader::new()
            .with_env_prefix("COMMS_ENV_TEST_")
            .load()
            .expect("Test operation should succeed");
        env::remove_var("COMMS_ENV_TEST_MAX_RETRIES");

        assert_eq!(config.max_retries, 7);
    }

    #[test]
    fn test_env_overrides_cover_tuning_fields() {
        let vars = [
            ("COMMS_TUNING_TEST_STALE_CEILING_FACTOR", "4"),
            ("COMMS_TUNING_TEST_MAX_PARALLEL_REPLICAS", "5"),
            ("COMMS_TUNING_TEST_EVENT_BUFFER", "64"),
            ("COMMS_TUNING_TEST_EXCELLENT_THRESHOLD_MS", "50"),
            ("COMMS_TUNING_TEST_GOOD_THRESHOLD_MS", "200"),
            ("COMMS_TUNING_TEST_ACCEPTABLE_THRESHOLD_MS", "800"),
        ];
        for (key, value) in vars {
            env::set_var(key, value);
        }
        let config = ConfigLoader::new()
            .with_env_prefix("COMMS_TUNING_TEST_")
            .load()
            .expect("Test operation should succeed");
        for (key, _) in vars {
            env::remove_var(key);
        }

        assert_eq!(config.stale_ceiling_factor, 4);
        assert_eq!(config.max_parallel_replicas, 5);
        assert_eq!(config.event_buffer, 64);
        assert_eq!(config.thresholds.excellent_ms, 50);
        assert_eq!(config.thresholds.good_ms, 200);
        assert_eq!(config.thresholds.acceptable_ms, 800);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        env::set_var("COMMS_BAD_TEST_CACHE_TTL_MS", "soon");
        let result = ConfigLoader::new()
            .with_env_prefix("COMMS_BAD_TEST_")
            .load();
        env::remove_var("COMMS_BAD_TEST_CACHE_TTL_MS");

        assert!(result.is_err());
    }
}
