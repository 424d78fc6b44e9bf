//! Policy configuration.
//!
//! A [`PolicyConfig`] is the immutable field set of one named policy. It is validated when built,
//! whether through [`PolicyConfig::builder`] or through serde, so an invalid policy never reaches
//! the executor.
//!
//! Durations are written as integer milliseconds with a `_ms` suffix when (de)serialized. A bare
//! [`PolicyConfig`] fills missing fields from the defaults; inside a [`ResilienceConfig`] they come
//! from the preset of the same name, so a partial `database` entry keeps its 5s timeout:
//!
//! ```json
//! { "policies": { "payments": { "max_attempts": 3, "timeout_ms": 2000 } } }
//! ```

use crate::backoff::Backoff;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::jitter::Jitter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// `Duration` as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

const DEFAULT_MAX_ATTEMPTS: u32 = 4;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(200);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DATABASE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_BREAK_DURATION: Duration = Duration::from_secs(30);

/// Validated settings of one policy: retry schedule, per-attempt timeout and breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPolicyConfig", into = "RawPolicyConfig")]
pub struct PolicyConfig {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    timeout: Duration,
    failure_threshold: u32,
    break_duration: Duration,
    retry_on_timeout: bool,
    jitter: Jitter,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_MULTIPLIER,
            timeout: DEFAULT_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            break_duration: DEFAULT_BREAK_DURATION,
            retry_on_timeout: true,
            jitter: Jitter::None,
        }
    }
}

impl PolicyConfig {
    pub fn builder() -> PolicyConfigBuilder {
        PolicyConfigBuilder { config: Self::default() }
    }

    /// Preset for outbound HTTP calls.
    pub fn http() -> Self {
        Self { timeout: DEFAULT_TIMEOUT, ..Self::default() }
    }

    /// Preset for database calls: same retry schedule, tighter timeout.
    pub fn database() -> Self {
        Self { timeout: DATABASE_TIMEOUT, ..Self::default() }
    }

    /// Built-in settings for `name`: the `http` and `database` presets, the defaults otherwise.
    pub fn preset(name: &str) -> Self {
        match name {
            "http" => Self::http(),
            "database" => Self::database(),
            _ => Self::default(),
        }
    }

    /// Start a builder from this configuration.
    pub fn to_builder(&self) -> PolicyConfigBuilder {
        PolicyConfigBuilder { config: self.clone() }
    }

    /// Check every field. Builders and deserialization call this; it is public for configs
    /// assembled by hand in tests.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(self.max_attempts));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.backoff_multiplier));
        }
        if self.max_delay.is_zero() {
            return Err(ConfigError::ZeroMaxDelay);
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::MaxDelayBelowInitial {
                initial: self.initial_delay,
                max: self.max_delay,
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(self.timeout));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold(self.failure_threshold));
        }
        if self.break_duration.is_zero() {
            return Err(ConfigError::ZeroBreakDuration);
        }
        Ok(())
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    /// Per-attempt time budget.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn break_duration(&self) -> Duration {
        self.break_duration
    }

    /// Whether a timed-out attempt may be retried.
    pub fn retry_on_timeout(&self) -> bool {
        self.retry_on_timeout
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    /// Exponential backoff described by this config.
    pub fn backoff(&self) -> Result<Backoff, ConfigError> {
        Backoff::exponential(self.initial_delay)
            .with_multiplier(self.backoff_multiplier)?
            .with_max(self.max_delay)
    }

    pub fn breaker(&self) -> Result<CircuitBreakerConfig, ConfigError> {
        CircuitBreakerConfig::new(self.failure_threshold, self.break_duration)
    }
}

/// Builder for [`PolicyConfig`]. Unset fields keep their defaults.
#[derive(Debug, Clone)]
pub struct PolicyConfigBuilder {
    config: PolicyConfig,
}

impl PolicyConfigBuilder {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn break_duration(mut self, duration: Duration) -> Self {
        self.config.break_duration = duration;
        self
    }

    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.config.retry_on_timeout = retry;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.config.jitter = jitter;
        self
    }

    pub fn build(self) -> Result<PolicyConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Wire form of [`PolicyConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawPolicyConfig {
    max_attempts: u32,
    #[serde(with = "millis")]
    initial_delay_ms: Duration,
    #[serde(with = "millis")]
    max_delay_ms: Duration,
    backoff_multiplier: f64,
    #[serde(with = "millis")]
    timeout_ms: Duration,
    failure_threshold: u32,
    #[serde(with = "millis")]
    break_duration_ms: Duration,
    retry_on_timeout: bool,
    jitter: Jitter,
}

impl Default for RawPolicyConfig {
    fn default() -> Self {
        PolicyConfig::default().into()
    }
}

impl From<PolicyConfig> for RawPolicyConfig {
    fn from(config: PolicyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay_ms: config.initial_delay,
            max_delay_ms: config.max_delay,
            backoff_multiplier: config.backoff_multiplier,
            timeout_ms: config.timeout,
            failure_threshold: config.failure_threshold,
            break_duration_ms: config.break_duration,
            retry_on_timeout: config.retry_on_timeout,
            jitter: config.jitter,
        }
    }
}

impl TryFrom<RawPolicyConfig> for PolicyConfig {
    type Error = ConfigError;

    fn try_from(raw: RawPolicyConfig) -> Result<Self, Self::Error> {
        let config = PolicyConfig {
            max_attempts: raw.max_attempts,
            initial_delay: raw.initial_delay_ms,
            max_delay: raw.max_delay_ms,
            backoff_multiplier: raw.backoff_multiplier,
            timeout: raw.timeout_ms,
            failure_threshold: raw.failure_threshold,
            break_duration: raw.break_duration_ms,
            retry_on_timeout: raw.retry_on_timeout,
            jitter: raw.jitter,
        };
        config.validate()?;
        Ok(config)
    }
}

/// A set of named policies, typically loaded from a settings file.
///
/// Names missing from the file fall back to the built-in `default`, `http` and `database`
/// presets when the orchestrator is built from this config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResilienceConfig")]
pub struct ResilienceConfig {
    pub policies: BTreeMap<String, PolicyConfig>,
}

/// Wire form of [`ResilienceConfig`]: every policy is a partial overlay on its preset.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawResilienceConfig {
    policies: BTreeMap<String, PolicyOverlay>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PolicyOverlay {
    max_attempts: Option<u32>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    timeout_ms: Option<u64>,
    failure_threshold: Option<u32>,
    break_duration_ms: Option<u64>,
    retry_on_timeout: Option<bool>,
    jitter: Option<Jitter>,
}

impl PolicyOverlay {
    fn apply(self, base: PolicyConfig) -> Result<PolicyConfig, ConfigError> {
        let config = PolicyConfig {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            initial_delay: self.initial_delay_ms.map_or(base.initial_delay, Duration::from_millis),
            max_delay: self.max_delay_ms.map_or(base.max_delay, Duration::from_millis),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(base.backoff_multiplier),
            timeout: self.timeout_ms.map_or(base.timeout, Duration::from_millis),
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            break_duration: self.break_duration_ms.map_or(base.break_duration, Duration::from_millis),
            retry_on_timeout: self.retry_on_timeout.unwrap_or(base.retry_on_timeout),
            jitter: self.jitter.unwrap_or(base.jitter),
        };
        config.validate()?;
        Ok(config)
    }
}

impl TryFrom<RawResilienceConfig> for ResilienceConfig {
    type Error = ConfigError;

    fn try_from(raw: RawResilienceConfig) -> Result<Self, Self::Error> {
        let policies = raw
            .policies
            .into_iter()
            .map(|(name, overlay)| {
                let config = overlay.apply(PolicyConfig::preset(&name))?;
                Ok((name, config))
            })
            .collect::<Result<_, ConfigError>>()?;
        Ok(Self { policies })
    }
}

impl ResilienceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a policy.
    pub fn with_policy(mut self, name: impl Into<String>, config: PolicyConfig) -> Self {
        self.policies.insert(name.into(), config);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PolicyConfig> {
        self.policies.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PolicyConfig::default();
        assert_eq!(config.max_attempts(), 4);
        assert_eq!(config.initial_delay(), Duration::from_millis(200));
        assert_eq!(config.max_delay(), Duration::from_secs(5));
        assert_eq!(config.backoff_multiplier(), 2.0);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.failure_threshold(), 5);
        assert_eq!(config.break_duration(), Duration::from_secs(30));
        assert!(config.retry_on_timeout());
        assert_eq!(config.jitter(), Jitter::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn presets_differ_only_in_timeout() {
        assert_eq!(PolicyConfig::http().timeout(), Duration::from_secs(30));
        assert_eq!(PolicyConfig::database().timeout(), Duration::from_secs(5));
        assert_eq!(
            PolicyConfig::database().to_builder().timeout(Duration::from_secs(30)).build().unwrap(),
            PolicyConfig::http()
        );
    }

    #[test]
    fn builder_rejects_invalid_values() {
        assert_eq!(
            PolicyConfig::builder().max_attempts(0).build().unwrap_err(),
            ConfigError::InvalidMaxAttempts(0)
        );
        assert_eq!(
            PolicyConfig::builder().backoff_multiplier(0.5).build().unwrap_err(),
            ConfigError::InvalidMultiplier(0.5)
        );
        assert!(matches!(
            PolicyConfig::builder().backoff_multiplier(f64::NAN).build(),
            Err(ConfigError::InvalidMultiplier(_))
        ));
        assert_eq!(
            PolicyConfig::builder()
                .initial_delay(Duration::from_secs(2))
                .max_delay(Duration::from_secs(1))
                .build()
                .unwrap_err(),
            ConfigError::MaxDelayBelowInitial {
                initial: Duration::from_secs(2),
                max: Duration::from_secs(1)
            }
        );
        assert_eq!(
            PolicyConfig::builder().timeout(Duration::ZERO).build().unwrap_err(),
            ConfigError::InvalidTimeout(Duration::ZERO)
        );
        assert_eq!(
            PolicyConfig::builder().failure_threshold(0).build().unwrap_err(),
            ConfigError::InvalidFailureThreshold(0)
        );
        assert_eq!(
            PolicyConfig::builder().break_duration(Duration::ZERO).build().unwrap_err(),
            ConfigError::ZeroBreakDuration
        );
    }

    #[test]
    fn single_attempt_is_valid() {
        let config = PolicyConfig::builder().max_attempts(1).build().unwrap();
        assert_eq!(config.max_attempts(), 1);
    }

    #[test]
    fn backoff_follows_config() {
        let backoff = PolicyConfig::builder()
            .initial_delay(Duration::from_millis(100))
            .backoff_multiplier(3.0)
            .max_delay(Duration::from_secs(1))
            .build()
            .unwrap()
            .backoff()
            .unwrap();
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(300));
        assert_eq!(backoff.delay(2), Duration::from_millis(900));
        assert_eq!(backoff.delay(3), Duration::from_secs(1));
    }

    #[test]
    fn deserializes_partial_policy_with_defaults() {
        let config: PolicyConfig =
            serde_json::from_str(r#"{ "max_attempts": 2, "timeout_ms": 1500, "jitter": "full" }"#)
                .unwrap();
        assert_eq!(config.max_attempts(), 2);
        assert_eq!(config.timeout(), Duration::from_millis(1500));
        assert_eq!(config.jitter(), Jitter::Full);
        assert_eq!(config.initial_delay(), Duration::from_millis(200));
        assert_eq!(config.failure_threshold(), 5);
    }

    #[test]
    fn deserialization_validates() {
        let err = serde_json::from_str::<PolicyConfig>(r#"{ "max_attempts": 0 }"#).unwrap_err();
        assert!(err.to_string().contains("max_attempts"));

        let err = serde_json::from_str::<PolicyConfig>(r#"{ "timeout": 5 }"#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn serializes_durations_as_millis() {
        let value = serde_json::to_value(PolicyConfig::database()).unwrap();
        assert_eq!(value["timeout_ms"], 5000);
        assert_eq!(value["initial_delay_ms"], 200);
        assert_eq!(value["jitter"], "none");
    }

    #[test]
    fn resilience_config_loads_named_policies() {
        let config: ResilienceConfig = serde_json::from_str(
            r#"{ "policies": { "payments": { "failure_threshold": 3 }, "search": {} } }"#,
        )
        .unwrap();
        assert_eq!(config.policies.len(), 2);
        assert_eq!(config.get("payments").map(|p| p.failure_threshold()), Some(3));
        assert_eq!(config.get("search"), Some(&PolicyConfig::default()));

        let empty: ResilienceConfig = serde_json::from_str("{}").unwrap();
        assert!(empty.policies.is_empty());
    }

    #[test]
    fn partial_entries_overlay_the_preset_of_the_same_name() {
        let config: ResilienceConfig = serde_json::from_str(
            r#"{ "policies": { "database": { "max_attempts": 3 }, "http": { "timeout_ms": 800 } } }"#,
        )
        .unwrap();

        let database = config.get("database").unwrap();
        assert_eq!(database.max_attempts(), 3);
        assert_eq!(database.timeout(), Duration::from_secs(5));
        assert_eq!(database, &PolicyConfig::database().to_builder().max_attempts(3).build().unwrap());
        assert_eq!(config.get("http").map(|p| p.timeout()), Some(Duration::from_millis(800)));
    }

    #[test]
    fn resilience_config_rejects_unknown_keys() {
        let err = serde_json::from_str::<ResilienceConfig>(r#"{ "polices": {} }"#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
        let err = serde_json::from_str::<ResilienceConfig>(r#"{ "policies": { "x": { "retries": 2 } } }"#)
            .unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn serialized_config_loads_back_unchanged() {
        let config = ResilienceConfig::new()
            .with_policy("database", PolicyConfig::database())
            .with_policy("search", PolicyConfig::builder().jitter(Jitter::Equal).build().unwrap());
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<ResilienceConfig>(&json).unwrap(), config);
    }
}
