//! Engine configuration (checkout window, deadlines, retries, sweeper cadence).

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Upper bound for the checkout window and tombstone retention.
const MAX_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Bounded exponential backoff for `ConcurrentModification` retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let pow = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(pow)
            .min(self.max_backoff)
    }
}

/// Reservation sweeper settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweeperConfig {
    /// Period of the expiry scan.
    pub interval: Duration,
    /// Maximum holds compensated per scan.
    pub batch_size: usize,
    /// Age after which a claimed (consuming) hold is considered stalled.
    pub consume_grace: Duration,
    /// Concurrent compensations spawned from expiry notifications.
    pub max_concurrent: usize,
    /// Capacity of the expiry notification queue; overflow falls back to the scan.
    pub notify_capacity: usize,
    /// Deadline for one expiry compensation.
    pub task_timeout: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 256,
            consume_grace: Duration::from_secs(120),
            max_concurrent: 8,
            notify_capacity: 1024,
            task_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Lifetime of a hold measured from `created_at`.
    pub checkout_window: Duration,
    /// Deadline for each public operation, retries included.
    pub op_timeout: Duration,
    pub retry: RetryPolicy,
    pub sweeper: SweeperConfig,
    /// How long consumed/released records are kept for idempotent retries.
    pub tombstone_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkout_window: Duration::from_secs(15 * 60),
            op_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            sweeper: SweeperConfig::default(),
            tombstone_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `STOCK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let num = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(key) {
                None => Ok(None),
                Some(raw) => raw.trim().parse::<u64>().map(Some).map_err(|e| ConfigError::Invalid {
                    key,
                    value: raw,
                    reason: e.to_string(),
                }),
            }
        };

        if let Some(v) = num("STOCK_CHECKOUT_WINDOW_SECS")? {
            cfg.checkout_window = Duration::from_secs(v);
        }
        if let Some(v) = num("STOCK_OP_TIMEOUT_MS")? {
            cfg.op_timeout = Duration::from_millis(v);
        }
        if let Some(v) = num("STOCK_RETRY_MAX_ATTEMPTS")? {
            cfg.retry.max_attempts = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = num("STOCK_RETRY_BASE_MS")? {
            cfg.retry.base_backoff = Duration::from_millis(v);
        }
        if let Some(v) = num("STOCK_SWEEP_INTERVAL_MS")? {
            cfg.sweeper.interval = Duration::from_millis(v);
        }
        if let Some(v) = num("STOCK_SWEEP_BATCH")? {
            cfg.sweeper.batch_size = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = num("STOCK_CONSUME_GRACE_SECS")? {
            cfg.sweeper.consume_grace = Duration::from_secs(v);
        }
        if let Some(v) = num("STOCK_TOMBSTONE_RETENTION_SECS")? {
            cfg.tombstone_retention = Duration::from_secs(v);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checkout_window.is_zero() {
            return Err(ConfigError::Inconsistent("checkout window must be positive".into()));
        }
        if self.checkout_window > MAX_WINDOW || self.tombstone_retention > MAX_WINDOW {
            return Err(ConfigError::Inconsistent(format!(
                "checkout window and tombstone retention must not exceed {MAX_WINDOW:?}"
            )));
        }
        if self.op_timeout.is_zero() {
            return Err(ConfigError::Inconsistent("operation timeout must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Inconsistent("retry attempts must be at least 1".into()));
        }
        if self.sweeper.interval.is_zero() || self.sweeper.batch_size == 0 {
            return Err(ConfigError::Inconsistent(
                "sweeper interval and batch size must be positive".into(),
            ));
        }
        if self.sweeper.task_timeout.is_zero() {
            return Err(ConfigError::Inconsistent("sweeper task timeout must be positive".into()));
        }
        if self.sweeper.max_concurrent == 0 || self.sweeper.notify_capacity == 0 {
            return Err(ConfigError::Inconsistent(
                "sweeper concurrency and queue capacity must be positive".into(),
            ));
        }
        // A claim younger than one operation deadline may still be committing.
        if self.sweeper.consume_grace <= self.op_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "consume grace ({:?}) must exceed the operation timeout ({:?})",
                self.sweeper.consume_grace, self.op_timeout
            )));
        }
        Ok(())
    }

    pub fn checkout_window_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.checkout_window).unwrap_or(chrono::Duration::MAX)
    }

    pub fn tombstone_retention_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.tombstone_retention).unwrap_or(chrono::Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.checkout_window, Duration::from_secs(900));
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("STOCK_CHECKOUT_WINDOW_SECS", "60"),
            ("STOCK_SWEEP_INTERVAL_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(cfg.checkout_window, Duration::from_secs(60));
        assert_eq!(cfg.sweeper.interval, Duration::from_millis(250));
    }

    #[test]
    fn non_numeric_value_is_reported_with_key() {
        let err = EngineConfig::from_lookup(lookup(&[("STOCK_OP_TIMEOUT_MS", "soon")])).unwrap_err();
        match err {
            ConfigError::Invalid { key, .. } => assert_eq!(key, "STOCK_OP_TIMEOUT_MS"),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn grace_must_exceed_timeout() {
        let err = EngineConfig::from_lookup(lookup(&[
            ("STOCK_OP_TIMEOUT_MS", "10000"),
            ("STOCK_CONSUME_GRACE_SECS", "5"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(25));
        assert_eq!(policy.backoff(2), Duration::from_millis(50));
        assert_eq!(policy.backoff(3), Duration::from_millis(100));
        assert_eq!(policy.backoff(30), Duration::from_secs(1));
    }
}
