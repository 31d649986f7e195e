//! Orchestrator configuration.
//!
//! Controls lock TTLs, idempotency-binding lifetime, compensation-failure
//! retention, and the queue-level retry budget for sagas.

use std::time::Duration;

/// Environment variable overriding the default resource lock TTL.
pub const LOCK_TTL_ENV: &str = "TRANSACTION_LOCK_TTL_SECONDS";

/// Transaction orchestrator configuration.
///
/// Two retry knobs exist on purpose and are independent: `default_attempts`
/// is the queue-level budget consumed automatically on failure, while
/// quarantined sagas are only ever re-run by an operator requeueing them.
#[derive(Clone, Debug)]
pub struct SagaConfig {
    /// TTL for resource lock keys. Bounds orphaned-lock lifetime after a
    /// worker crash, and therefore the effective per-saga execution budget.
    pub lock_ttl: Duration,
    /// Lifetime of an idempotency-key binding.
    pub idempotency_ttl: Duration,
    /// Retention window for compensation-failure records.
    pub compensation_retention: Duration,
    /// Queue-level attempts per saga. The default of 1 sends a failed saga
    /// straight to quarantine instead of blindly retrying it.
    pub default_attempts: u32,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            idempotency_ttl: Duration::from_secs(3600),
            compensation_retention: Duration::from_secs(7 * 24 * 3600),
            default_attempts: 1,
        }
    }
}

impl SagaConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration from the process environment.
    ///
    /// Reads `TRANSACTION_LOCK_TTL_SECONDS`; unset or unparsable values fall
    /// back to the 30 second default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(LOCK_TTL_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.lock_ttl = Duration::from_secs(secs),
                _ => {
                    tracing::warn!(value = %raw, "ignoring unparsable {}", LOCK_TTL_ENV);
                }
            }
        }
        config
    }

    /// Set the resource lock TTL.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Set the idempotency-binding TTL.
    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    /// Set the compensation-failure retention window.
    pub fn with_compensation_retention(mut self, retention: Duration) -> Self {
        self.compensation_retention = retention;
        self
    }

    /// Set the queue-level attempt budget for newly enqueued sagas.
    pub fn with_default_attempts(mut self, attempts: u32) -> Self {
        self.default_attempts = attempts.max(1);
        self
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SagaConfig::default();
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
        assert_eq!(config.idempotency_ttl, Duration::from_secs(3600));
        assert_eq!(config.compensation_retention, Duration::from_secs(604800));
        assert_eq!(config.default_attempts, 1);
    }

    #[test]
    fn test_config_builder() {
        let config = SagaConfig::new()
            .with_lock_ttl(Duration::from_secs(5))
            .with_idempotency_ttl(Duration::from_secs(60))
            .with_compensation_retention(Duration::from_secs(3600))
            .with_default_attempts(3);

        assert_eq!(config.lock_ttl, Duration::from_secs(5));
        assert_eq!(config.idempotency_ttl, Duration::from_secs(60));
        assert_eq!(config.compensation_retention, Duration::from_secs(3600));
        assert_eq!(config.default_attempts, 3);
    }

    #[test]
    fn test_config_attempts_floor() {
        let config = SagaConfig::new().with_default_attempts(0);
        assert_eq!(config.default_attempts, 1);
    }

    #[test]
    fn test_config_from_env() {
        std::env::set_var(LOCK_TTL_ENV, "12");
        let config = SagaConfig::from_env();
        assert_eq!(config.lock_ttl, Duration::from_secs(12));

        std::env::set_var(LOCK_TTL_ENV, "not-a-number");
        let config = SagaConfig::from_env();
        assert_eq!(config.lock_ttl, Duration::from_secs(30));

        std::env::remove_var(LOCK_TTL_ENV);
        let config = SagaConfig::from_env();
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
    }
}
